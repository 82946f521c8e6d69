pub mod bookmark;
pub mod job;
pub mod search;
