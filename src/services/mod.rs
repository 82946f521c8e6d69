pub mod browser;
pub mod dedup;
pub mod extract;
pub mod link_check;
pub mod queue;
pub mod retry;
pub mod search;
pub mod storage;
pub mod text;
pub mod thumbnail;
