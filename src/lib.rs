//! Bookmark content pipeline
//!
//! Asynchronous processing behind a bookmark service: a job broker with
//! deduplication, priorities, leases and retry backoff, and the workers that
//! archive pages, index their text and run library-wide maintenance scans.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod workers;
