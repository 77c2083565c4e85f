pub mod error;

pub mod storage;

pub mod config;
pub mod harness;
pub mod pagecache;
