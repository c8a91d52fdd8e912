pub mod client;
pub mod config;
pub mod logger;
pub mod runtime;
pub mod storage;
