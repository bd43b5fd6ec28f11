pub mod app;
pub mod body;
pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod remote;
pub mod server;
pub mod storage;
pub mod sync;
pub mod types;
