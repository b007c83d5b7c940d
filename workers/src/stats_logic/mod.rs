pub mod config;
pub mod coordinator;
pub mod lease;
pub mod logger;
pub mod replay;
pub mod runner;
