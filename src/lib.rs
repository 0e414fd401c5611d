pub mod config;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod transport;
pub mod worker;
