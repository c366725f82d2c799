pub mod backend;
pub mod batch;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod storage;
pub mod usage;
pub mod worker;
