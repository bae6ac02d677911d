pub mod config;
pub mod dashboard;
pub mod election;
pub mod error;
pub mod manager;
pub mod namespace;
pub mod node;
pub mod producer;
pub mod retry;
pub mod shutdown;
pub mod task;
pub mod worker;
