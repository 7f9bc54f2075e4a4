pub mod agent;
pub mod broker;
pub mod config;
pub mod execution;
pub mod retention;
pub mod streaming;
