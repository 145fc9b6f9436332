pub mod batch;
pub mod chain;
pub mod chain_config;
pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod notify;
pub mod processor;
pub mod store;
pub mod table;
