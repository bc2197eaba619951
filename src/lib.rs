pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod gateway;
pub mod kernel;
pub mod process;
pub mod shutdown;
pub mod store;
