pub mod attachment;
pub mod audit;
pub mod bus;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod transport;
pub mod types;
