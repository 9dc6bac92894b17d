pub mod config;
pub mod engine;
pub mod error;
pub mod match_store;
pub mod metrics;
pub mod protocol;
pub mod replay;
pub mod sandbox;
