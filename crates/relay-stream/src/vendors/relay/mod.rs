//! Relay wire integration: chat endpoints that already emit normalized
//! `data: {"content": ..}` records.
mod adapter;
mod config;

pub use adapter::RelayBackend;
pub use config::RelayBackendConfig;
