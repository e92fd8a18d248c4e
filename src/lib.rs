//! Chat Relay: forwards channel posts between chats through a rate-limited
//! worker pipeline.

pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod monitor;
pub mod notify;
pub mod pipeline;
pub mod rate_limit;
pub mod rules;
pub mod store;
pub mod supervisor;
pub mod transport;
