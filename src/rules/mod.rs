//! Forwarding rules: the persistent model and the in-memory lookup cache.

pub mod cache;
pub mod model;

pub use cache::TaskCache;
pub use model::{ForwardingRule, RuleStatistics};
