pub mod allowlist;
pub mod approval_api;
pub mod approver;
pub mod config;
pub mod decisions;
pub mod error;
pub mod events;
pub mod proxy;
pub mod queue;
pub mod static_config;
pub mod token_api;
pub mod tokens;

pub use config::Args;
