pub mod bridge;
pub mod cli;
pub mod types;

pub use bridge::{BridgeConfig, BrokerSettings, PoolerSettings, PoolerTemplate};
pub use types::{LogLevel, PoolMode};
