pub mod auth;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod errors;
pub mod render;
pub mod supervisor;

pub use bridge::{Bridge, BridgeState};
pub use config::BridgeConfig;
pub use errors::BridgeError;
