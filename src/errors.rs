use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// -----------------------------------------------------------------------------
// ----- SessionError ----------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("broker refused authentication for target '{target}'")]
    Authentication { target: String },

    #[error("broker unavailable after {attempts} attempts: {last}")]
    Transient { attempts: u32, last: String },

    #[error("unexpected broker output: {0}")]
    Protocol(String),
}

// -----------------------------------------------------------------------------
// ----- ConfigError -----------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid or missing field '{0}'")]
    InvalidField(String),

    #[error("field '{field}' out of range: {value} (allowed {allowed})")]
    OutOfRange {
        field: &'static str,
        value: i64,
        allowed: &'static str,
    },

    #[error("read error for {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("toml parse error: {source}")]
    Toml { source: toml::de::Error },

    #[error("atomic replace of {path:?} failed: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

// -----------------------------------------------------------------------------
// ----- ProcessError ----------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn pooler '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("pooler did not become ready on {addr} within {timeout:?}")]
    StartupTimeout { addr: SocketAddr, timeout: Duration },

    #[error("pooler exited unexpectedly ({status})")]
    Exited { status: String },

    #[error("admin channel at {path:?} unresponsive: {reason}")]
    AdminUnresponsive { path: PathBuf, reason: String },

    #[error("pooler is not running")]
    NotRunning,

    #[error("restart ceiling reached after {count} consecutive crashes")]
    RestartCeiling { count: u32 },
}

// -----------------------------------------------------------------------------
// ----- BridgeError -----------------------------------------------------------

/// Top-level error for the bridge. The variant decides the process exit code
/// so operators can distinguish failure classes from scripts.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl BridgeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::Config(_) => 2,
            BridgeError::Session(_) => 3,
            BridgeError::Process(_) => 4,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_class() {
        let config = BridgeError::from(ConfigError::InvalidField("listen.port".into()));
        let session = BridgeError::from(SessionError::Authentication {
            target: "db1".into(),
        });
        let process = BridgeError::from(ProcessError::NotRunning);

        assert_eq!(config.exit_code(), 2);
        assert_eq!(session.exit_code(), 3);
        assert_eq!(process.exit_code(), 4);
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
