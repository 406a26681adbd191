use serde::Deserialize;
use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;

use super::types::PoolMode;
use crate::errors::ConfigError;

// -----------------------------------------------------------------------------
// ----- BridgeConfig ----------------------------------------------------------

/// Fully resolved bridge configuration. Loaded once at startup and passed by
/// reference to the components that need it; nothing mutates it afterwards.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub listen: SocketAddr,
    pub broker: BrokerSettings,
    pub pooler: PoolerSettings,
    pub template: PoolerTemplate,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub command: String,
    pub target: String,
    pub renew_margin: Duration,
    pub connect_attempts: u32,
    pub retry_base: Duration,
    pub attempt_timeout: Duration,
    pub degraded_retry: Duration,
}

#[derive(Debug, Clone)]
pub struct PoolerSettings {
    pub command: String,
    pub workdir: PathBuf,
    pub conf_path: PathBuf,
    pub auth_path: PathBuf,
    pub pid_path: PathBuf,
    pub admin_socket: PathBuf,
    pub startup_timeout: Duration,
    pub reload_timeout: Duration,
    pub stop_grace: Duration,
    pub restart_backoff_base: Duration,
    pub restart_backoff_max: Duration,
    pub healthy_reset: Duration,
    pub max_restarts: u32,
    pub monitor_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct PoolerTemplate {
    pub database: String,
    pub auth_role: String,
    pub pool_mode: PoolMode,
    pub max_client_conn: u32,
    pub default_pool_size: u32,
    pub settings: BTreeMap<String, String>,
}

// -----------------------------------------------------------------------------
// ----- BridgeConfig: Static --------------------------------------------------

impl BridgeConfig {
    pub async fn load(path: &Path) -> Result<BridgeConfig, ConfigError> {
        let raw = fs::read_to_string(path).await.map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        // Relative paths in the file resolve against the config file's own
        // directory, so the bridge behaves the same from any cwd.
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self::parse(&raw, &base)
    }

    pub fn parse(raw: &str, base: &Path) -> Result<BridgeConfig, ConfigError> {
        let doc: BridgeFile = toml::from_str(raw).map_err(|e| ConfigError::Toml { source: e })?;

        let listen_host: IpAddr = doc
            .listen
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidField("listen.host".into()))?;
        let listen = SocketAddr::from((listen_host, doc.listen.port));

        let broker = BrokerSettings {
            command: require("broker.command", doc.broker.command)?,
            target: require("broker.target", doc.broker.target)?,
            renew_margin: duration("broker.renew_margin", doc.broker.renew_margin, "30s")?,
            connect_attempts: doc.broker.connect_attempts.unwrap_or(4),
            retry_base: duration("broker.retry_base", doc.broker.retry_base, "250ms")?,
            attempt_timeout: duration("broker.attempt_timeout", doc.broker.attempt_timeout, "10s")?,
            degraded_retry: duration("broker.degraded_retry", doc.broker.degraded_retry, "15s")?,
        };

        let workdir = resolve(base, doc.pooler.workdir.as_deref().unwrap_or("."));
        let pooler = PoolerSettings {
            command: doc.pooler.command.unwrap_or_else(|| "pgbouncer".into()),
            conf_path: resolve(&workdir, doc.pooler.conf_file.as_deref().unwrap_or("pg_config.ini")),
            auth_path: resolve(&workdir, doc.pooler.auth_file.as_deref().unwrap_or("pg_auth")),
            pid_path: resolve(&workdir, doc.pooler.pid_file.as_deref().unwrap_or("pgboundary.pid")),
            admin_socket: resolve(&workdir, doc.pooler.admin_socket.as_deref().unwrap_or("admin.sock")),
            workdir,
            startup_timeout: duration("pooler.startup_timeout", doc.pooler.startup_timeout, "5s")?,
            reload_timeout: duration("pooler.reload_timeout", doc.pooler.reload_timeout, "2s")?,
            stop_grace: duration("pooler.stop_grace", doc.pooler.stop_grace, "5s")?,
            restart_backoff_base: duration(
                "pooler.restart_backoff_base",
                doc.pooler.restart_backoff_base,
                "500ms",
            )?,
            restart_backoff_max: duration(
                "pooler.restart_backoff_max",
                doc.pooler.restart_backoff_max,
                "30s",
            )?,
            healthy_reset: duration("pooler.healthy_reset", doc.pooler.healthy_reset, "60s")?,
            max_restarts: doc.pooler.max_restarts.unwrap_or(10),
            monitor_interval: duration("pooler.monitor_interval", doc.pooler.monitor_interval, "500ms")?,
        };

        let template = PoolerTemplate {
            database: require("template.database", doc.template.database)?,
            auth_role: require("template.auth_role", doc.template.auth_role)?,
            pool_mode: doc.template.pool_mode.unwrap_or(PoolMode::Transaction),
            max_client_conn: doc.template.max_client_conn.unwrap_or(100),
            default_pool_size: doc.template.default_pool_size.unwrap_or(20),
            settings: doc.template.settings,
        };

        let cfg = BridgeConfig {
            listen,
            broker,
            pooler,
            template,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

// -----------------------------------------------------------------------------
// ----- BridgeConfig: Private -------------------------------------------------

impl BridgeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.port() == 0 {
            return Err(ConfigError::OutOfRange {
                field: "listen.port",
                value: 0,
                allowed: "1..=65535",
            });
        }
        if self.broker.connect_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                field: "broker.connect_attempts",
                value: 0,
                allowed: "1..=100",
            });
        }
        if self.broker.renew_margin.is_zero() {
            return Err(ConfigError::InvalidField("broker.renew_margin".into()));
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: On-disk format ----------------------------------------------

#[derive(Debug, Deserialize)]
struct BridgeFile {
    listen: ListenSection,
    #[serde(default)]
    broker: BrokerSection,
    #[serde(default)]
    pooler: PoolerSection,
    #[serde(default)]
    template: TemplateSection,
}

#[derive(Debug, Deserialize)]
struct ListenSection {
    #[serde(default = "default_listen_host")]
    host: String,
    port: u16,
}

#[derive(Debug, Default, Deserialize)]
struct BrokerSection {
    command: Option<String>,
    target: Option<String>,
    renew_margin: Option<String>,
    connect_attempts: Option<u32>,
    retry_base: Option<String>,
    attempt_timeout: Option<String>,
    degraded_retry: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PoolerSection {
    command: Option<String>,
    workdir: Option<String>,
    conf_file: Option<String>,
    auth_file: Option<String>,
    pid_file: Option<String>,
    admin_socket: Option<String>,
    startup_timeout: Option<String>,
    reload_timeout: Option<String>,
    stop_grace: Option<String>,
    restart_backoff_base: Option<String>,
    restart_backoff_max: Option<String>,
    healthy_reset: Option<String>,
    max_restarts: Option<u32>,
    monitor_interval: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TemplateSection {
    database: Option<String>,
    auth_role: Option<String>,
    pool_mode: Option<PoolMode>,
    max_client_conn: Option<u32>,
    default_pool_size: Option<u32>,
    #[serde(default)]
    settings: BTreeMap<String, String>,
}

fn default_listen_host() -> String {
    "127.0.0.1".into()
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn require(field: &str, value: Option<String>) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::InvalidField(field.into())),
    }
}

fn duration(
    field: &str,
    raw: Option<String>,
    default: &str,
) -> Result<Duration, ConfigError> {
    let text = raw.as_deref().unwrap_or(default);
    humantime::parse_duration(text).map_err(|_| ConfigError::InvalidField(field.into()))
}

fn resolve(base: &Path, raw: &str) -> PathBuf {
    let p = Path::new(raw);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [listen]
        port = 6432

        [broker]
        command = "boundary"
        target = "db1"

        [template]
        database = "appdb"
        auth_role = "app"
    "#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = BridgeConfig::parse(MINIMAL, Path::new("/etc/pgboundary")).unwrap();

        assert_eq!(cfg.listen.port(), 6432);
        assert_eq!(cfg.broker.command, "boundary");
        assert_eq!(cfg.broker.renew_margin, Duration::from_secs(30));
        assert_eq!(cfg.broker.connect_attempts, 4);
        assert_eq!(cfg.pooler.command, "pgbouncer");
        assert_eq!(cfg.template.pool_mode, PoolMode::Transaction);
        assert_eq!(cfg.template.max_client_conn, 100);
    }

    #[test]
    fn resolves_paths_against_config_dir_then_workdir() {
        let raw = r#"
            [listen]
            port = 6432

            [broker]
            command = "boundary"
            target = "db1"

            [pooler]
            workdir = "run"
            conf_file = "pg_config.ini"
            auth_file = "/var/lib/pgboundary/pg_auth"

            [template]
            database = "appdb"
            auth_role = "app"
        "#;
        let cfg = BridgeConfig::parse(raw, Path::new("/etc/pgboundary")).unwrap();

        assert_eq!(cfg.pooler.workdir, PathBuf::from("/etc/pgboundary/run"));
        assert_eq!(
            cfg.pooler.conf_path,
            PathBuf::from("/etc/pgboundary/run/pg_config.ini")
        );
        assert_eq!(
            cfg.pooler.auth_path,
            PathBuf::from("/var/lib/pgboundary/pg_auth")
        );
    }

    #[test]
    fn missing_listen_port_is_a_config_error() {
        let raw = r#"
            [listen]
            host = "127.0.0.1"

            [broker]
            command = "boundary"
            target = "db1"

            [template]
            database = "appdb"
            auth_role = "app"
        "#;
        let err = BridgeConfig::parse(raw, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
    }

    #[test]
    fn missing_broker_target_is_a_config_error() {
        let raw = r#"
            [listen]
            port = 6432

            [broker]
            command = "boundary"

            [template]
            database = "appdb"
            auth_role = "app"
        "#;
        let err = BridgeConfig::parse(raw, Path::new(".")).unwrap_err();
        match err {
            ConfigError::InvalidField(f) => assert_eq!(f, "broker.target"),
            other => panic!("expected InvalidField, got {other:?}"),
        }
    }

    #[test]
    fn human_durations_are_parsed() {
        let raw = r#"
            [listen]
            port = 6432

            [broker]
            command = "boundary"
            target = "db1"
            renew_margin = "1m 30s"
            retry_base = "100ms"

            [template]
            database = "appdb"
            auth_role = "app"
        "#;
        let cfg = BridgeConfig::parse(raw, Path::new(".")).unwrap();
        assert_eq!(cfg.broker.renew_margin, Duration::from_secs(90));
        assert_eq!(cfg.broker.retry_base, Duration::from_millis(100));
    }

    #[test]
    fn bad_duration_is_a_config_error() {
        let raw = r#"
            [listen]
            port = 6432

            [broker]
            command = "boundary"
            target = "db1"
            renew_margin = "soonish"

            [template]
            database = "appdb"
            auth_role = "app"
        "#;
        let err = BridgeConfig::parse(raw, Path::new(".")).unwrap_err();
        match err {
            ConfigError::InvalidField(f) => assert_eq!(f, "broker.renew_margin"),
            other => panic!("expected InvalidField, got {other:?}"),
        }
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
