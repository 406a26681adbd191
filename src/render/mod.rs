use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::broker::Session;
use crate::config::BridgeConfig;
use crate::errors::ConfigError;

// -----------------------------------------------------------------------------
// ----- Render ----------------------------------------------------------------

/// Render the pooler configuration for the current session. Pure: identical
/// inputs produce byte-identical output, so a renewal that changes nothing
/// can be detected by comparing bytes.
pub fn render(cfg: &BridgeConfig, session: &Session) -> Result<String, ConfigError> {
    validate(cfg)?;

    let t = &cfg.template;
    let p = &cfg.pooler;

    let mut out = String::with_capacity(512);
    out.push_str("[databases]\n");
    out.push_str(&format!(
        "{} = host={} port={} dbname={}\n",
        t.database, session.host, session.port, t.database
    ));
    out.push('\n');

    out.push_str("[pgbouncer]\n");
    out.push_str(&format!("listen_addr = {}\n", cfg.listen.ip()));
    out.push_str(&format!("listen_port = {}\n", cfg.listen.port()));
    out.push_str("auth_type = plain\n");
    out.push_str(&format!("auth_file = {}\n", p.auth_path.display()));
    out.push_str(&format!("admin_users = {}\n", t.auth_role));
    out.push_str(&format!("pool_mode = {}\n", t.pool_mode.as_str()));
    out.push_str(&format!("max_client_conn = {}\n", t.max_client_conn));
    out.push_str(&format!("default_pool_size = {}\n", t.default_pool_size));
    out.push_str(&format!(
        "unix_socket_dir = {}\n",
        p.admin_socket
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .display()
    ));

    // Extra template keys pass through verbatim; BTreeMap keeps the order
    // stable so renders stay deterministic.
    for (key, value) in &t.settings {
        out.push_str(&format!("{key} = {value}\n"));
    }

    Ok(out)
}

/// Atomically replace `path` with `text`. The commit must complete before
/// any reload instruction referencing it is issued.
pub fn commit(path: &Path, text: &str) -> Result<(), ConfigError> {
    atomic_write(path, text.as_bytes())
}

// -----------------------------------------------------------------------------
// ----- Validation ------------------------------------------------------------

fn validate(cfg: &BridgeConfig) -> Result<(), ConfigError> {
    if cfg.listen.port() == 0 {
        return Err(ConfigError::OutOfRange {
            field: "listen.port",
            value: 0,
            allowed: "1..=65535",
        });
    }

    let t = &cfg.template;
    if t.database.trim().is_empty() {
        return Err(ConfigError::InvalidField("template.database".into()));
    }
    if t.auth_role.trim().is_empty() {
        return Err(ConfigError::InvalidField("template.auth_role".into()));
    }
    if !(1..=10_000).contains(&t.max_client_conn) {
        return Err(ConfigError::OutOfRange {
            field: "template.max_client_conn",
            value: t.max_client_conn as i64,
            allowed: "1..=10000",
        });
    }
    if !(1..=10_000).contains(&t.default_pool_size) || t.default_pool_size > t.max_client_conn {
        return Err(ConfigError::OutOfRange {
            field: "template.default_pool_size",
            value: t.default_pool_size as i64,
            allowed: "1..=max_client_conn",
        });
    }

    Ok(())
}

// -----------------------------------------------------------------------------
// ----- Atomic replace --------------------------------------------------------

/// Write-to-temp then rename, in the destination directory so the rename
/// stays on one filesystem. A reader only ever sees the old bytes or the
/// new bytes, never a partial file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), ConfigError> {
    match try_atomic_write(path, bytes) {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!("atomic write of {} failed, retrying once: {first}", path.display());
            try_atomic_write(path, bytes).map_err(|source| ConfigError::Persist {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

fn try_atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
