use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};

use crate::errors::ConfigError;
use crate::render::atomic_write;

// -----------------------------------------------------------------------------
// ----- CredentialEntry -------------------------------------------------------

/// One role/secret pair destined for the pooler's auth file. The secret only
/// leaves `SecretString` while the file bytes are being produced.
#[derive(Debug, Clone)]
pub struct CredentialEntry {
    pub role: String,
    pub secret: SecretString,
}

impl CredentialEntry {
    pub fn new(role: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            secret: SecretString::new(secret.into().into_boxed_str()),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- AuthFile --------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AuthFile {
    path: PathBuf,
}

// -----------------------------------------------------------------------------
// ----- AuthFile: Public ------------------------------------------------------

impl AuthFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `entries` as the complete auth file. The content becomes
    /// visible in one rename; the pooler never reads a half-written file.
    pub fn write(&self, entries: &[CredentialEntry]) -> Result<(), ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::InvalidField("credentials".into()));
        }

        let text = render_entries(entries);
        atomic_write(&self.path, text.as_bytes())
    }

    /// Replace the live entry set. Once rotation starts the old content is
    /// never reused.
    pub fn rotate(&self, entries: &[CredentialEntry]) -> Result<(), ConfigError> {
        self.write(entries)
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn render_entries(entries: &[CredentialEntry]) -> String {
    let mut out = String::with_capacity(entries.len() * 48);
    for entry in entries {
        out.push_str(&format!(
            "\"{}\" \"{}\"\n",
            quote(&entry.role),
            quote(entry.secret.expose_secret())
        ));
    }
    out
}

// pgbouncer auth_file quoting: double quotes inside a quoted value.
fn quote(raw: &str) -> String {
    raw.replace('"', "\"\"")
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
