use rand::Rng;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::auth::CredentialEntry;
use crate::config::BrokerSettings;
use crate::errors::SessionError;

// -----------------------------------------------------------------------------
// ----- Session ---------------------------------------------------------------

/// A live broker session: a time-boxed network path to the remote database.
/// Only the `BrokerClient` creates these; everyone else reads.
#[derive(Debug, Clone)]
pub struct Session {
    pub target: String,
    pub host: String,
    pub port: u16,
    pub issued_at: Instant,
    pub ttl: Duration,
    pub credential: Option<CredentialEntry>,
}

impl Session {
    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.ttl
    }

    /// When renewal should fire: `margin` before expiry, clamped so an
    /// oversized margin never pushes the deadline to (or past) issuance.
    pub fn renew_deadline(&self, margin: Duration) -> Instant {
        let margin = if margin >= self.ttl { self.ttl / 2 } else { margin };
        self.issued_at + self.ttl - margin
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at().saturating_duration_since(Instant::now())
    }
}

// -----------------------------------------------------------------------------
// ----- BrokerClient ----------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BrokerClient {
    settings: BrokerSettings,
}

// -----------------------------------------------------------------------------
// ----- BrokerClient: Public --------------------------------------------------

impl BrokerClient {
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }

    pub async fn establish(&self) -> Result<Session, SessionError> {
        self.negotiate().await
    }

    /// Renewal is a fresh negotiation for the same target; the broker hands
    /// out a new endpoint and TTL. The caller swaps sessions on success.
    pub async fn renew(&self, current: &Session) -> Result<Session, SessionError> {
        debug!(
            "renewing session for '{}' ({}s remaining)",
            current.target,
            current.remaining().as_secs()
        );
        self.negotiate().await
    }
}

// -----------------------------------------------------------------------------
// ----- BrokerClient: Private -------------------------------------------------

#[derive(Debug)]
enum AttemptError {
    Auth,
    Protocol(String),
    Transient(String),
}

impl BrokerClient {
    async fn negotiate(&self) -> Result<Session, SessionError> {
        let attempts = self.settings.connect_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            match self.attempt_once().await {
                Ok(session) => return Ok(session),
                Err(AttemptError::Auth) => {
                    return Err(SessionError::Authentication {
                        target: self.settings.target.clone(),
                    });
                }
                Err(AttemptError::Protocol(message)) => {
                    return Err(SessionError::Protocol(message));
                }
                Err(AttemptError::Transient(message)) => {
                    warn!(
                        "broker attempt {attempt}/{attempts} for '{}' failed: {message}",
                        self.settings.target
                    );
                    last = message;
                    if attempt < attempts {
                        sleep(self.retry_delay(attempt)).await;
                    }
                }
            }
        }

        Err(SessionError::Transient { attempts, last })
    }

    /// One subprocess per attempt, spawned and reaped inside this call so
    /// two broker children for the same target never coexist.
    async fn attempt_once(&self) -> Result<Session, AttemptError> {
        let issued_at = Instant::now();

        let child = Command::new(&self.settings.command)
            .arg("connect")
            .arg(&self.settings.target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match timeout(self.settings.attempt_timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(AttemptError::Transient(format!("spawn failed: {e}"))),
            Err(_) => {
                return Err(AttemptError::Transient(format!(
                    "broker did not answer within {:?}",
                    self.settings.attempt_timeout
                )));
            }
        };

        match output.status.code() {
            Some(0) => {}
            Some(1) => return Err(AttemptError::Auth),
            Some(code) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(AttemptError::Transient(format!(
                    "broker exited with code {code}: {}",
                    stderr.trim()
                )));
            }
            None => return Err(AttemptError::Transient("broker killed by signal".into())),
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines().filter(|l| !l.trim().is_empty());
        let line = lines
            .next()
            .ok_or_else(|| AttemptError::Protocol("empty broker output".into()))?;
        if lines.next().is_some() {
            return Err(AttemptError::Protocol(
                "broker emitted more than one line".into(),
            ));
        }

        parse_session_line(&self.settings.target, issued_at, line)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.settings.retry_base.as_millis() as u64;
        let exp = base.saturating_mul(2u64.saturating_pow(attempt - 1));
        let jitter = rand::rng().random_range(0..=base / 2 + 1);
        Duration::from_millis(exp.saturating_add(jitter).min(30_000))
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Output grammar ----------------------------------------------

// Exactly: `host=<host> port=<port> ttl=<seconds>[ credential=<role>:<secret>]`
// in any token order. Anything else fails closed as a protocol error.
fn parse_session_line(
    target: &str,
    issued_at: Instant,
    line: &str,
) -> Result<Session, AttemptError> {
    let mut host: Option<String> = None;
    let mut port: Option<u16> = None;
    let mut ttl: Option<Duration> = None;
    let mut credential: Option<CredentialEntry> = None;

    for token in line.split_whitespace() {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| AttemptError::Protocol(format!("bare token '{token}'")))?;

        match key {
            "host" => assign(&mut host, key, value.to_string())?,
            "port" => {
                let parsed = value
                    .parse::<u16>()
                    .map_err(|_| AttemptError::Protocol(format!("bad port '{value}'")))?;
                assign(&mut port, key, parsed)?;
            }
            "ttl" => {
                let seconds = value
                    .parse::<u64>()
                    .map_err(|_| AttemptError::Protocol(format!("bad ttl '{value}'")))?;
                if seconds == 0 {
                    return Err(AttemptError::Protocol("zero ttl".into()));
                }
                assign(&mut ttl, key, Duration::from_secs(seconds))?;
            }
            "credential" => {
                let (role, secret) = value.split_once(':').ok_or_else(|| {
                    AttemptError::Protocol("credential missing ':' separator".into())
                })?;
                if role.is_empty() || secret.is_empty() {
                    return Err(AttemptError::Protocol("empty credential part".into()));
                }
                assign(&mut credential, key, CredentialEntry::new(role, secret))?;
            }
            other => {
                return Err(AttemptError::Protocol(format!("unknown field '{other}'")));
            }
        }
    }

    let host = host.ok_or_else(|| AttemptError::Protocol("missing field 'host'".into()))?;
    let port = port.ok_or_else(|| AttemptError::Protocol("missing field 'port'".into()))?;
    let ttl = ttl.ok_or_else(|| AttemptError::Protocol("missing field 'ttl'".into()))?;

    Ok(Session {
        target: target.to_string(),
        host,
        port,
        issued_at,
        ttl,
        credential,
    })
}

fn assign<T>(slot: &mut Option<T>, key: &str, value: T) -> Result<(), AttemptError> {
    if slot.is_some() {
        return Err(AttemptError::Protocol(format!("duplicate field '{key}'")));
    }
    *slot = Some(value);
    Ok(())
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
