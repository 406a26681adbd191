use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::PoolerSettings;
use crate::errors::ProcessError;

// -----------------------------------------------------------------------------
// ----- PoolerState -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolerState {
    Stopped,
    Starting,
    Running,
    Reloading,
    Crashed,
}

impl PoolerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolerState::Stopped => "stopped",
            PoolerState::Starting => "starting",
            PoolerState::Running => "running",
            PoolerState::Reloading => "reloading",
            PoolerState::Crashed => "crashed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolerStatus {
    pub state: PoolerState,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub uptime: Option<Duration>,
}

// -----------------------------------------------------------------------------
// ----- RestartBackoff --------------------------------------------------------

/// Capped exponential delay between crash restarts: `base * 2^n`, never
/// above `max`. Reset once the pooler has stayed healthy long enough.
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl RestartBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(delay_ms).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// -----------------------------------------------------------------------------
// ----- PoolerSupervisor ------------------------------------------------------

/// Owns the pooler child process. All mutation goes through these methods;
/// the orchestrator's monitor duty drives `check`/`restart_after_crash`.
#[derive(Debug)]
pub struct PoolerSupervisor {
    settings: PoolerSettings,
    listen: SocketAddr,
    child: Option<Child>,
    state: PoolerState,
    restart_count: u32,
    consecutive_crashes: u32,
    last_restart: Option<Instant>,
    started_at: Option<Instant>,
    backoff: RestartBackoff,
}

// -----------------------------------------------------------------------------
// ----- PoolerSupervisor: Public ----------------------------------------------

impl PoolerSupervisor {
    pub fn new(settings: PoolerSettings, listen: SocketAddr) -> Self {
        let backoff = RestartBackoff::new(
            settings.restart_backoff_base,
            settings.restart_backoff_max,
        );
        Self {
            settings,
            listen,
            child: None,
            state: PoolerState::Stopped,
            restart_count: 0,
            consecutive_crashes: 0,
            last_restart: None,
            started_at: None,
            backoff,
        }
    }

    /// Spawn the pooler against the committed config and wait until it
    /// accepts connections on the listen address, bounded by the startup
    /// timeout.
    pub async fn start(&mut self) -> Result<(), ProcessError> {
        if self.child.is_some() {
            debug!("pooler already running (pid {:?})", self.pid());
            return Ok(());
        }

        self.state = PoolerState::Starting;
        let mut child = Command::new(&self.settings.command)
            .arg(&self.settings.conf_path)
            .current_dir(&self.settings.workdir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.state = PoolerState::Crashed;
                ProcessError::Spawn {
                    command: self.settings.command.clone(),
                    source: e,
                }
            })?;

        let deadline = Instant::now() + self.settings.startup_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                self.state = PoolerState::Crashed;
                return Err(ProcessError::Exited {
                    status: status.to_string(),
                });
            }

            let probe = timeout(Duration::from_millis(250), TcpStream::connect(self.listen));
            if matches!(probe.await, Ok(Ok(_))) {
                break;
            }

            if Instant::now() >= deadline {
                let _ = child.start_kill();
                let _ = child.wait().await;
                self.state = PoolerState::Crashed;
                return Err(ProcessError::StartupTimeout {
                    addr: self.listen,
                    timeout: self.settings.startup_timeout,
                });
            }

            sleep(Duration::from_millis(50)).await;
        }

        info!(
            "pooler ready on {} (pid {:?})",
            self.listen,
            child.id()
        );
        self.child = Some(child);
        self.state = PoolerState::Running;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Tell a running pooler to re-read its config without dropping client
    /// sessions. If the process is gone or the admin channel does not answer
    /// in time, the pooler is marked crashed and a supervised restart (which
    /// reads the new config anyway) takes over.
    pub async fn apply_config(&mut self) -> Result<(), ProcessError> {
        self.poll_exit();

        if self.state != PoolerState::Running {
            debug!(
                "pooler is {}; new config will be read at next start",
                self.state.as_str()
            );
            return Ok(());
        }

        self.state = PoolerState::Reloading;
        let result = admin_command(
            &self.settings.admin_socket,
            "RELOAD",
            self.settings.reload_timeout,
        )
        .await;

        match result {
            Ok(reply) if reply.starts_with("OK") => {
                debug!("pooler reloaded (pid {:?})", self.pid());
                self.state = PoolerState::Running;
                Ok(())
            }
            Ok(reply) => {
                self.state = PoolerState::Crashed;
                Err(ProcessError::AdminUnresponsive {
                    path: self.settings.admin_socket.clone(),
                    reason: format!("unexpected reply '{reply}'"),
                })
            }
            Err(e) => {
                self.state = PoolerState::Crashed;
                Err(ProcessError::AdminUnresponsive {
                    path: self.settings.admin_socket.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Monitor poll. Detects an exited child and, after a sustained healthy
    /// period, resets the restart backoff to its base value.
    pub fn check(&mut self) -> PoolerState {
        self.poll_exit();

        if self.state == PoolerState::Running
            && self.consecutive_crashes > 0
            && self
                .started_at
                .is_some_and(|t| t.elapsed() >= self.settings.healthy_reset)
        {
            debug!("pooler healthy for {:?}; resetting restart backoff", self.settings.healthy_reset);
            self.backoff.reset();
            self.consecutive_crashes = 0;
        }

        self.state
    }

    pub async fn restart_after_crash(&mut self) -> Result<(), ProcessError> {
        if self.consecutive_crashes >= self.settings.max_restarts {
            return Err(ProcessError::RestartCeiling {
                count: self.consecutive_crashes,
            });
        }

        // A crash via the admin channel can leave a live but unusable child.
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        let delay = self.backoff.next_delay();
        warn!(
            "restarting pooler in {:?} (crash {} of {})",
            delay,
            self.consecutive_crashes + 1,
            self.settings.max_restarts
        );
        sleep(delay).await;

        self.consecutive_crashes += 1;
        self.restart_count += 1;
        self.last_restart = Some(Instant::now());
        self.start().await
    }

    /// Graceful stop: SIGTERM, wait out the grace period, then SIGKILL.
    pub async fn stop(&mut self) -> Result<(), ProcessError> {
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                info!("stopping pooler (pid {pid})");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }

            match timeout(self.settings.stop_grace, child.wait()).await {
                Ok(_) => debug!("pooler exited within grace period"),
                Err(_) => {
                    warn!(
                        "pooler ignored SIGTERM for {:?}; killing",
                        self.settings.stop_grace
                    );
                    let _ = child.kill().await;
                }
            }
        }

        self.state = PoolerState::Stopped;
        self.started_at = None;
        Ok(())
    }

    pub fn status(&self) -> PoolerStatus {
        PoolerStatus {
            state: self.state,
            pid: self.pid(),
            restart_count: self.restart_count,
            uptime: self.started_at.map(|t| t.elapsed()),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

// -----------------------------------------------------------------------------
// ----- PoolerSupervisor: Private ---------------------------------------------

impl PoolerSupervisor {
    fn poll_exit(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            if self.state != PoolerState::Stopped {
                warn!("pooler exited unexpectedly: {status}");
                self.state = PoolerState::Crashed;
            }
            self.child = None;
            self.started_at = None;
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Admin channel ---------------------------------------------------------

/// One command round-trip on the pooler's admin socket: a single line out,
/// a single line back, bounded by `wait`.
pub async fn admin_command(
    socket: &Path,
    command: &str,
    wait: Duration,
) -> std::io::Result<String> {
    let round_trip = async {
        let mut stream = UnixStream::connect(socket).await?;
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply).await?;
        Ok::<String, std::io::Error>(reply.trim().to_string())
    };

    timeout(wait, round_trip).await.map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::TimedOut, "admin channel timed out")
    })?
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let mut b = RestartBackoff::new(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(400));
        assert_eq!(b.next_delay(), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_non_decreasing_and_capped() {
        let mut b = RestartBackoff::new(Duration::from_millis(100), Duration::from_millis(500));

        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let delay = b.next_delay();
            assert!(delay >= last);
            assert!(delay <= Duration::from_millis(500));
            last = delay;
        }
        assert_eq!(last, Duration::from_millis(500));
    }

    #[test]
    fn backoff_reset_returns_to_base() {
        let mut b = RestartBackoff::new(Duration::from_millis(100), Duration::from_secs(10));

        b.next_delay();
        b.next_delay();
        assert_eq!(b.attempt(), 2);

        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn fresh_supervisor_reports_stopped() {
        let settings = crate::config::BridgeConfig::parse(
            r#"
                [listen]
                port = 6432

                [broker]
                command = "boundary"
                target = "db1"

                [template]
                database = "appdb"
                auth_role = "app"
            "#,
            Path::new("/tmp"),
        )
        .unwrap()
        .pooler;

        let sup = PoolerSupervisor::new(settings, "127.0.0.1:6432".parse().unwrap());
        let status = sup.status();

        assert_eq!(status.state, PoolerState::Stopped);
        assert_eq!(status.pid, None);
        assert_eq!(status.restart_count, 0);
        assert!(status.uptime.is_none());
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
