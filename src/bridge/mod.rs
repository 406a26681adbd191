use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval, sleep_until};
use tracing::{debug, error, info, warn};

use crate::auth::AuthFile;
use crate::broker::{BrokerClient, Session};
use crate::config::BridgeConfig;
use crate::errors::{BridgeError, ConfigError, ProcessError};
use crate::render;
use crate::supervisor::{PoolerState, PoolerStatus, PoolerSupervisor};

// -----------------------------------------------------------------------------
// ----- BridgeState -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Connecting,
    Bridging,
    Renewing,
    Degraded,
    ShuttingDown,
}

impl BridgeState {
    pub fn as_str(self) -> &'static str {
        match self {
            BridgeState::Idle => "idle",
            BridgeState::Connecting => "connecting",
            BridgeState::Bridging => "bridging",
            BridgeState::Renewing => "renewing",
            BridgeState::Degraded => "degraded",
            BridgeState::ShuttingDown => "shutting-down",
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Bridge ----------------------------------------------------------------

/// Top-level state machine. Owns the session, the auth file and the pooler
/// supervisor; its single event loop is the only place bridge state changes,
/// so concurrent triggers queue instead of racing. Renewals are coalesced by
/// construction: the loop runs one cycle to completion before polling again.
pub struct Bridge {
    config: BridgeConfig,
    broker: BrokerClient,
    supervisor: PoolerSupervisor,
    auth: AuthFile,
    state: BridgeState,
    session: Option<Session>,
    next_renewal: Instant,
}

// -----------------------------------------------------------------------------
// ----- Bridge: Public --------------------------------------------------------

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        let broker = BrokerClient::new(config.broker.clone());
        let supervisor = PoolerSupervisor::new(config.pooler.clone(), config.listen);
        let auth = AuthFile::new(config.pooler.auth_path.clone());

        Self {
            config,
            broker,
            supervisor,
            auth,
            state: BridgeState::Idle,
            session: None,
            next_renewal: Instant::now(),
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn pooler_status(&self) -> PoolerStatus {
        self.supervisor.status()
    }

    /// Bring the bridge up and serve until `shutdown` fires. The three
    /// duties — renewal timer, pooler monitor, shutdown listener — are
    /// serialized through this loop. A stop request wins any race: it
    /// preempts an in-flight renewal or restart wait, then always runs the
    /// supervisor's graceful-stop sequence.
    pub async fn run(mut self, mut shutdown: mpsc::Receiver<()>) -> Result<(), BridgeError> {
        let connected = tokio::select! {
            _ = shutdown.recv() => false,
            res = self.connect() => {
                res?;
                true
            }
        };
        if !connected {
            self.shutdown().await;
            return Ok(());
        }

        let mut monitor = interval(self.config.pooler.monitor_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let duty = tokio::select! {
                _ = shutdown.recv() => Duty::Stop,
                _ = sleep_until(tokio::time::Instant::from_std(self.next_renewal)) => Duty::Renew,
                _ = monitor.tick() => Duty::Monitor,
            };

            let stopped = match duty {
                Duty::Stop => true,
                Duty::Renew => {
                    tokio::select! {
                        _ = shutdown.recv() => true,
                        _ = self.renew_cycle() => false,
                    }
                }
                Duty::Monitor => {
                    tokio::select! {
                        _ = shutdown.recv() => true,
                        res = self.monitor_tick() => {
                            res?;
                            false
                        }
                    }
                }
            };

            if stopped {
                self.shutdown().await;
                return Ok(());
            }
        }
    }
}

// The bounded set of external triggers feeding the loop.
enum Duty {
    Stop,
    Renew,
    Monitor,
}

// -----------------------------------------------------------------------------
// ----- Bridge: Private -------------------------------------------------------

impl Bridge {
    async fn connect(&mut self) -> Result<(), BridgeError> {
        self.state = BridgeState::Connecting;
        info!("establishing broker session for '{}'", self.config.broker.target);

        let session = self.broker.establish().await?;
        info!(
            "session granted: {}:{} (ttl {}s)",
            session.host,
            session.port,
            session.ttl.as_secs()
        );

        self.install(&session)?;
        self.next_renewal = session.renew_deadline(self.config.broker.renew_margin);
        self.session = Some(session);

        self.supervisor.start().await?;
        self.state = BridgeState::Bridging;
        info!("bridging: clients can connect to {}", self.config.listen);
        Ok(())
    }

    /// Commit the session facts to disk. The config text is rendered (and
    /// validated) up front so a rejected template leaves both files alone;
    /// only then are credentials rotated, and the config referencing them
    /// committed last. Both writes are atomic replaces, and both are fully
    /// committed before any reload is issued.
    fn install(&self, session: &Session) -> Result<(), ConfigError> {
        let text = render::render(&self.config, session)?;

        match &session.credential {
            Some(cred) => self.auth.rotate(std::slice::from_ref(cred))?,
            None => debug!("broker manages auth out-of-band; auth file untouched"),
        }

        render::commit(&self.config.pooler.conf_path, &text)
    }

    async fn renew_cycle(&mut self) {
        let Some(current) = self.session.clone() else {
            return;
        };

        self.state = BridgeState::Renewing;
        match self.broker.renew(&current).await {
            Ok(session) => match self.install(&session) {
                Ok(()) => {
                    self.next_renewal = session.renew_deadline(self.config.broker.renew_margin);
                    self.session = Some(session);

                    // The reload path never restarts a healthy pooler. If the
                    // admin channel is dead the supervisor marks it crashed
                    // and the monitor restarts it on the new config.
                    if let Err(e) = self.supervisor.apply_config().await {
                        warn!("reload failed, restart pending: {e}");
                    }

                    self.state = BridgeState::Bridging;
                    info!("session renewed; next renewal at deadline");
                }
                Err(e) => {
                    error!("could not commit renewed config, keeping previous: {e}");
                    self.degrade();
                }
            },
            Err(e) => {
                warn!("renewal failed: {e}");
                self.degrade();
            }
        }
    }

    /// Keep the last-known-good backend alive and retry on a slower cadence.
    fn degrade(&mut self) {
        self.state = BridgeState::Degraded;
        self.next_renewal = Instant::now() + self.config.broker.degraded_retry;
        warn!(
            "bridge degraded; serving last-known-good backend, retrying in {:?}",
            self.config.broker.degraded_retry
        );
    }

    async fn monitor_tick(&mut self) -> Result<(), BridgeError> {
        if self.supervisor.check() != PoolerState::Crashed {
            return Ok(());
        }

        match self.supervisor.restart_after_crash().await {
            Ok(()) => {
                info!("pooler restarted after crash");
                Ok(())
            }
            Err(e @ ProcessError::RestartCeiling { .. }) => {
                error!("{e}; giving up");
                Err(e.into())
            }
            Err(e) => {
                warn!("pooler restart attempt failed: {e}");
                Ok(())
            }
        }
    }

    async fn shutdown(&mut self) {
        self.state = BridgeState::ShuttingDown;
        info!("stop requested; shutting the bridge down");

        if let Err(e) = self.supervisor.stop().await {
            warn!("pooler stop failed: {e}");
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
