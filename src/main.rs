use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use pgboundary::config::cli::{Args, Cmd};
use pgboundary::errors::{ConfigError, ProcessError};
use pgboundary::supervisor::admin_command;
use pgboundary::{Bridge, BridgeConfig, BridgeError};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const APP_NAME: &str = "pgboundary";

// -----------------------------------------------------------------------------
// ----- Main ------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let args = Args::from_cli();
    init_tracing(&args);

    let code = match dispatch(args).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    };

    std::process::exit(code);
}

// -----------------------------------------------------------------------------
// ----- Setup -----------------------------------------------------------------

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_new(args.log_level.clone().as_str()).unwrap();
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

// -----------------------------------------------------------------------------
// ----- Dispatch --------------------------------------------------------------

async fn dispatch(args: Args) -> Result<(), BridgeError> {
    let config = BridgeConfig::load(&args.config_file).await?;

    match args.command {
        Cmd::Start => run_start(config).await,
        Cmd::Stop => run_stop(&config),
        Cmd::Status => run_status(&config).await,
    }
}

// -----------------------------------------------------------------------------
// ----- Start -----------------------------------------------------------------

async fn run_start(config: BridgeConfig) -> Result<(), BridgeError> {
    write_pidfile(&config)?;
    info!("{APP_NAME} starting (target '{}')", config.broker.target);

    let (tx, rx) = mpsc::channel::<()>(1);
    tokio::spawn(wait_for_stop_signal(tx));

    let pid_path = config.pooler.pid_path.clone();
    let result = Bridge::new(config).run(rx).await;
    let _ = fs::remove_file(&pid_path);

    info!("{APP_NAME} stopped");
    result
}

async fn wait_for_stop_signal(tx: mpsc::Sender<()>) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send(()).await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    let _ = tx.send(()).await;
}

// -----------------------------------------------------------------------------
// ----- Stop / Status ---------------------------------------------------------

fn run_stop(config: &BridgeConfig) -> Result<(), BridgeError> {
    let pid = read_pidfile(config).ok_or(ProcessError::NotRunning)?;

    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(|_| ProcessError::NotRunning)?;
    println!("stop signalled to {APP_NAME} (pid {pid})");
    Ok(())
}

async fn run_status(config: &BridgeConfig) -> Result<(), BridgeError> {
    let Some(pid) = read_pidfile(config).filter(|pid| process_alive(*pid)) else {
        println!("bridge: stopped");
        return Ok(());
    };

    println!("bridge: running (pid {pid})");
    match admin_command(
        &config.pooler.admin_socket,
        "STATUS",
        Duration::from_secs(2),
    )
    .await
    {
        Ok(reply) => println!("pooler: {reply}"),
        Err(e) => println!("pooler: admin channel unreachable ({e})"),
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// ----- Pidfile ---------------------------------------------------------------

fn write_pidfile(config: &BridgeConfig) -> Result<(), BridgeError> {
    let path = &config.pooler.pid_path;
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| ConfigError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
    }
    fs::write(path, format!("{}\n", std::process::id())).map_err(|e| {
        ConfigError::Io {
            path: path.clone(),
            source: e,
        }
        .into()
    })
}

fn read_pidfile(config: &BridgeConfig) -> Option<i32> {
    let raw = fs::read_to_string(&config.pooler.pid_path).ok()?;
    raw.trim().parse().ok()
}

// Signal 0 probes for existence without delivering anything.
fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None::<Signal>).is_ok()
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
