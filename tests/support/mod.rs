use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

use pgboundary::BridgeConfig;

// Call sites vary per test file; silence the unused warnings per helper.

#[allow(dead_code)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// A broker that always grants the same session and logs each invocation.
#[allow(dead_code)]
pub fn fake_broker_ok(dir: &Path, host: &str, port: u16, ttl: u64) -> PathBuf {
    let log = dir.join("invocations.log");
    write_script(
        dir,
        "broker-ok.sh",
        &format!(
            "#!/bin/sh\necho \"$@\" >> {}\necho \"host={host} port={port} ttl={ttl} credential=app:tok-1\"\n",
            log.display()
        ),
    )
}

#[allow(dead_code)]
pub fn fake_broker_exit(dir: &Path, code: i32) -> PathBuf {
    write_script(
        dir,
        "broker-exit.sh",
        &format!("#!/bin/sh\necho \"denied\" >&2\nexit {code}\n"),
    )
}

#[allow(dead_code)]
pub fn fake_broker_garbage(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "broker-garbage.sh",
        "#!/bin/sh\necho \"session granted, enjoy\"\n",
    )
}

/// Fails with a retryable exit code until its marker file exists, then
/// succeeds. Exercises the transient-retry path.
#[allow(dead_code)]
pub fn fake_broker_flaky(dir: &Path, host: &str, port: u16, ttl: u64) -> PathBuf {
    let marker = dir.join("flaky.marker");
    write_script(
        dir,
        "broker-flaky.sh",
        &format!(
            "#!/bin/sh\nif [ -f {m} ]; then\n  echo \"host={host} port={port} ttl={ttl}\"\nelse\n  touch {m}\n  echo \"network unreachable\" >&2\n  exit 7\nfi\n",
            m = marker.display()
        ),
    )
}

/// A pooler stand-in: records its pid and stays up until signalled.
#[allow(dead_code)]
pub fn fake_pooler(dir: &Path) -> PathBuf {
    let pid_log = dir.join("pooler.pid.actual");
    write_script(
        dir,
        "pooler.sh",
        &format!("#!/bin/sh\necho $$ > {}\nexec sleep 300\n", pid_log.display()),
    )
}

#[allow(dead_code)]
pub fn pooler_pid(dir: &Path) -> i32 {
    fs::read_to_string(dir.join("pooler.pid.actual"))
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

#[allow(dead_code)]
pub fn reserve_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().unwrap().port()
}

/// The readiness probe only needs something accepting on the listen port;
/// the fake pooler cannot bind TCP itself, so tests hold this listener.
#[allow(dead_code)]
pub fn hold_listen_port() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listen port");
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Minimal admin-channel stub: one line in, one line out, loops forever.
#[allow(dead_code)]
pub fn spawn_admin_stub(socket: PathBuf) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = UnixListener::bind(&socket).expect("bind admin socket");
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            if reader.read_line(&mut line).await.is_err() {
                continue;
            }
            let reply = match line.trim() {
                "RELOAD" => "OK RELOAD\n",
                "STATUS" => "OK STATUS running\n",
                _ => "ERROR unknown command\n",
            };
            let _ = reader.get_mut().write_all(reply.as_bytes()).await;
        }
    })
}

#[allow(dead_code)]
pub fn test_config(dir: &Path, broker_cmd: &Path, pooler_cmd: &Path, port: u16) -> BridgeConfig {
    let raw = format!(
        r#"
        [listen]
        port = {port}

        [broker]
        command = "{broker}"
        target = "db1"
        connect_attempts = 2
        retry_base = "20ms"
        attempt_timeout = "5s"
        renew_margin = "1s"
        degraded_retry = "200ms"

        [pooler]
        command = "{pooler}"
        workdir = "{dir}"
        startup_timeout = "3s"
        reload_timeout = "1s"
        stop_grace = "2s"
        restart_backoff_base = "50ms"
        restart_backoff_max = "500ms"
        healthy_reset = "10s"
        max_restarts = 3
        monitor_interval = "100ms"

        [template]
        database = "appdb"
        auth_role = "app"
        "#,
        broker = broker_cmd.display(),
        pooler = pooler_cmd.display(),
        dir = dir.display(),
    );
    BridgeConfig::parse(&raw, dir).expect("test config parses")
}
