//! PID file lifecycle: write on startup, detect a stale file left by a
//! process that died without cleaning up, and `--stop` an owning process
//! by signal rather than by any IPC channel, matching the original
//! deployment script's `write_pid_file`/`read_pid_file`/`stop_server`.

use std::path::Path;
use std::time::Duration;

/// How long `stop` waits for a graceful exit after `SIGTERM` before
/// escalating to `SIGKILL`.
const GRACE_PERIOD: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn write(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, std::process::id().to_string())
}

pub fn read(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn remove(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) | Err(_) if !path.exists() => {}
        Err(err) => tracing::warn!(path = %path.display(), %err, "failed to remove PID file"),
    }
}

/// Whether a process with this PID currently exists, probed with `kill -0`
/// rather than any Rust-native signal API, mirroring how the rest of this
/// workspace shells out to platform tools for OS-specific capabilities
/// (see `bridge_firewall::LinuxIpTablesFirewall`).
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: &str) -> bool {
    std::process::Command::new("kill")
        .args([signal, &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Checks for a pre-existing PID file at startup. Returns `Ok(true)` when
/// the caller should proceed to write its own (no live owner found,
/// clearing a stale file along the way); `Ok(false)` when another live
/// instance already owns it.
pub fn check_and_clear_stale(path: &Path) -> bool {
    let Some(pid) = read(path) else {
        return true;
    };
    if is_alive(pid) {
        tracing::error!(pid, path = %path.display(), "server already running; use --stop first");
        return false;
    }
    tracing::info!(pid, "removing stale PID file");
    remove(path);
    true
}

/// Stops a running instance: `SIGTERM`, wait up to [`GRACE_PERIOD`] polling
/// every [`POLL_INTERVAL`], then `SIGKILL` if it is still alive. Returns
/// whether the instance is confirmed stopped.
pub async fn stop(path: &Path) -> bool {
    let Some(pid) = read(path) else {
        println!("No PID file found at {}", path.display());
        return false;
    };

    if !is_alive(pid) {
        println!("Process {pid} is not running (stale PID file)");
        remove(path);
        return false;
    }

    println!("Stopping server (PID {pid})...");
    #[cfg(unix)]
    {
        if !send_signal(pid, "-TERM") {
            println!("Process {pid} already exited");
            remove(path);
            return true;
        }
    }
    #[cfg(not(unix))]
    {
        println!("Stopping a running instance is only supported on Unix in this build");
        return false;
    }

    let attempts = GRACE_PERIOD.as_millis() / POLL_INTERVAL.as_millis();
    for _ in 0..attempts {
        if !is_alive(pid) {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    #[cfg(unix)]
    if is_alive(pid) {
        println!("Process {pid} did not exit gracefully, force-killing...");
        send_signal(pid, "-KILL");
    }

    remove(path);
    println!("Server stopped");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");
        write(&path).unwrap();
        assert_eq!(read(&path), Some(std::process::id()));
    }

    #[test]
    fn read_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read(&dir.path().join("nope.pid")), None);
    }

    #[test]
    fn read_malformed_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pid");
        std::fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(read(&path), None);
    }

    #[test]
    #[cfg(unix)]
    fn current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn no_pid_file_clears_straight_through() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_and_clear_stale(&dir.path().join("missing.pid")));
    }

    #[test]
    fn stale_pid_file_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.pid");
        // PID 0 is never a real process we'd signal; treat any non-kill-able
        // value as a liveness-check false for this test's purposes instead
        // by writing a PID unlikely to exist.
        std::fs::write(&path, "999999").unwrap();
        assert!(check_and_clear_stale(&path));
        assert!(!path.exists());
    }
}
