//! Detaching from the controlling terminal, writing a PID file, and
//! notifying a service manager that startup finished. Outside the core
//! crate's scope, and built on `nix`'s process-control wrappers rather than
//! raw libc calls.

use std::io::Write as _;
use std::path::Path;

#[cfg(feature = "sysv")]
use nix::unistd::{fork, setsid, ForkResult};

#[derive(Debug, thiserror::Error)]
pub enum DaemonizeError {
    #[error("fork failed: {0}")]
    Fork(#[source] std::io::Error),
    #[error("setsid failed: {0}")]
    Setsid(#[source] std::io::Error),
    #[error("failed to write pid file {path}: {source}")]
    PidFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Forks into the background, detaches the session, and writes `pid_file`.
/// Returns `true` in the parent process (which should exit immediately)
/// and `false` in the child that continues running the server.
#[cfg(feature = "sysv")]
pub fn daemonize_sysv(pid_file: &Path) -> Result<bool, DaemonizeError> {
    // SAFETY: `fork` is called before any additional threads are spawned
    // in `main`; the child immediately calls `setsid` and does no
    // async-signal-unsafe work before that.
    match unsafe { fork() }.map_err(|e| DaemonizeError::Fork(std::io::Error::from(e)))? {
        ForkResult::Parent { .. } => Ok(true),
        ForkResult::Child => {
            setsid().map_err(|e| DaemonizeError::Setsid(std::io::Error::from(e)))?;
            write_pid_file(pid_file)?;
            Ok(false)
        }
    }
}

fn write_pid_file(path: &Path) -> Result<(), DaemonizeError> {
    let mut file = std::fs::File::create(path).map_err(|source| DaemonizeError::PidFile {
        path: path.to_path_buf(),
        source,
    })?;

    writeln!(file, "{}", std::process::id()).map_err(|source| DaemonizeError::PidFile {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(())
}

/// Tells a waiting `systemd` service manager that startup finished, via the
/// `sd_notify` wire protocol (`READY=1\n` on the `NOTIFY_SOCKET` datagram
/// socket). No external crate is pulled in for one syscall's worth of
/// protocol.
#[cfg(feature = "systemd")]
pub fn notify_systemd_ready() -> std::io::Result<()> {
    use std::os::unix::net::UnixDatagram;

    let Ok(socket_path) = std::env::var("NOTIFY_SOCKET") else {
        return Ok(());
    };

    let socket = UnixDatagram::unbound()?;
    socket.send_to(b"READY=1\n", socket_path)?;

    Ok(())
}
