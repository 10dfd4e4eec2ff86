//! Startup plumbing: terminal detach, fd hygiene, PID file.

use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{OFlag, open};
use nix::libc;
use nix::sys::stat::Mode;
use nix::unistd::{ForkResult, fork, setsid};

use crate::status::EXIT_SUCCESS;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("fork failed: {0}")]
    Fork(nix::Error),
    #[error("setsid failed: {0}")]
    Setsid(nix::Error),
    #[error("cannot open /dev/null: {0}")]
    DevNull(nix::Error),
}

/// Detach from the controlling terminal.
///
/// Forks once; the parent returns to the shell and the child carries on
/// as the supervisor in a new session with stdio redirected to the null
/// device. Must run before logging is initialised and before the PID
/// file is written, so both see the surviving process.
pub fn detach() -> Result<(), DaemonError> {
    // SAFETY: single-threaded at this point in startup.
    match unsafe { fork() }.map_err(DaemonError::Fork)? {
        ForkResult::Parent { .. } => std::process::exit(EXIT_SUCCESS),
        ForkResult::Child => {}
    }

    setsid().map_err(DaemonError::Setsid)?;

    let null = open("/dev/null", OFlag::O_RDWR, Mode::empty()).map_err(DaemonError::DevNull)?;
    let null_fd = null.as_raw_fd();
    // SAFETY: dup2 over the standard streams; both fds are valid here.
    unsafe {
        libc::dup2(null_fd, 0);
        libc::dup2(null_fd, 1);
        libc::dup2(null_fd, 2);
    }
    if null_fd > 2 {
        drop(null);
    } else {
        // The fd became one of the standard streams.
        std::mem::forget(null);
    }
    Ok(())
}

/// Close every fd >= 3 inherited from the invoking environment.
///
/// Runs before logging is established, so failures (including closing
/// fds that were never open) are silent.
pub fn close_inherited_fds() {
    // SAFETY: sysconf has no memory effects.
    let limit = match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
        n if n > 0 => n as i32,
        _ => 1024,
    };
    for fd in 3..limit {
        // SAFETY: closing unknown fds is the point; errors are ignored.
        unsafe { libc::close(fd) };
    }
}

#[derive(Debug, thiserror::Error)]
#[error("cannot write PID file {}: {source}", .path.display())]
pub struct PidFileError {
    path: PathBuf,
    source: std::io::Error,
}

/// PID file holding the supervisor PID in decimal plus a newline.
///
/// Removed on drop; `main` drops it on every orderly exit path, so the
/// file exists exactly for the lifetime of a successfully started
/// supervisor.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> Result<Self, PidFileError> {
        fs::write(path, format!("{}\n", std::process::id())).map_err(|source| PidFileError {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(PidFile {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "could not remove PID file");
        }
    }
}
