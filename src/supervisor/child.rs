//! Child start: PTY allocation, fork, environment and privilege
//! preparation, exec.
//!
//! Isolates the `unsafe` fork/exec code from the rest of the
//! supervisor. Everything the child branch needs is prepared as C
//! strings up front, so no heap allocation happens between fork and
//! exec.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use nix::libc;
use nix::pty::openpty;
use nix::sys::termios::{OutputFlags, SetArg, tcgetattr, tcsetattr};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Gid, Pid, Uid, chdir, execv, execvp, fork, setgid, setsid, setuid};

use crate::config::{Config, EnvOp};
use crate::status::EXIT_CHILD_SETUP;

const SHELL: &str = "/bin/sh";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("argument contains a null byte: {0:?}")]
    NulInArgument(String),
    #[error("PTY allocation failed: {0}")]
    PtyAlloc(nix::Error),
    #[error("fork failed: {0}")]
    Fork(nix::Error),
}

/// Everything the child branch needs, converted before any fork.
pub struct ChildSpec {
    program: CString,
    argv: Vec<CString>,
    clear_env: bool,
    /// `KEY=VALUE` entries, applied in order via putenv (last wins).
    env_set: Vec<CString>,
    /// Bare keys removed after the set pass.
    env_unset: Vec<CString>,
    work_dir: Option<CString>,
    /// `sh -c SCRIPT` argv, when a startup script was configured.
    script_argv: Option<[CString; 3]>,
    uid: Option<Uid>,
    gid: Option<Gid>,
}

impl ChildSpec {
    pub fn from_config(cfg: &Config) -> Result<Self, SpawnError> {
        let argv = cfg
            .program
            .iter()
            .map(|arg| cstring(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let program = argv[0].clone();

        let mut env_set = Vec::new();
        let mut env_unset = Vec::new();
        for op in &cfg.env_ops {
            match op {
                EnvOp::Set(entry) => env_set.push(cstring(entry)?),
                EnvOp::Unset(key) => env_unset.push(cstring(key)?),
            }
        }

        let work_dir = match &cfg.work_dir {
            Some(dir) => Some(
                CString::new(dir.as_os_str().as_bytes())
                    .map_err(|_| SpawnError::NulInArgument(dir.display().to_string()))?,
            ),
            None => None,
        };

        let script_argv = match &cfg.startup_script {
            Some(script) => Some([cstring(SHELL)?, cstring("-c")?, cstring(script)?]),
            None => None,
        };

        Ok(ChildSpec {
            program,
            argv,
            clear_env: cfg.clear_env,
            env_set,
            env_unset,
            work_dir,
            script_argv,
            uid: cfg.run_as.uid,
            gid: cfg.run_as.gid,
        })
    }
}

fn cstring(s: &str) -> Result<CString, SpawnError> {
    CString::new(s.as_bytes()).map_err(|_| SpawnError::NulInArgument(s.to_string()))
}

/// A started child: its PID and the PTY master carrying its output.
pub struct SpawnedChild {
    pub pid: Pid,
    pub master: OwnedFd,
}

/// Fork the child on a fresh PTY.
///
/// `close_in_child` lists parent-owned fds (self-pipe ends, command-FIFO
/// ends) the child closes before anything else. The returned master is
/// non-blocking.
pub fn spawn(spec: &ChildSpec, close_in_child: &[RawFd]) -> Result<SpawnedChild, SpawnError> {
    let pty = openpty(
        None::<&nix::pty::Winsize>,
        None::<&nix::sys::termios::Termios>,
    )
    .map_err(SpawnError::PtyAlloc)?;
    let master = pty.master;
    let slave = pty.slave;

    nix::fcntl::fcntl(
        &master,
        nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
    )
    .map_err(SpawnError::PtyAlloc)?;

    // Keep the child's newlines as written; the default ONLCR mapping
    // would turn every LF into CRLF before it reaches the line logger.
    if let Ok(mut termios) = tcgetattr(&slave) {
        termios.output_flags.remove(OutputFlags::ONLCR);
        let _ = tcsetattr(&slave, SetArg::TCSANOW, &termios);
    }

    // SAFETY: between fork() and exec()/_exit() the child branch calls
    // only async-signal-safe functions plus the documented environment
    // and id-switching steps; all allocation happened in ChildSpec.
    match unsafe { fork() }.map_err(SpawnError::Fork)? {
        ForkResult::Parent { child } => {
            drop(slave);
            Ok(SpawnedChild { pid: child, master })
        }
        ForkResult::Child => {
            drop(master);
            for &fd in close_in_child {
                // SAFETY: closing parent-owned fds the child must not keep.
                unsafe { libc::close(fd) };
            }
            setup_and_exec(spec, slave)
        }
    }
}

/// Child branch: wire up the PTY slave, apply policy, exec.
///
/// Any failure past this point is reported on stderr (the PTY, so the
/// parent logs it as child output) and ends with the setup sentinel
/// status.
fn setup_and_exec(spec: &ChildSpec, slave: OwnedFd) -> ! {
    // New session with the slave as controlling terminal.
    if setsid().is_err() {
        // SAFETY: _exit is async-signal-safe.
        unsafe { libc::_exit(EXIT_CHILD_SETUP) };
    }
    let slave_fd = slave.as_raw_fd();
    // SAFETY: ioctl on the owned slave fd.
    if unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) } < 0 {
        unsafe { libc::_exit(EXIT_CHILD_SETUP) };
    }

    // Standard streams onto the slave. Raw dup2: async-signal-safe, and
    // nix's wrapper wants mutable ownership of the target fd.
    // SAFETY: slave_fd is valid; targets are the standard streams.
    if unsafe { libc::dup2(slave_fd, 0) } < 0
        || unsafe { libc::dup2(slave_fd, 1) } < 0
        || unsafe { libc::dup2(slave_fd, 2) } < 0
    {
        unsafe { libc::_exit(EXIT_CHILD_SETUP) };
    }
    if slave_fd > 2 {
        drop(slave);
    } else {
        std::mem::forget(slave);
    }

    apply_env(spec);

    // Group first, while root privilege is still available for setgid.
    if let Some(gid) = spec.gid
        && setgid(gid).is_err()
    {
        fail("cannot set group id");
    }
    if let Some(uid) = spec.uid
        && setuid(uid).is_err()
    {
        fail("cannot set user id");
    }

    if let Some(dir) = &spec.work_dir
        && chdir(dir.as_c_str()).is_err()
    {
        fail("cannot change working directory");
    }

    if let Some(script) = &spec.script_argv {
        run_startup_script(script);
    }

    let _ = execvp(&spec.program, &spec.argv);
    eprintln!(
        "cannot execute {}: {}",
        spec.program.to_string_lossy(),
        nix::Error::last()
    );
    // SAFETY: _exit is async-signal-safe.
    unsafe { libc::_exit(EXIT_CHILD_SETUP) }
}

fn fail(what: &str) -> ! {
    eprintln!("{what}: {}", nix::Error::last());
    // SAFETY: _exit is async-signal-safe.
    unsafe { libc::_exit(EXIT_CHILD_SETUP) }
}

/// Environment policy: optional clear, then sets in order, then unsets.
/// Individual failures are warnings; the start continues.
fn apply_env(spec: &ChildSpec) {
    if spec.clear_env {
        // SAFETY: single-threaded child between fork and exec.
        if unsafe { libc::clearenv() } != 0 {
            eprintln!("cannot clear environment");
        }
    }
    for entry in &spec.env_set {
        // putenv keeps the pointer; the strings outlive it, exec copies
        // the environment.
        // SAFETY: entry is a valid NUL-terminated KEY=VALUE string.
        if unsafe { libc::putenv(entry.as_ptr().cast_mut()) } != 0 {
            eprintln!("cannot set {}", entry.to_string_lossy());
        }
    }
    for key in &spec.env_unset {
        // SAFETY: key is a valid NUL-terminated string.
        if unsafe { libc::unsetenv(key.as_ptr()) } != 0 {
            eprintln!("cannot unset {}", key.to_string_lossy());
        }
    }
}

/// Run the startup script under the shell and wait for it.
///
/// Termination by SIGINT or SIGQUIT aborts the start; every other
/// outcome, including a failure to fork, is ignored.
fn run_startup_script(argv: &[CString; 3]) {
    // SAFETY: plain fork in a single-threaded process.
    let pid = match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => child,
        Ok(ForkResult::Child) => {
            let _ = execv(&argv[0], &argv[..]);
            // SAFETY: _exit is async-signal-safe.
            unsafe { libc::_exit(127) };
        }
        Err(e) => {
            eprintln!("cannot run startup script: {e}");
            return;
        }
    };

    loop {
        match waitpid(pid, None) {
            Err(nix::Error::EINTR) => continue,
            Ok(WaitStatus::Signaled(_, sig, _))
                if sig == nix::sys::signal::Signal::SIGINT
                    || sig == nix::sys::signal::Signal::SIGQUIT =>
            {
                eprintln!("startup script interrupted, aborting start");
                // SAFETY: _exit is async-signal-safe.
                unsafe { libc::_exit(EXIT_CHILD_SETUP) };
            }
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::cli::Cli;

    use super::*;

    fn spec_for(args: &[&str]) -> ChildSpec {
        let cli = Cli::parse_from(args);
        let cfg = Config::from_cli(cli).unwrap();
        ChildSpec::from_config(&cfg).unwrap()
    }

    fn wait_for_exit(pid: Pid) -> i32 {
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return code,
                Ok(WaitStatus::Signaled(_, sig, _)) => return 128 + sig as i32,
                Err(nix::Error::EINTR) => continue,
                other => panic!("unexpected wait result: {other:?}"),
            }
        }
    }

    /// Read the master until the child's side closes (EOF or EIO). The
    /// parent holds no slave fd, so child exit always ends the loop.
    /// Does not reap; callers still own the wait.
    fn read_all_output(child: &SpawnedChild) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let mut output = Vec::new();
        loop {
            match nix::unistd::read(&child.master, &mut buf) {
                Ok(0) | Err(nix::Error::EIO) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
                Err(nix::Error::EAGAIN) => {
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }
                Err(e) => panic!("read error: {e}"),
            }
        }
        output
    }

    #[test]
    fn nul_byte_in_argument_rejected() {
        let cli = Cli::parse_from(["procmon", "prog\0ram"]);
        let cfg = Config::from_cli(cli).unwrap();
        assert!(matches!(
            ChildSpec::from_config(&cfg),
            Err(SpawnError::NulInArgument(_))
        ));
    }

    #[test]
    fn spawn_true_exits_zero() {
        let spec = spec_for(&["procmon", "true"]);
        let child = spawn(&spec, &[]).unwrap();
        assert_eq!(wait_for_exit(child.pid), 0);
    }

    #[test]
    fn spawn_false_exits_nonzero() {
        let spec = spec_for(&["procmon", "false"]);
        let child = spawn(&spec, &[]).unwrap();
        assert_eq!(wait_for_exit(child.pid), 1);
    }

    #[test]
    fn missing_program_exits_setup_sentinel() {
        let spec = spec_for(&["procmon", "__procmon_no_such_program__"]);
        let child = spawn(&spec, &[]).unwrap();
        assert_eq!(wait_for_exit(child.pid), EXIT_CHILD_SETUP);
    }

    #[test]
    fn child_output_arrives_on_master() {
        let spec = spec_for(&["procmon", "sh", "-c", "printf 'marker-42\\n'"]);
        let child = spawn(&spec, &[]).unwrap();
        let output = read_all_output(&child);
        wait_for_exit(child.pid);
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("marker-42"), "got: {text:?}");
    }

    #[test]
    fn env_set_reaches_the_child() {
        let spec = spec_for(&[
            "procmon",
            "-E",
            "PROCMON_TEST_VAR=hello",
            "sh",
            "-c",
            "printf '%s\\n' \"$PROCMON_TEST_VAR\"",
        ]);
        let child = spawn(&spec, &[]).unwrap();
        let output = read_all_output(&child);
        wait_for_exit(child.pid);
        assert!(
            String::from_utf8_lossy(&output).contains("hello"),
            "got: {output:?}"
        );
    }

    #[test]
    fn later_env_set_wins() {
        let spec = spec_for(&[
            "procmon",
            "-E",
            "PROCMON_DUP=first",
            "-E",
            "PROCMON_DUP=second",
            "sh",
            "-c",
            "printf '%s\\n' \"$PROCMON_DUP\"",
        ]);
        let child = spawn(&spec, &[]).unwrap();
        let output = read_all_output(&child);
        wait_for_exit(child.pid);
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("second"), "got: {text:?}");
        assert!(!text.contains("first"), "got: {text:?}");
    }

    #[test]
    fn work_dir_applies_before_exec() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let spec = spec_for(&[
            "procmon",
            "-D",
            canonical.to_str().unwrap(),
            "sh",
            "-c",
            "pwd",
        ]);
        let child = spawn(&spec, &[]).unwrap();
        let output = read_all_output(&child);
        wait_for_exit(child.pid);
        assert!(
            String::from_utf8_lossy(&output).contains(canonical.to_str().unwrap()),
            "got: {output:?}"
        );
    }

    #[test]
    fn bad_work_dir_exits_setup_sentinel() {
        let spec = spec_for(&["procmon", "-D", "/no/such/dir", "true"]);
        let child = spawn(&spec, &[]).unwrap();
        assert_eq!(wait_for_exit(child.pid), EXIT_CHILD_SETUP);
    }

    #[test]
    fn startup_script_runs_before_program() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let script = format!("touch {}", marker.display());
        let spec = spec_for(&["procmon", "-S", &script, "true"]);
        let child = spawn(&spec, &[]).unwrap();
        assert_eq!(wait_for_exit(child.pid), 0);
        assert!(marker.exists());
    }
}
