//! The supervise loop: multiplexed wait and the restart state machine.
//!
//! Strictly single-threaded: one poll(2) over the self-pipe, the child's
//! PTY master, and the command FIFO. Signal handlers only write a token
//! byte; every state transition happens here. Within one wake-up the PTY
//! is drained first (a just-exited child's final output must be logged
//! before the exit is processed), then signal tokens, then FIFO
//! commands.

pub mod command;

mod child;
mod pty;
mod signals;

use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, alarm};

use crate::config::Config;
use crate::status::{EXIT_CHILD_SETUP, EXIT_FAILURE, EXIT_NOTREACHED, EXIT_SUCCESS};

use child::{ChildSpec, SpawnedChild};
use command::{Command, CommandChannel};
use pty::{PtyReader, PtyStatus};
use signals::SelfPipe;

/// Delay armed after a failed fork-via-PTY, instead of the back-off.
const START_FAILURE_DELAY: u32 = 60;

/// Back-off bound while waiting out a graceful shutdown.
const SHUTDOWN_DELAY: u32 = 5;

/// Wall-clock limit for a graceful shutdown before SIGKILL.
const SHUTDOWN_WINDOW: Duration = Duration::from_secs(6);

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("cannot create self-pipe: {0}")]
    SelfPipe(nix::Error),
    #[error("cannot install signal handlers: {0}")]
    Handlers(nix::Error),
    #[error(transparent)]
    Channel(#[from] command::ChannelError),
    #[error(transparent)]
    Spawn(#[from] child::SpawnError),
}

/// What an event handler decided about the loop.
enum Flow {
    Continue,
    Exit(i32),
}

/// Exponential restart back-off.
///
/// `current` starts at `min`, doubles after every child exit, and caps
/// at `max`.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    min: u32,
    max: u32,
    current: u32,
}

impl Backoff {
    fn new(min: u32, max: u32) -> Self {
        Backoff {
            min,
            max,
            current: min,
        }
    }

    /// Seconds to arm the alarm with; a zero delay becomes one second.
    fn arm_delay(&self) -> u32 {
        self.current.max(1)
    }

    fn advance(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.max);
    }

    fn reset(&mut self) {
        self.current = self.min;
    }

    fn set_failure_delay(&mut self) {
        self.current = START_FAILURE_DELAY;
    }

    /// Override both bounds for the graceful-shutdown wait.
    fn clamp_for_shutdown(&mut self) {
        self.min = SHUTDOWN_DELAY;
        self.max = SHUTDOWN_DELAY;
        self.current = SHUTDOWN_DELAY;
    }
}

pub struct Supervisor {
    cfg: Config,
    spec: ChildSpec,
    self_pipe: SelfPipe,
    channel: Option<CommandChannel>,
    child: Option<Pid>,
    pty: Option<PtyReader>,
    backoff: Backoff,
    restart_enabled: bool,
    /// When set, the next child exit (or alarm) ends the supervisor
    /// with this status: 1 for signal-driven shutdowns, 0 for the
    /// graceful exit command.
    pending_exit: Option<i32>,
}

impl Supervisor {
    /// Build the supervisor's resources. The self-pipe exists before the
    /// handlers that write to it are installed.
    pub fn new(cfg: Config) -> Result<Self, SetupError> {
        let spec = ChildSpec::from_config(&cfg)?;
        let self_pipe = SelfPipe::create().map_err(SetupError::SelfPipe)?;
        signals::install().map_err(SetupError::Handlers)?;
        let channel = match &cfg.command_pipe {
            Some(path) => Some(CommandChannel::open(path)?),
            None => None,
        };
        let backoff = Backoff::new(cfg.min_wait, cfg.max_wait);
        Ok(Supervisor {
            cfg,
            spec,
            self_pipe,
            channel,
            child: None,
            pty: None,
            backoff,
            restart_enabled: true,
            pending_exit: None,
        })
    }

    /// Start the first child and supervise until an exit status is
    /// decided.
    pub fn run(&mut self) -> i32 {
        self.start_child();
        match self.supervise_loop() {
            Flow::Exit(code) => code,
            // The loop only ends through an explicit exit path.
            Flow::Continue => EXIT_NOTREACHED,
        }
    }

    fn supervise_loop(&mut self) -> Flow {
        loop {
            let timeout = timeout_for(Duration::from_secs(u64::from(self.backoff.arm_delay())));
            if let Flow::Exit(code) = self.iterate(timeout) {
                return Flow::Exit(code);
            }
        }
    }

    /// One multiplexed wait plus dispatch, in drain order: PTY, then
    /// self-pipe tokens, then FIFO commands.
    fn iterate(&mut self, timeout: PollTimeout) -> Flow {
        let pipe_fd = self.self_pipe.read_fd();
        let pty_fd = self.pty.as_ref().map(|p| p.master_fd());
        let fifo_fd = self.channel.as_ref().map(|c| c.read_fd());

        // SAFETY: every fd is owned by self and stays open across the
        // poll call.
        let mut fds = Vec::with_capacity(3);
        fds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(pipe_fd) },
            PollFlags::POLLIN,
        ));
        if let Some(fd) = pty_fd {
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(fd) },
                PollFlags::POLLIN,
            ));
        }
        if let Some(fd) = fifo_fd {
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(fd) },
                PollFlags::POLLIN,
            ));
        }

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Flow::Continue,
            Err(e) => {
                tracing::warn!(error = %e, "poll failed");
                return Flow::Continue;
            }
        }

        let pipe_ready = has_events(&fds[0]);
        let mut next = 1;
        let pty_ready = pty_fd.is_some() && {
            let ready = has_events(&fds[next]);
            next += 1;
            ready
        };
        let fifo_ready = fifo_fd.is_some() && has_events(&fds[next]);
        drop(fds);

        if pty_ready {
            self.drain_pty();
        }
        if pipe_ready
            && let Flow::Exit(code) = self.drain_self_pipe()
        {
            return Flow::Exit(code);
        }
        if fifo_ready
            && let Flow::Exit(code) = self.drain_commands()
        {
            return Flow::Exit(code);
        }
        Flow::Continue
    }

    fn drain_pty(&mut self) {
        if let Some(reader) = self.pty.as_mut()
            && reader.drain() == PtyStatus::Closed
        {
            self.pty = None;
        }
    }

    fn drain_self_pipe(&mut self) -> Flow {
        let mut buf = [0u8; 64];
        loop {
            match self.self_pipe.read(&mut buf) {
                Ok(0) => {
                    // Both ends gone somehow; a fresh pipe keeps signal
                    // delivery working.
                    tracing::warn!("self-pipe closed, recreating");
                    if let Err(e) = self.self_pipe.recreate() {
                        tracing::error!(error = %e, "cannot recreate self-pipe");
                    }
                    return Flow::Continue;
                }
                Ok(n) => {
                    for &token in &buf[..n] {
                        if let Flow::Exit(code) = self.dispatch_token(token) {
                            return Flow::Exit(code);
                        }
                    }
                }
                Err(Errno::EAGAIN) => return Flow::Continue,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "self-pipe read failed");
                    return Flow::Continue;
                }
            }
        }
    }

    fn dispatch_token(&mut self, token: u8) -> Flow {
        match token {
            signals::TOKEN_CHILD => self.on_child_event(),
            signals::TOKEN_ALARM => self.on_alarm(),
            signals::TOKEN_HANGUP => self.on_hangup(),
            signals::TOKEN_INTERRUPT => self.on_interrupt(),
            signals::TOKEN_TERMINATE => self.on_terminate(),
            signals::TOKEN_USER1 => {
                tracing::info!("monitoring disabled");
                self.restart_enabled = false;
                Flow::Continue
            }
            signals::TOKEN_USER2 => {
                tracing::info!("monitoring enabled");
                self.resume_monitoring()
            }
            other => {
                tracing::warn!(byte = other, "unknown byte on self-pipe");
                Flow::Continue
            }
        }
    }

    fn drain_commands(&mut self) -> Flow {
        enum Outcome {
            Data(usize),
            Eof,
            Done,
            Retry,
        }

        let mut buf = [0u8; 64];
        loop {
            let outcome = match self.channel.as_ref() {
                None => return Flow::Continue,
                Some(channel) => match channel.read(&mut buf) {
                    Ok(0) => Outcome::Eof,
                    Ok(n) => Outcome::Data(n),
                    Err(Errno::EAGAIN) => Outcome::Done,
                    Err(Errno::EINTR) => Outcome::Retry,
                    Err(e) => {
                        tracing::warn!(error = %e, "command FIFO read failed");
                        Outcome::Done
                    }
                },
            };

            match outcome {
                Outcome::Data(n) => {
                    for &byte in &buf[..n] {
                        match Command::from_byte(byte) {
                            Some(cmd) => {
                                if let Flow::Exit(code) = self.dispatch_command(cmd) {
                                    return Flow::Exit(code);
                                }
                            }
                            None => tracing::warn!(byte, "unknown byte on command FIFO"),
                        }
                    }
                }
                Outcome::Eof => {
                    if let Some(channel) = self.channel.as_mut()
                        && let Err(e) = channel.reopen_reader()
                    {
                        tracing::warn!(error = %e, "cannot reopen command FIFO");
                    }
                    return Flow::Continue;
                }
                Outcome::Done => return Flow::Continue,
                Outcome::Retry => {}
            }
        }
    }

    fn dispatch_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Start => {
                tracing::info!("monitoring enabled by command");
                self.resume_monitoring()
            }
            Command::Stop => {
                tracing::info!("monitoring disabled by command");
                self.restart_enabled = false;
                Flow::Continue
            }
            Command::Hangup => self.on_hangup(),
            Command::Interrupt => self.on_interrupt(),
            Command::Exit => self.graceful_shutdown(),
        }
    }

    /// Child-status token: drain remaining output, then reap.
    fn on_child_event(&mut self) -> Flow {
        // The child may have flushed output that only arrives with the
        // exit notification.
        self.drain_pty();

        match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) if Some(pid) == self.child => {
                if code != EXIT_CHILD_SETUP {
                    tracing::info!(pid = pid.as_raw(), code, "child exited");
                }
                self.child_gone()
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) if Some(pid) == self.child => {
                tracing::info!(pid = pid.as_raw(), signal = %sig, "child killed by signal");
                self.child_gone()
            }
            Ok(_) | Err(Errno::ECHILD) => Flow::Continue,
            Err(e) => {
                tracing::warn!(error = %e, "wait for child failed");
                Flow::Continue
            }
        }
    }

    fn child_gone(&mut self) -> Flow {
        self.child = None;
        if let Some(mut reader) = self.pty.take() {
            reader.flush_partial();
        }

        if let Some(code) = self.pending_exit {
            tracing::info!(code, "child gone, supervisor exiting");
            return Flow::Exit(code);
        }
        if self.restart_enabled {
            let delay = self.backoff.arm_delay();
            tracing::info!(delay, "restart scheduled");
            let _ = alarm::set(delay);
            self.backoff.advance();
        }
        Flow::Continue
    }

    fn on_alarm(&mut self) -> Flow {
        if self.restart_enabled && self.child.is_none() {
            self.start_child();
        }
        if let Some(code) = self.pending_exit {
            return Flow::Exit(code);
        }
        Flow::Continue
    }

    fn on_hangup(&mut self) -> Flow {
        match self.child {
            Some(pid) => {
                self.signal_child(pid, Signal::SIGHUP);
                if !self.cfg.daemon {
                    self.pending_exit = Some(EXIT_FAILURE);
                }
                Flow::Continue
            }
            None if self.cfg.daemon => Flow::Continue,
            None => Flow::Exit(EXIT_FAILURE),
        }
    }

    fn on_interrupt(&mut self) -> Flow {
        match self.child {
            Some(pid) => {
                self.signal_child(pid, Signal::SIGINT);
                if !self.cfg.daemon {
                    self.pending_exit = Some(EXIT_FAILURE);
                    self.restart_enabled = false;
                }
                Flow::Continue
            }
            None if self.cfg.daemon => Flow::Continue,
            None => Flow::Exit(EXIT_FAILURE),
        }
    }

    fn on_terminate(&mut self) -> Flow {
        match self.child {
            Some(pid) => {
                self.signal_child(pid, Signal::SIGTERM);
                self.pending_exit = Some(EXIT_FAILURE);
                self.restart_enabled = false;
                Flow::Continue
            }
            None => Flow::Exit(EXIT_FAILURE),
        }
    }

    /// USR2 or `+`: re-enable monitoring from a clean slate.
    fn resume_monitoring(&mut self) -> Flow {
        self.restart_enabled = true;
        self.backoff.reset();
        if self.child.is_none() {
            self.start_child();
        }
        Flow::Continue
    }

    fn start_child(&mut self) {
        let mut close_fds = vec![self.self_pipe.read_fd(), self.self_pipe.write_fd()];
        if let Some(channel) = &self.channel {
            close_fds.extend(channel.raw_fds());
        }

        match child::spawn(&self.spec, &close_fds) {
            Ok(SpawnedChild { pid, master }) => {
                tracing::info!(
                    pid = pid.as_raw(),
                    program = %self.cfg.program[0],
                    "child started"
                );
                self.child = Some(pid);
                self.pty = Some(PtyReader::new(master, pid.as_raw()));
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    delay = START_FAILURE_DELAY,
                    "cannot start child, retrying later"
                );
                self.backoff.set_failure_delay();
                let _ = alarm::set(self.backoff.arm_delay());
            }
        }
    }

    fn signal_child(&self, pid: Pid, sig: Signal) {
        tracing::info!(pid = pid.as_raw(), signal = %sig, "signalling child");
        if let Err(e) = kill(pid, sig) {
            tracing::warn!(pid = pid.as_raw(), signal = %sig, error = %e, "cannot signal child");
        }
    }

    /// `x` command: terminate, wait bounded, kill if necessary.
    ///
    /// Re-enters the normal loop iteration with the back-off clamped so
    /// PTY output and further commands are serviced while waiting; this
    /// keeps the awaiting-child-death state out of the main loop.
    fn graceful_shutdown(&mut self) -> Flow {
        tracing::info!("exit requested, shutting down");
        self.pending_exit = Some(EXIT_SUCCESS);
        self.restart_enabled = false;

        let Some(pid) = self.child else {
            return Flow::Exit(EXIT_SUCCESS);
        };
        self.signal_child(pid, Signal::SIGTERM);
        self.backoff.clamp_for_shutdown();

        let deadline = Instant::now() + SHUTDOWN_WINDOW;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let timeout = timeout_for(deadline - now);
            if let Flow::Exit(code) = self.iterate(timeout) {
                return Flow::Exit(code);
            }
            if self.child.is_none() {
                return Flow::Exit(EXIT_SUCCESS);
            }
        }

        tracing::warn!(pid = pid.as_raw(), "child did not exit in time, killing");
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
        Flow::Exit(EXIT_SUCCESS)
    }
}

fn has_events(fd: &PollFd) -> bool {
    fd.revents().is_some_and(|r| !r.is_empty())
}

fn timeout_for(duration: Duration) -> PollTimeout {
    let ms = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);
    PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(2, 10);
        let mut delays = Vec::new();
        for _ in 0..5 {
            delays.push(backoff.arm_delay());
            backoff.advance();
        }
        assert_eq!(delays, vec![2, 4, 8, 10, 10]);
    }

    #[test]
    fn backoff_reset_returns_to_min() {
        let mut backoff = Backoff::new(2, 300);
        for _ in 0..6 {
            backoff.advance();
        }
        assert!(backoff.current > 2);
        backoff.reset();
        assert_eq!(backoff.current, 2);
        assert_eq!(backoff.arm_delay(), 2);
    }

    #[test]
    fn zero_min_arms_one_second() {
        let backoff = Backoff::new(0, 10);
        assert_eq!(backoff.current, 0);
        assert_eq!(backoff.arm_delay(), 1);
    }

    #[test]
    fn failure_delay_overrides_backoff() {
        let mut backoff = Backoff::new(2, 10);
        backoff.set_failure_delay();
        assert_eq!(backoff.arm_delay(), START_FAILURE_DELAY);
        // The next exit re-caps at max.
        backoff.advance();
        assert_eq!(backoff.current, 10);
    }

    #[test]
    fn shutdown_clamp_pins_both_bounds() {
        let mut backoff = Backoff::new(2, 300);
        backoff.advance();
        backoff.clamp_for_shutdown();
        assert_eq!(backoff.arm_delay(), SHUTDOWN_DELAY);
        backoff.advance();
        assert_eq!(backoff.current, SHUTDOWN_DELAY);
        backoff.reset();
        assert_eq!(backoff.current, SHUTDOWN_DELAY);
    }

    #[test]
    fn poll_timeout_saturates() {
        assert_eq!(
            timeout_for(Duration::from_secs(2)),
            PollTimeout::try_from(2000).unwrap()
        );
        // Far beyond i32 milliseconds still yields a valid timeout.
        let _ = timeout_for(Duration::from_secs(u64::from(u32::MAX)));
    }
}
