//! Signal trampoline and self-pipe.
//!
//! Signals are reified as single bytes on a non-blocking pipe so the
//! event loop can treat them as ordinary I/O. The handler is
//! async-signal-safe: it maps the signal number to a token and writes it
//! with the raw `write` syscall; nothing else.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd::pipe2;

pub const TOKEN_ALARM: u8 = b'A';
pub const TOKEN_CHILD: u8 = b'C';
pub const TOKEN_HANGUP: u8 = b'H';
pub const TOKEN_INTERRUPT: u8 = b'I';
pub const TOKEN_TERMINATE: u8 = b'T';
pub const TOKEN_USER1: u8 = b'1';
pub const TOKEN_USER2: u8 = b'2';

/// Signals routed through the trampoline.
pub const CAUGHT_SIGNALS: [Signal; 7] = [
    Signal::SIGALRM,
    Signal::SIGCHLD,
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// Write end of the current self-pipe; -1 until one exists. The handler
/// reads this atomically so pipe recreation can swap it at runtime.
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Token byte for a caught signal number.
pub fn token_for(signo: libc::c_int) -> Option<u8> {
    match signo {
        libc::SIGALRM => Some(TOKEN_ALARM),
        libc::SIGCHLD => Some(TOKEN_CHILD),
        libc::SIGHUP => Some(TOKEN_HANGUP),
        libc::SIGINT => Some(TOKEN_INTERRUPT),
        libc::SIGTERM => Some(TOKEN_TERMINATE),
        libc::SIGUSR1 => Some(TOKEN_USER1),
        libc::SIGUSR2 => Some(TOKEN_USER2),
        _ => None,
    }
}

extern "C" fn trampoline(signo: libc::c_int) {
    let Some(token) = token_for(signo) else {
        return;
    };
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    // SAFETY: raw write on a valid fd with stack-local data; the result
    // is ignored, a full pipe coalesces the event.
    unsafe { libc::write(fd, (&raw const token).cast(), 1) };
}

/// The byte queue bridging signal context and the event loop.
///
/// Both ends are non-blocking: the read side never stalls the loop and
/// the handler's write never stalls the process. The write end is
/// inherited by children, which close it before exec.
pub struct SelfPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl SelfPipe {
    pub fn create() -> nix::Result<Self> {
        let (read, write) = pipe2(OFlag::O_NONBLOCK)?;
        PIPE_WRITE_FD.store(write.as_raw_fd(), Ordering::Relaxed);
        Ok(SelfPipe { read, write })
    }

    /// Replace a pipe whose ends were observed closed.
    ///
    /// The fresh write fd is published before the old ends drop, so the
    /// handler never sees a dangling descriptor.
    pub fn recreate(&mut self) -> nix::Result<()> {
        *self = Self::create()?;
        Ok(())
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub fn write_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    pub fn read(&self, buf: &mut [u8]) -> nix::Result<usize> {
        nix::unistd::read(&self.read, buf)
    }
}

/// Install the trampoline for every caught signal.
///
/// The self-pipe must exist first. SA_NOCLDSTOP keeps stopped (not
/// exited) children from generating events.
pub fn install() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(trampoline),
        SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    for sig in CAUGHT_SIGNALS {
        // SAFETY: the handler is async-signal-safe (raw write only).
        unsafe { sigaction(sig, &action)? };
    }
    Ok(())
}
