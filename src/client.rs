//! One-shot command sender.
//!
//! Translates a command name to its wire byte and writes it to the FIFO
//! of a running supervisor, then exits. No handshake: the protocol is a
//! single byte.

use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use nix::unistd::write;

use crate::supervisor::command::Command;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("unknown command: {0} (expected start, stop, exit, hup, or int)")]
    UnknownCommand(String),
    #[error("command FIFO {} does not exist", .0.display())]
    MissingFifo(PathBuf),
    #[error("no supervisor is reading {}", .0.display())]
    NoReader(PathBuf),
    #[error("cannot write to {}: {source}", .path.display())]
    Write { path: PathBuf, source: nix::Error },
}

/// Send one command byte to the supervisor listening on `fifo`.
pub fn send(name: &str, fifo: &Path) -> Result<(), ClientError> {
    let cmd =
        Command::from_name(name).ok_or_else(|| ClientError::UnknownCommand(name.to_string()))?;

    // A non-blocking write-only open distinguishes "nobody is reading"
    // (ENXIO) from a missing path.
    let fd = match open(fifo, OFlag::O_WRONLY | OFlag::O_NONBLOCK, Mode::empty()) {
        Ok(fd) => fd,
        Err(Errno::ENOENT) => return Err(ClientError::MissingFifo(fifo.to_path_buf())),
        Err(Errno::ENXIO) => return Err(ClientError::NoReader(fifo.to_path_buf())),
        Err(source) => {
            return Err(ClientError::Write {
                path: fifo.to_path_buf(),
                source,
            });
        }
    };

    write(&fd, &[cmd.byte()]).map_err(|source| ClientError::Write {
        path: fifo.to_path_buf(),
        source,
    })?;
    Ok(())
}
