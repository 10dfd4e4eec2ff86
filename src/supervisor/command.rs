//! Command channel: a named FIFO carrying one ASCII byte per command.
//!
//! The supervisor holds the FIFO open both for reading (the watched fd)
//! and for writing; the held-open writer guarantees the read side never
//! observes EOF just because the last external writer went away. There
//! is no framing and no acknowledgement.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{OFlag, open};
use nix::sys::stat::{Mode, SFlag, stat};
use nix::unistd::mkfifo;

/// Runtime commands understood by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `+`: resume monitoring, reset back-off, start a child if none.
    Start,
    /// `-`: stop monitoring; a running child is left alone.
    Stop,
    /// `h`: behave as if SIGHUP had been delivered.
    Hangup,
    /// `i`: behave as if SIGINT had been delivered.
    Interrupt,
    /// `x`: graceful shutdown.
    Exit,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'+' => Some(Command::Start),
            b'-' => Some(Command::Stop),
            b'h' => Some(Command::Hangup),
            b'i' => Some(Command::Interrupt),
            b'x' => Some(Command::Exit),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Command::Start => b'+',
            Command::Stop => b'-',
            Command::Hangup => b'h',
            Command::Interrupt => b'i',
            Command::Exit => b'x',
        }
    }

    /// Names accepted by the one-shot sender.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "start" => Some(Command::Start),
            "stop" => Some(Command::Stop),
            "exit" => Some(Command::Exit),
            "hup" => Some(Command::Hangup),
            "int" => Some(Command::Interrupt),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("{} exists and is not a FIFO", .0.display())]
    NotAFifo(PathBuf),
    #[error("cannot stat {}: {source}", .path.display())]
    Stat { path: PathBuf, source: nix::Error },
    #[error("cannot create FIFO {}: {source}", .path.display())]
    Create { path: PathBuf, source: nix::Error },
    #[error("cannot open FIFO {}: {source}", .path.display())]
    Open { path: PathBuf, source: nix::Error },
}

/// The supervisor's end of the command FIFO.
pub struct CommandChannel {
    path: PathBuf,
    reader: OwnedFd,
    /// Held open for the whole run, never written.
    writer: OwnedFd,
}

impl CommandChannel {
    /// Create the FIFO if absent (mode 0610) and open both ends.
    ///
    /// A path that exists but is not a FIFO fails startup.
    pub fn open(path: &Path) -> Result<Self, ChannelError> {
        match stat(path) {
            Ok(st) => {
                if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT != SFlag::S_IFIFO {
                    return Err(ChannelError::NotAFifo(path.to_path_buf()));
                }
            }
            Err(Errno::ENOENT) => {
                mkfifo(path, Mode::from_bits_truncate(0o610)).map_err(|source| {
                    ChannelError::Create {
                        path: path.to_path_buf(),
                        source,
                    }
                })?;
            }
            Err(source) => {
                return Err(ChannelError::Stat {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        let reader = open_reader(path)?;
        // Opened after the reader so it cannot block; never written.
        let writer =
            open(path, OFlag::O_WRONLY, Mode::empty()).map_err(|source| ChannelError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(CommandChannel {
            path: path.to_path_buf(),
            reader,
            writer,
        })
    }

    /// Reopen the read side after an EOF.
    pub fn reopen_reader(&mut self) -> Result<(), ChannelError> {
        self.reader = open_reader(&self.path)?;
        Ok(())
    }

    pub fn read_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Both fds, for the child's pre-exec close list.
    pub fn raw_fds(&self) -> [RawFd; 2] {
        [self.reader.as_raw_fd(), self.writer.as_raw_fd()]
    }

    pub fn read(&self, buf: &mut [u8]) -> nix::Result<usize> {
        nix::unistd::read(&self.reader, buf)
    }
}

fn open_reader(path: &Path) -> Result<OwnedFd, ChannelError> {
    open(path, OFlag::O_RDONLY | OFlag::O_NONBLOCK, Mode::empty()).map_err(|source| {
        ChannelError::Open {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;

    use super::*;

    #[test]
    fn byte_mapping_round_trips() {
        for byte in [b'+', b'-', b'h', b'i', b'x'] {
            assert_eq!(Command::from_byte(byte).unwrap().byte(), byte);
        }
        assert_eq!(Command::from_byte(b'?'), None);
    }

    #[test]
    fn names_map_to_commands() {
        assert_eq!(Command::from_name("start"), Some(Command::Start));
        assert_eq!(Command::from_name("stop"), Some(Command::Stop));
        assert_eq!(Command::from_name("exit"), Some(Command::Exit));
        assert_eq!(Command::from_name("hup"), Some(Command::Hangup));
        assert_eq!(Command::from_name("int"), Some(Command::Interrupt));
        assert_eq!(Command::from_name("restart"), None);
    }

    #[test]
    fn open_creates_missing_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd");

        let channel = CommandChannel::open(&path).unwrap();
        let st = stat(&path).unwrap();
        assert_eq!(
            SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT,
            SFlag::S_IFIFO
        );
        drop(channel);
    }

    #[test]
    fn open_rejects_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd");
        fs::write(&path, "not a fifo").unwrap();

        assert!(matches!(
            CommandChannel::open(&path),
            Err(ChannelError::NotAFifo(_))
        ));
    }

    #[test]
    fn bytes_from_external_writer_arrive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd");
        let channel = CommandChannel::open(&path).unwrap();

        // Empty FIFO reads would-block, not EOF, thanks to the held-open
        // writer.
        let mut buf = [0u8; 8];
        assert_eq!(channel.read(&mut buf), Err(nix::Error::EAGAIN));

        let mut writer = fs::OpenOptions::new().write(true).open(&path).unwrap();
        writer.write_all(b"+x").unwrap();
        drop(writer);

        let n = channel.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"+x");
        assert_eq!(Command::from_byte(buf[0]), Some(Command::Start));
        assert_eq!(Command::from_byte(buf[1]), Some(Command::Exit));
    }
}
