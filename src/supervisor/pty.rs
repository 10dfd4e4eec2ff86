//! Child output: PTY draining, line reassembly, CRLF normalisation.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;

/// Line buffer capacity; a line reaching one byte short of this is
/// flushed as if terminated.
pub const LINE_BUF_CAP: usize = 2048;

const FLUSH_AT: usize = LINE_BUF_CAP - 1;
const READ_CHUNK: usize = 1024;

/// Reassembles terminal output into lines.
///
/// A newline or NUL terminates a line; a CR immediately before the
/// newline is dropped so logged lines end in a single LF. Emitted lines
/// carry no terminator.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        LineAssembler {
            buf: Vec::with_capacity(LINE_BUF_CAP),
        }
    }

    pub fn push(&mut self, data: &[u8], emit: &mut dyn FnMut(&[u8])) {
        for &byte in data {
            match byte {
                b'\n' => {
                    if self.buf.last() == Some(&b'\r') {
                        self.buf.pop();
                    }
                    emit(&self.buf);
                    self.buf.clear();
                }
                0 => {
                    emit(&self.buf);
                    self.buf.clear();
                }
                _ => {
                    self.buf.push(byte);
                    if self.buf.len() >= FLUSH_AT {
                        emit(&self.buf);
                        self.buf.clear();
                    }
                }
            }
        }
    }

    /// Emit an unterminated trailing line, if any.
    pub fn flush(&mut self, emit: &mut dyn FnMut(&[u8])) {
        if !self.buf.is_empty() {
            emit(&self.buf);
            self.buf.clear();
        }
    }
}

/// Whether the PTY master is still producing output.
#[derive(Debug, PartialEq, Eq)]
pub enum PtyStatus {
    Open,
    Closed,
}

/// Non-blocking reader over a child's PTY master.
pub struct PtyReader {
    master: OwnedFd,
    pid: i32,
    lines: LineAssembler,
}

impl PtyReader {
    /// `master` must already be non-blocking.
    pub fn new(master: OwnedFd, pid: i32) -> Self {
        PtyReader {
            master,
            pid,
            lines: LineAssembler::new(),
        }
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Drain and log everything currently readable.
    ///
    /// `Closed` means the child's side is gone (EOF or EIO, both normal
    /// at exit); the caller drops the reader, closing the master.
    pub fn drain(&mut self) -> PtyStatus {
        let pid = self.pid;
        self.drain_into(&mut |line| crate::logging::child_line(pid, line))
    }

    /// Flush a pending partial line, for PTY teardown at child reap.
    pub fn flush_partial(&mut self) {
        let pid = self.pid;
        self.lines.flush(&mut |line| crate::logging::child_line(pid, line));
    }

    fn drain_into(&mut self, emit: &mut dyn FnMut(&[u8])) -> PtyStatus {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match nix::unistd::read(&self.master, &mut chunk) {
                Ok(0) => return self.closed("end of output", emit),
                Ok(n) => self.lines.push(&chunk[..n], emit),
                Err(Errno::EAGAIN) => return PtyStatus::Open,
                Err(Errno::EINTR) => continue,
                // EIO from a PTY master is how child exit looks.
                Err(Errno::EIO) => return self.closed("terminal closed", emit),
                Err(e) => return self.closed(&format!("read failed: {e}"), emit),
            }
        }
    }

    fn closed(&mut self, reason: &str, emit: &mut dyn FnMut(&[u8])) -> PtyStatus {
        self.lines.flush(emit);
        tracing::info!(pid = self.pid, "child output finished ({reason})");
        PtyStatus::Closed
    }
}

#[cfg(test)]
mod tests {
    use nix::fcntl::{FcntlArg, OFlag, fcntl};
    use nix::pty::openpty;

    use super::*;

    fn collect(assembler: &mut LineAssembler, data: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        assembler.push(data, &mut |line| lines.push(line.to_vec()));
        lines
    }

    #[test]
    fn newline_terminates_lines() {
        let mut a = LineAssembler::new();
        let lines = collect(&mut a, b"one\ntwo\n");
        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn crlf_collapses_to_lf() {
        let mut a = LineAssembler::new();
        let lines = collect(&mut a, b"a\r\nb\n");
        assert_eq!(lines, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn interior_cr_is_preserved() {
        let mut a = LineAssembler::new();
        let lines = collect(&mut a, b"a\rb\n");
        assert_eq!(lines, vec![b"a\rb".to_vec()]);
    }

    #[test]
    fn nul_terminates_like_newline() {
        let mut a = LineAssembler::new();
        let lines = collect(&mut a, b"abc\0def\n");
        assert_eq!(lines, vec![b"abc".to_vec(), b"def".to_vec()]);
    }

    #[test]
    fn partial_line_spans_pushes() {
        let mut a = LineAssembler::new();
        assert!(collect(&mut a, b"hel").is_empty());
        let lines = collect(&mut a, b"lo\n");
        assert_eq!(lines, vec![b"hello".to_vec()]);
    }

    #[test]
    fn overlong_line_is_split() {
        let mut a = LineAssembler::new();
        let data = vec![b'x'; FLUSH_AT + 10];
        let mut lines = collect(&mut a, &data);
        a.flush(&mut |line| lines.push(line.to_vec()));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), FLUSH_AT);
        assert_eq!(lines[1].len(), 10);
    }

    #[test]
    fn flush_emits_pending_bytes_once() {
        let mut a = LineAssembler::new();
        let mut lines = collect(&mut a, b"tail");
        a.flush(&mut |line| lines.push(line.to_vec()));
        a.flush(&mut |line| lines.push(line.to_vec()));
        assert_eq!(lines, vec![b"tail".to_vec()]);
    }

    #[test]
    fn drain_reads_lines_and_detects_close() {
        let pty = openpty(None::<&nix::pty::Winsize>, None::<&nix::sys::termios::Termios>).unwrap();
        fcntl(&pty.master, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).unwrap();

        // Raw mode so the line discipline passes bytes through verbatim.
        let mut termios = nix::sys::termios::tcgetattr(&pty.slave).unwrap();
        nix::sys::termios::cfmakeraw(&mut termios);
        nix::sys::termios::tcsetattr(
            &pty.slave,
            nix::sys::termios::SetArg::TCSANOW,
            &termios,
        )
        .unwrap();

        let mut reader = PtyReader::new(pty.master, 1);
        nix::unistd::write(&pty.slave, b"a\r\nb").unwrap();

        let mut lines = Vec::new();
        assert_eq!(
            reader.drain_into(&mut |line| lines.push(line.to_vec())),
            PtyStatus::Open
        );
        assert_eq!(lines, vec![b"a".to_vec()]);

        // Closing the slave ends the stream; the partial line must not
        // be lost.
        drop(pty.slave);
        assert_eq!(
            reader.drain_into(&mut |line| lines.push(line.to_vec())),
            PtyStatus::Closed
        );
        assert_eq!(lines, vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
