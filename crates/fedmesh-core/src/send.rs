//! Non-blocking send with bounded in-place retry.
//!
//! A send never waits for socket space. Each attempt is classified as
//! written, transient (would-block / interrupted) or fatal; transient
//! attempts are retried immediately a bounded number of times and then
//! reported as [`SendOutcome::Deferred`]. Only [`SendOutcome::Failed`]
//! should change connection state.

use std::io;

use tokio::net::TcpStream;

/// Anything that supports a single non-blocking write attempt.
pub trait TryWrite {
    fn try_write_once(&self, buf: &[u8]) -> io::Result<usize>;
}

impl TryWrite for TcpStream {
    fn try_write_once(&self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }
}

/// Classification of one write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Written(usize),
    Transient,
    Fatal(io::ErrorKind),
}

fn classify(result: io::Result<usize>, len: usize) -> Step {
    match result {
        Ok(0) if len > 0 => Step::Fatal(io::ErrorKind::WriteZero),
        Ok(n) => Step::Written(n),
        Err(e) if is_transient(e.kind()) => Step::Transient,
        Err(e) => Step::Fatal(e.kind()),
    }
}

/// Errors that are retried in place without touching connection state.
pub fn is_transient(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Result of [`try_send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Some or all of the payload went out.
    Sent { written: usize, len: usize },
    /// Every attempt would have blocked or was interrupted.
    Deferred,
    /// The socket is dead (peer closed, reset, ...).
    Failed(io::ErrorKind),
}

impl SendOutcome {
    pub fn is_partial(&self) -> bool {
        matches!(self, SendOutcome::Sent { written, len } if written < len)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SendOutcome::Failed(_))
    }
}

/// Attempt one non-blocking send, retrying transient errors up to `retries`
/// extra times.
pub fn try_send<W: TryWrite + ?Sized>(writer: &W, payload: &[u8], retries: u32) -> SendOutcome {
    let len = payload.len();
    for _ in 0..=retries {
        match classify(writer.try_write_once(payload), len) {
            Step::Written(written) => return SendOutcome::Sent { written, len },
            Step::Transient => continue,
            Step::Fatal(kind) => return SendOutcome::Failed(kind),
        }
    }
    SendOutcome::Deferred
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Writer that replays a scripted list of results.
    struct Scripted {
        results: RefCell<VecDeque<io::Result<usize>>>,
        calls: RefCell<u32>,
    }

    impl Scripted {
        fn new(results: Vec<io::Result<usize>>) -> Self {
            Self {
                results: RefCell::new(results.into()),
                calls: RefCell::new(0),
            }
        }
    }

    impl TryWrite for Scripted {
        fn try_write_once(&self, buf: &[u8]) -> io::Result<usize> {
            *self.calls.borrow_mut() += 1;
            self.results
                .borrow_mut()
                .pop_front()
                .unwrap_or(Ok(buf.len()))
        }
    }

    fn err(kind: io::ErrorKind) -> io::Result<usize> {
        Err(io::Error::from(kind))
    }

    #[test]
    fn test_full_write() {
        let w = Scripted::new(vec![Ok(5)]);
        assert_eq!(try_send(&w, b"1234\0", 2), SendOutcome::Sent { written: 5, len: 5 });
    }

    #[test]
    fn test_partial_write_is_success() {
        let w = Scripted::new(vec![Ok(2)]);
        let out = try_send(&w, b"1234\0", 2);
        assert!(out.is_partial());
        assert!(!out.is_fatal());
    }

    #[test]
    fn test_transient_then_success() {
        let w = Scripted::new(vec![err(io::ErrorKind::WouldBlock), err(io::ErrorKind::Interrupted), Ok(5)]);
        assert_eq!(try_send(&w, b"1234\0", 2), SendOutcome::Sent { written: 5, len: 5 });
        assert_eq!(*w.calls.borrow(), 3);
    }

    #[test]
    fn test_transient_exhausted_is_deferred() {
        let w = Scripted::new((0..3).map(|_| err(io::ErrorKind::WouldBlock)).collect());
        assert_eq!(try_send(&w, b"1234\0", 2), SendOutcome::Deferred);
        assert_eq!(*w.calls.borrow(), 3);
    }

    #[test]
    fn test_broken_pipe_is_fatal() {
        let w = Scripted::new(vec![err(io::ErrorKind::BrokenPipe)]);
        assert_eq!(
            try_send(&w, b"1234\0", 2),
            SendOutcome::Failed(io::ErrorKind::BrokenPipe)
        );
        assert_eq!(*w.calls.borrow(), 1);
    }

    #[test]
    fn test_zero_write_is_fatal() {
        let w = Scripted::new(vec![Ok(0)]);
        assert_eq!(
            try_send(&w, b"x", 0),
            SendOutcome::Failed(io::ErrorKind::WriteZero)
        );
    }
}
