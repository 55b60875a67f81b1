//! A level-triggered reactor backed by `poll(2)`.

use super::Token;
use std::{
    cell::RefCell, collections::BTreeMap, io, os::fd::RawFd, rc::Rc, time::Duration,
};
use tracing::trace;

/// Conditions reported as readable. Hangups and errors are included so that
/// the next read observes end-of-stream or the error itself.
const READABLE: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;

/// Watches descriptors with `poll(2)`.
///
/// Clones share the same interest set, so a clone can be handed to every
/// channel of the loop while the loop itself calls [Reactor::poll].
#[derive(Clone, Debug, Default)]
pub struct Reactor {
    interest: Rc<RefCell<BTreeMap<Token, RawFd>>>,
}

impl Reactor {
    /// Creates a reactor with an empty interest set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of watched tokens.
    pub fn len(&self) -> usize {
        self.interest.borrow().len()
    }

    /// Returns true if nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.interest.borrow().is_empty()
    }

    /// Waits until at least one watched descriptor is ready or `timeout`
    /// elapses (`None` waits indefinitely), returning the ready tokens.
    ///
    /// Returns no tokens if interrupted by a signal, or immediately if nothing
    /// is watched and no timeout was given.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Vec<Token>> {
        let (tokens, mut fds): (Vec<Token>, Vec<libc::pollfd>) = self
            .interest
            .borrow()
            .iter()
            .map(|(&token, &fd)| {
                let pollfd = libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                };
                (token, pollfd)
            })
            .unzip();
        if fds.is_empty() && timeout.is_none() {
            return Ok(Vec::new());
        }

        // Round up so a sub-millisecond timeout does not become a busy loop
        let timeout = timeout.map_or(-1, |timeout| {
            let millis = timeout.as_nanos().div_ceil(1_000_000);
            millis.min(libc::c_int::MAX as u128) as libc::c_int
        });

        // SAFETY: fds points to fds.len() initialized pollfd structures that
        // outlive the call.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let ready: Vec<Token> = tokens
            .into_iter()
            .zip(fds)
            .filter(|(_, pollfd)| pollfd.revents & READABLE != 0)
            .map(|(token, _)| token)
            .collect();
        trace!(ready = ready.len(), "poll returned");
        Ok(ready)
    }
}

impl super::Reactor for Reactor {
    fn watch(&self, token: Token, fd: RawFd) {
        self.interest.borrow_mut().insert(token, fd);
    }

    fn unwatch(&self, token: Token) {
        self.interest.borrow_mut().remove(&token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor as _;
    use std::{io::Write, os::fd::AsRawFd, os::unix::net::UnixStream};

    #[test]
    fn test_poll_reports_readable() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let reactor = Reactor::new();
        reactor.watch(Token(7), reader.as_raw_fd());
        assert_eq!(reactor.len(), 1);

        // Nothing written yet
        assert!(reactor.poll(Some(Duration::ZERO)).unwrap().is_empty());

        writer.write_all(b"ping").unwrap();
        let ready = reactor.poll(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(ready, vec![Token(7)]);

        // Level-triggered: still ready until drained
        let ready = reactor.poll(Some(Duration::ZERO)).unwrap();
        assert_eq!(ready, vec![Token(7)]);
    }

    #[test]
    fn test_poll_reports_hangup() {
        let (writer, reader) = UnixStream::pair().unwrap();
        let reactor = Reactor::new();
        reactor.watch(Token(1), reader.as_raw_fd());
        drop(writer);

        let ready = reactor.poll(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(ready, vec![Token(1)]);
    }

    #[test]
    fn test_unwatched_not_reported() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        let reactor = Reactor::new();
        reactor.watch(Token(1), reader.as_raw_fd());
        reactor.unwatch(Token(1));
        reactor.unwatch(Token(1));
        assert!(reactor.is_empty());

        writer.write_all(b"ping").unwrap();
        assert!(reactor.poll(Some(Duration::from_millis(10))).unwrap().is_empty());
        assert!(reactor.poll(None).unwrap().is_empty());
    }
}
