//! A reactor that records watches without waiting on anything.
//!
//! Tests own the event loop: they ask [Reactor::ready] which tokens are
//! watched and deliver notifications themselves, possibly more often than a
//! real poller would.

use super::Token;
use std::{cell::RefCell, collections::BTreeMap, os::fd::RawFd, rc::Rc};
use tracing::trace;

#[derive(Debug, Default)]
struct State {
    watches: BTreeMap<Token, RawFd>,
    watch_calls: usize,
    unwatch_calls: usize,
}

/// Records watch registrations for inspection.
#[derive(Clone, Debug, Default)]
pub struct Reactor {
    state: Rc<RefCell<State>>,
}

impl Reactor {
    /// Creates a reactor with no watches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `token` is currently watched.
    pub fn is_watching(&self, token: Token) -> bool {
        self.state.borrow().watches.contains_key(&token)
    }

    /// Returns the descriptor watched for `token`.
    pub fn fd(&self, token: Token) -> Option<RawFd> {
        self.state.borrow().watches.get(&token).copied()
    }

    /// Returns every watched token, in token order.
    pub fn ready(&self) -> Vec<Token> {
        self.state.borrow().watches.keys().copied().collect()
    }

    /// Returns how many times a watch was requested.
    pub fn watch_calls(&self) -> usize {
        self.state.borrow().watch_calls
    }

    /// Returns how many times a watch was cancelled.
    pub fn unwatch_calls(&self) -> usize {
        self.state.borrow().unwatch_calls
    }
}

impl super::Reactor for Reactor {
    fn watch(&self, token: Token, fd: RawFd) {
        trace!(?token, fd, "watch");
        let mut state = self.state.borrow_mut();
        state.watch_calls += 1;
        state.watches.insert(token, fd);
    }

    fn unwatch(&self, token: Token) {
        trace!(?token, "unwatch");
        let mut state = self.state.borrow_mut();
        state.unwatch_calls += 1;
        state.watches.remove(&token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor as _;

    #[test]
    fn test_watch_bookkeeping() {
        let reactor = Reactor::new();
        reactor.watch(Token(2), 10);
        reactor.watch(Token(1), 11);
        reactor.watch(Token(2), 12);
        assert_eq!(reactor.ready(), vec![Token(1), Token(2)]);
        assert_eq!(reactor.fd(Token(2)), Some(12));

        let clone = reactor.clone();
        clone.unwatch(Token(2));
        clone.unwatch(Token(3));
        assert!(!reactor.is_watching(Token(2)));
        assert!(reactor.is_watching(Token(1)));
        assert_eq!(reactor.watch_calls(), 3);
        assert_eq!(reactor.unwatch_calls(), 2);
    }
}
