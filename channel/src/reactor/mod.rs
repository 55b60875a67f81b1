//! Readiness notification and the execution context readers run in.
//!
//! A [Reactor] keeps the set of descriptors whose read-readiness is being
//! watched. It does not call into channels itself: the event loop that owns
//! the reactor maps each ready [Token] back to its channel and invokes
//! [crate::FdInputChannel::on_readable]. Two implementations are provided:
//!
//! - [poll::Reactor] blocks in `poll(2)` and is meant for production use.
//! - [deterministic::Reactor] only records watches, letting tests decide when
//!   (and how often) a channel is notified.

use crate::BufferPool;
use std::os::fd::RawFd;

pub mod deterministic;
pub mod poll;

/// Identifies a watch registration, chosen by the owner of the channel.
///
/// Tokens must be unique among the channels registered with one reactor at
/// the same time. A channel only touches the reactor for its token while its
/// own watch is registered, so a token may be reused once the previous
/// channel stopped watching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

/// Registers and cancels read-readiness watches.
///
/// Both operations are idempotent: watching an already watched token rebinds
/// it to `fd`, and unwatching an unknown token does nothing.
pub trait Reactor: Clone {
    /// Starts delivering read-readiness of `fd` for `token`.
    fn watch(&self, token: Token, fd: RawFd);

    /// Stops delivering readiness for `token`.
    fn unwatch(&self, token: Token);
}

/// Resources shared by every channel running on one event loop.
#[derive(Clone, Debug)]
pub struct Context<R: Reactor> {
    pool: BufferPool,
    reactor: R,
}

impl<R: Reactor> Context<R> {
    /// Creates a context handing out buffers from `pool` and watches from
    /// `reactor`.
    pub const fn new(pool: BufferPool, reactor: R) -> Self {
        Self { pool, reactor }
    }

    /// Returns the buffer pool.
    pub const fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Returns the reactor.
    pub const fn reactor(&self) -> &R {
        &self.reactor
    }
}
