//! Read from non-blocking descriptors into pooled buffers with consumer
//! backpressure.
//!
//! An [FdInputChannel] watches a descriptor through a [Reactor] and, whenever
//! it becomes readable, reads a bounded burst of chunks into blocks checked out
//! of a [BufferPool]. Each chunk is handed to a consumer callback through the
//! [Channel] state machine, which lets the consumer pause (and later resume)
//! reading, stop and start delivery, or end the stream. The consumer may also
//! tear down or rebind the reader from inside its own callback.
//!
//! # Example
//!
//! ```rust
//! use prometheus_client::registry::Registry;
//! use spigot_channel::{
//!     reactor::poll, BufferPool, BufferPoolConfig, Config, Context, Disposition,
//!     FdInputChannel, Input, Token,
//! };
//! use std::{io::Write, os::fd::AsRawFd, os::unix::net::UnixStream, time::Duration};
//!
//! let (mut writer, reader) = UnixStream::pair().unwrap();
//! reader.set_nonblocking(true).unwrap();
//!
//! let pool = BufferPool::new(BufferPoolConfig::for_network(), &mut Registry::default());
//! let reactor = poll::Reactor::new();
//! let context = Context::new(pool, reactor.clone());
//!
//! let mut channel = FdInputChannel::with_context(context, Token(0), Config::default());
//! channel.set_data_callback(|_: &mut FdInputChannel<poll::Reactor>, input| {
//!     if let Input::Data(buf) = input {
//!         assert_eq!(&buf[..], b"hello");
//!     }
//!     Disposition::Continue
//! });
//! channel.reinitialize(reader.as_raw_fd()).unwrap();
//! channel.start_reading_in_next_tick().unwrap();
//!
//! writer.write_all(b"hello").unwrap();
//! drop(writer);
//! while !reactor.is_empty() {
//!     for _ in reactor.poll(Some(Duration::from_secs(1))).unwrap() {
//!         channel.on_readable();
//!     }
//! }
//! ```
//!
//! # Status
//!
//! `spigot-channel` is **ALPHA** software and is not yet recommended for
//! production use. Developers should expect breaking changes and occasional
//! instability.

use std::os::fd::RawFd;
use thiserror::Error;

#[macro_use]
mod macros;

mod channel;
mod fd;
pub mod hooks;
pub mod iobuf;
pub mod reactor;

pub use channel::{Channel, ConsumedCallback, DataCallback, Disposition, Endpoint, Input, State};
pub use fd::{Config, FdInputChannel, UNBOUND};
pub use hooks::{Hooks, RefGuard};
pub use iobuf::{BufferPool, BufferPoolConfig, IoBuf, IoBufMut, PoolError};
pub use reactor::{Context, Reactor, Token};

/// Errors returned when a reader is driven out of order.
///
/// I/O failures of the descriptor itself are not reported here: they are
/// delivered to the consumer as [Input::Error].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("no execution context bound")]
    MissingContext,
    #[error("execution context already bound")]
    ContextAlreadyBound,
    #[error("descriptor already bound: {0}")]
    AlreadyBound(RawFd),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(RawFd),
    #[error("not accepting input")]
    NotAccepting,
}
