//! Reader that feeds a [Channel] from a non-blocking descriptor.
//!
//! [FdInputChannel] registers a read-readiness watch with the [Reactor] of its
//! [Context]. On every readiness notification (see
//! [FdInputChannel::on_readable]) it performs a bounded burst of `read(2)`
//! calls into pooled buffers and feeds each chunk to its channel:
//!
//! - A positive read is frozen into an [crate::IoBuf] and fed. If the consumer
//!   stops accepting, the watch is cancelled until the consumer catches up.
//! - A zero read is end-of-stream: the watch is cancelled for good and
//!   [Input::Eof] is fed once.
//! - `EAGAIN`/`EWOULDBLOCK` ends the burst; the watch stays in place.
//! - Any other error cancels the watch and is fed as [Input::Error].
//!
//! The descriptor is never opened, closed, or reconfigured here; closing it
//! after [FdInputChannel::deinitialize] is up to the caller.

use crate::{
    channel::{Channel, Disposition, Endpoint, Input, State},
    hooks::{Hooks, RefGuard},
    reactor::{Context, Reactor, Token},
    Error, IoBufMut,
};
use bytes::BufMut;
use std::{io, num::NonZeroUsize, os::fd::RawFd, rc::Rc};
use tracing::{debug, trace, warn};

/// Descriptor value while no descriptor is bound.
pub const UNBOUND: RawFd = -1;

/// Configuration for an [FdInputChannel].
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of reads performed per readiness notification.
    ///
    /// A value of 1 favors fairness between descriptors sharing a loop, larger
    /// values favor throughput of bulk transfers (fewer loop round trips per
    /// byte). Defaults to 1.
    burst_read_count: NonZeroUsize,
    /// Whether a read returning less than the free buffer capacity ends the
    /// burst early.
    ///
    /// A short read usually means the descriptor is drained, so the next read
    /// would only report `EAGAIN`. Defaults to true.
    short_read_exit: bool,
}

impl Config {
    // Setters
    /// See [Config]
    pub const fn with_burst_read_count(mut self, burst_read_count: NonZeroUsize) -> Self {
        self.burst_read_count = burst_read_count;
        self
    }
    /// See [Config]
    pub const fn with_short_read_exit(mut self, short_read_exit: bool) -> Self {
        self.short_read_exit = short_read_exit;
        self
    }

    // Getters
    /// See [Config]
    pub const fn burst_read_count(&self) -> NonZeroUsize {
        self.burst_read_count
    }
    /// See [Config]
    pub const fn short_read_exit(&self) -> bool {
        self.short_read_exit
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            burst_read_count: NZUsize!(1),
            short_read_exit: true,
        }
    }
}

/// Reads a non-blocking descriptor into a [Channel] on readiness.
///
/// Only input operations are exposed; the embedded channel is driven
/// internally. A single object can serve many connections in turn through
/// [FdInputChannel::reinitialize] and [FdInputChannel::deinitialize].
pub struct FdInputChannel<R: Reactor> {
    channel: Channel<FdInputChannel<R>>,
    context: Option<Context<R>>,
    token: Token,
    fd: RawFd,
    /// Whether the watch for `token` is registered.
    watching: bool,
    /// Unused tail of the block of the last read.
    buffer: Option<IoBufMut>,
    cfg: Config,
}

impl<R: Reactor> std::fmt::Debug for FdInputChannel<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdInputChannel")
            .field("token", &self.token)
            .field("fd", &self.fd)
            .field("watching", &self.watching)
            .field("channel", &self.channel)
            .finish()
    }
}

impl<R: Reactor> Endpoint for FdInputChannel<R> {
    fn channel(&mut self) -> &mut Channel<Self> {
        &mut self.channel
    }
}

impl<R: Reactor> FdInputChannel<R> {
    /// Creates a channel without an execution context. Bind one with
    /// [FdInputChannel::set_context] before use.
    pub fn new(token: Token, cfg: Config) -> Self {
        Self {
            channel: Channel::new(),
            context: None,
            token,
            fd: UNBOUND,
            watching: false,
            buffer: None,
            cfg,
        }
    }

    /// Creates a channel bound to `context`.
    pub fn with_context(context: Context<R>, token: Token, cfg: Config) -> Self {
        let mut channel = Self::new(token, cfg);
        channel.context = Some(context);
        channel
    }

    /// Binds the execution context. May only be called once, right after
    /// [FdInputChannel::new].
    pub fn set_context(&mut self, context: Context<R>) -> Result<(), Error> {
        if self.context.is_some() {
            return Err(Error::ContextAlreadyBound);
        }
        self.context = Some(context);
        Ok(())
    }

    /// Binds a non-blocking descriptor and resets the channel to accept input.
    ///
    /// May only be called right after construction or
    /// [FdInputChannel::deinitialize].
    pub fn reinitialize(&mut self, fd: RawFd) -> Result<(), Error> {
        if fd < 0 {
            return Err(Error::InvalidDescriptor(fd));
        }
        if self.fd != UNBOUND {
            return Err(Error::AlreadyBound(self.fd));
        }
        if self.context.is_none() {
            return Err(Error::MissingContext);
        }
        self.channel.reinitialize();
        self.fd = fd;
        debug!(token = ?self.token, fd, "bound descriptor");
        Ok(())
    }

    /// Cancels the watch, releases the held buffer, and unbinds the descriptor.
    ///
    /// Safe to call from within the data callback.
    pub fn deinitialize(&mut self) {
        self.buffer = None;
        self.stop_watch();
        if self.fd != UNBOUND {
            debug!(token = ?self.token, fd = self.fd, "unbound descriptor");
        }
        self.fd = UNBOUND;
        self.channel.set_consumed_callback(None);
        self.channel.deinitialize();
    }

    /// Registers the watch and immediately reads whatever is already available,
    /// without waiting for the next loop iteration.
    ///
    /// May only be called right after [FdInputChannel::reinitialize].
    pub fn start_reading(&mut self) -> Result<(), Error> {
        self.start_reading_in_next_tick()?;
        self.on_readable_without_ref_guard();
        Ok(())
    }

    /// Registers the watch; the first read happens on the next readiness
    /// notification.
    ///
    /// May only be called right after [FdInputChannel::reinitialize].
    pub fn start_reading_in_next_tick(&mut self) -> Result<(), Error> {
        if self.context.is_none() {
            return Err(Error::MissingContext);
        }
        if self.fd == UNBOUND || !self.channel.accepting_input() {
            return Err(Error::NotAccepting);
        }
        self.start_watch();
        Ok(())
    }

    /// Resumes delivery after [FdInputChannel::stop].
    pub fn start(&mut self) {
        Channel::start(self);
    }

    /// Stops delivery. Anything read meanwhile is held until
    /// [FdInputChannel::start], and reading pauses after the first such read.
    pub fn stop(&mut self) {
        self.channel.stop();
    }

    /// Signals that the consumer finished with the buffer it paused on.
    pub fn consumed(&mut self, size: usize, end: bool) {
        Channel::consumed(self, size, end);
    }

    /// Returns the bound descriptor, or [UNBOUND].
    pub const fn fd(&self) -> RawFd {
        self.fd
    }

    /// Returns the token identifying this channel's watch.
    pub const fn token(&self) -> Token {
        self.token
    }

    /// Returns true if the readiness watch is registered.
    pub const fn is_watching(&self) -> bool {
        self.watching
    }

    /// Returns the state of the embedded channel.
    pub const fn state(&self) -> State {
        self.channel.state()
    }

    /// Returns the configuration.
    pub const fn config(&self) -> &Config {
        &self.cfg
    }

    /// Changes how many reads one readiness notification may perform.
    pub fn set_burst_read_count(&mut self, burst_read_count: NonZeroUsize) {
        self.cfg.burst_read_count = burst_read_count;
    }

    /// Installs the consumer callback.
    pub fn set_data_callback<F>(&mut self, callback: F)
    where
        F: Fn(&mut Self, Input<'_>) -> Disposition + 'static,
    {
        self.channel.set_data_callback(callback);
    }

    /// Returns the hooks of the enclosing object.
    pub const fn hooks(&self) -> Option<&Rc<dyn Hooks>> {
        self.channel.hooks()
    }

    /// Sets the hooks of the enclosing object.
    pub fn set_hooks(&mut self, hooks: Option<Rc<dyn Hooks>>) {
        self.channel.set_hooks(hooks);
    }

    /// Handles a readiness notification for this channel's token.
    ///
    /// Notifications arriving while the watch is not registered (for example
    /// from a ready list computed before end-of-stream) are ignored.
    pub fn on_readable(&mut self) {
        if !self.watching {
            trace!(token = ?self.token, "ignoring readiness without watch");
            return;
        }
        let _guard = RefGuard::new(self.channel.hooks());
        self.on_readable_without_ref_guard();
    }

    fn on_readable_without_ref_guard(&mut self) {
        let Some(context) = self.context.clone() else {
            return;
        };
        let generation = self.channel.generation();

        for _ in 0..self.cfg.burst_read_count.get() {
            let mut buffer = match self.buffer.take() {
                Some(buffer) => buffer,
                None => match context.pool().try_alloc() {
                    Ok(buffer) => buffer,
                    Err(err) => {
                        // Retry on the next notification
                        debug!(?err, fd = self.fd, "no buffer available, deferring read");
                        return;
                    }
                },
            };

            let free = buffer.remaining_mut();
            match read(self.fd, &mut buffer) {
                Ok(0) => {
                    trace!(fd = self.fd, "end of stream");
                    drop(buffer);
                    self.stop_watch();
                    Channel::feed_eof(self);
                    return;
                }
                Ok(n) => {
                    trace!(fd = self.fd, bytes = n, "read");
                    // When the block is full, the tail is None and the block
                    // is only pinned by the chunk being fed
                    let (data, rest) = buffer.split();
                    self.buffer = rest;
                    Channel::feed(self, data);
                    if generation != self.channel.generation() {
                        // Callback deinitialized or reinitialized this object
                        return;
                    }

                    if !self.channel.accepting_input() {
                        self.stop_watch();
                        if self.channel.may_accept_input_later() {
                            self.channel
                                .set_consumed_callback(Some(Self::on_channel_consumed));
                        }
                        return;
                    }
                    if self.cfg.short_read_exit && n < free {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.buffer = Some(buffer);
                    return;
                }
                Err(err) => {
                    warn!(?err, fd = self.fd, "read failed");
                    drop(buffer);
                    self.stop_watch();
                    Channel::feed_error(self, err);
                    return;
                }
            }
        }
    }

    fn on_channel_consumed(&mut self, _size: usize) {
        self.channel.set_consumed_callback(None);
        if self.channel.accepting_input() {
            self.start_watch();
        }
    }

    fn start_watch(&mut self) {
        if let Some(context) = &self.context {
            context.reactor().watch(self.token, self.fd);
            self.watching = true;
        }
    }

    fn stop_watch(&mut self) {
        if !self.watching {
            return;
        }
        if let Some(context) = &self.context {
            context.reactor().unwatch(self.token);
        }
        self.watching = false;
    }
}

impl<R: Reactor> Drop for FdInputChannel<R> {
    fn drop(&mut self) {
        self.stop_watch();
    }
}

/// Reads into the writable region of `buffer`, retrying when interrupted.
fn read(fd: RawFd, buffer: &mut IoBufMut) -> io::Result<usize> {
    let (ptr, len) = {
        let spare = buffer.chunk_mut();
        (spare.as_mut_ptr(), spare.len())
    };
    loop {
        // SAFETY: ptr is valid for writes of len bytes, owned exclusively by
        // buffer, for the duration of the call.
        let ret = unsafe { libc::read(fd, ptr.cast(), len) };
        if ret >= 0 {
            let n = ret as usize;
            // SAFETY: read(2) initialized the first n bytes of the region.
            unsafe { buffer.advance_mut(n) };
            return Ok(n);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
