//! Consumer-facing input state machine.
//!
//! A [Channel] sits between a reader (which produces buffers) and a consumer
//! (which processes them in a data callback). It knows nothing about
//! descriptors or event loops: readers [feed](Channel::feed) it, and it decides
//! whether input is delivered right away, queued, or refused.
//!
//! # Ownership
//!
//! The channel is embedded in its owner `O` (for example
//! [crate::FdInputChannel]), which exposes it through [Endpoint]. Operations
//! that may call back into consumer code are associated functions taking the
//! owner, so the data callback receives `&mut O` and can stop, pause,
//! reinitialize, or deinitialize the very object that is invoking it.
//!
//! # Reentrancy
//!
//! Every callback invocation is bracketed by a [RefGuard] on the owner's hooks
//! and by a snapshot of the channel's generation. The generation is bumped by
//! [Channel::reinitialize] and [Channel::deinitialize]; if it moved while the
//! callback ran, the logical stream being processed no longer exists and the
//! caller returns without touching any further state.

use crate::{
    hooks::{Hooks, RefGuard},
    IoBuf,
};
use std::{collections::VecDeque, io, rc::Rc};
use tracing::{trace, warn};

/// What the consumer wants after processing a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The buffer was fully processed; keep delivering.
    Continue,
    /// The consumer is still working on the buffer; deliver nothing more until
    /// it calls `consumed`.
    Pause,
    /// The consumer wants no more input.
    End,
}

/// Input delivered to a data callback.
#[derive(Debug)]
pub enum Input<'a> {
    /// A non-empty chunk of bytes, in read order.
    Data(&'a IoBuf),
    /// The stream ended cleanly. Delivered at most once.
    Eof,
    /// The stream failed. Delivered at most once; nothing follows.
    Error(&'a io::Error),
}

/// State of a [Channel].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Not bound to a stream.
    Deinitialized,
    /// Ready to deliver input.
    Accepting,
    /// The data callback is running.
    Calling,
    /// Waiting for the consumer to signal it consumed the last buffer.
    Paused,
    /// End-of-stream was delivered or the consumer ended the stream.
    Ended,
    /// An I/O error was delivered.
    Errored,
}

/// Consumer callback invoked with each [Input].
///
/// The return value is ignored for [Input::Eof] and [Input::Error]. The
/// callback may be entered again while it runs, when it rebinds the owner and
/// the owner reads the new stream synchronously.
pub type DataCallback<O> = Rc<dyn Fn(&mut O, Input<'_>) -> Disposition>;

/// Invoked by the channel once a paused or stopped consumer can accept more
/// input. Receives the size passed to [Channel::consumed] (zero when resumed
/// through [Channel::start]).
pub type ConsumedCallback<O> = fn(&mut O, usize);

/// An object that embeds a [Channel] driven on its behalf.
pub trait Endpoint: Sized {
    /// Returns the embedded channel.
    fn channel(&mut self) -> &mut Channel<Self>;
}

/// Input accepted by the channel but not yet delivered.
enum Pending {
    Data(IoBuf),
    Eof,
    Error(io::Error),
}

impl Pending {
    fn as_input(&self) -> Input<'_> {
        match self {
            Self::Data(buf) => Input::Data(buf),
            Self::Eof => Input::Eof,
            Self::Error(err) => Input::Error(err),
        }
    }
}

/// Input state machine shared by readers.
pub struct Channel<O> {
    state: State,
    stopped: bool,
    generation: u64,
    data_callback: Option<DataCallback<O>>,
    consumed_callback: Option<ConsumedCallback<O>>,
    /// `consumed` was called while the data callback was running (value is the
    /// `end` flag), to be applied once the callback returns.
    early_consumed: Option<bool>,
    /// Input fed while stopped, paused, or inside the data callback.
    pending: VecDeque<Pending>,
    hooks: Option<Rc<dyn Hooks>>,
}

impl<O> std::fmt::Debug for Channel<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state)
            .field("stopped", &self.stopped)
            .field("generation", &self.generation)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<O> Default for Channel<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> Channel<O> {
    /// Creates an inert channel. Call [Channel::reinitialize] before feeding it.
    pub const fn new() -> Self {
        Self {
            state: State::Deinitialized,
            stopped: false,
            generation: 0,
            data_callback: None,
            consumed_callback: None,
            early_consumed: None,
            pending: VecDeque::new(),
            hooks: None,
        }
    }

    /// Binds the channel to a new stream.
    ///
    /// May only be called right after construction or [Channel::deinitialize].
    /// The data callback and hooks are kept.
    pub fn reinitialize(&mut self) {
        debug_assert_eq!(self.state, State::Deinitialized);
        self.state = State::Accepting;
        self.stopped = false;
        self.early_consumed = None;
        self.pending.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Unbinds the channel, dropping queued input and the consumed callback.
    ///
    /// Safe to call from within the data callback; the delivering loop
    /// observes the generation change and stops.
    pub fn deinitialize(&mut self) {
        self.state = State::Deinitialized;
        self.stopped = false;
        self.early_consumed = None;
        self.pending.clear();
        self.consumed_callback = None;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Returns the current state.
    pub const fn state(&self) -> State {
        self.state
    }

    /// Returns the generation, which changes on every reinitialization and
    /// deinitialization.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true if [Channel::stop] was called without a matching
    /// [Channel::start].
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Returns true if input fed now would be delivered immediately.
    pub fn accepting_input(&self) -> bool {
        self.state == State::Accepting && !self.stopped && self.pending.is_empty()
    }

    /// Returns true if the channel is not accepting now but may be later,
    /// without being reinitialized.
    pub const fn may_accept_input_later(&self) -> bool {
        matches!(
            self.state,
            State::Accepting | State::Calling | State::Paused
        )
    }

    /// Installs the consumer callback.
    pub fn set_data_callback<F>(&mut self, callback: F)
    where
        F: Fn(&mut O, Input<'_>) -> Disposition + 'static,
    {
        self.data_callback = Some(Rc::new(callback));
    }

    /// Returns the installed consumed callback, if any.
    pub const fn consumed_callback(&self) -> Option<ConsumedCallback<O>> {
        self.consumed_callback
    }

    /// Installs (or clears) the callback run when the consumer can accept more.
    pub fn set_consumed_callback(&mut self, callback: Option<ConsumedCallback<O>>) {
        self.consumed_callback = callback;
    }

    /// Returns the hooks of the enclosing object.
    pub const fn hooks(&self) -> Option<&Rc<dyn Hooks>> {
        self.hooks.as_ref()
    }

    /// Sets the hooks of the enclosing object.
    pub fn set_hooks(&mut self, hooks: Option<Rc<dyn Hooks>>) {
        self.hooks = hooks;
    }

    /// Stops delivering input. Input fed while stopped is queued in order.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Moves to a terminal state, discarding anything still queued.
    fn terminate(&mut self, state: State) {
        self.state = state;
        self.pending.clear();
        self.consumed_callback = None;
    }
}

impl<O: Endpoint> Channel<O> {
    /// Feeds a chunk of bytes read from the stream.
    pub fn feed(owner: &mut O, buf: IoBuf) {
        let _guard = RefGuard::new(owner.channel().hooks.as_ref());
        Self::push(owner, Pending::Data(buf));
    }

    /// Feeds a clean end-of-stream.
    pub fn feed_eof(owner: &mut O) {
        let _guard = RefGuard::new(owner.channel().hooks.as_ref());
        Self::push(owner, Pending::Eof);
    }

    /// Feeds a fatal I/O error.
    pub fn feed_error(owner: &mut O, err: io::Error) {
        let _guard = RefGuard::new(owner.channel().hooks.as_ref());
        Self::push(owner, Pending::Error(err));
    }

    /// Signals that the consumer finished with the last buffer it paused on.
    ///
    /// With `end` set, the stream is ended instead of resumed. When called from
    /// inside the data callback the notification is applied once the callback
    /// returns.
    pub fn consumed(owner: &mut O, size: usize, end: bool) {
        let _guard = RefGuard::new(owner.channel().hooks.as_ref());
        let channel = owner.channel();
        match channel.state {
            State::Calling => {
                let end = end || channel.early_consumed == Some(true);
                channel.early_consumed = Some(end);
                return;
            }
            State::Paused => {}
            state => {
                trace!(?state, "ignoring consumed notification");
                return;
            }
        }
        if end {
            channel.terminate(State::Ended);
            return;
        }
        channel.state = State::Accepting;
        Self::resume(owner, size);
    }

    /// Resumes delivery after [Channel::stop]. Idempotent.
    pub fn start(owner: &mut O) {
        let _guard = RefGuard::new(owner.channel().hooks.as_ref());
        let channel = owner.channel();
        if !channel.stopped {
            return;
        }
        channel.stopped = false;
        if channel.state == State::Accepting {
            Self::resume(owner, 0);
        }
    }

    /// Delivers queued input, then tells the reader it may produce more.
    fn resume(owner: &mut O, size: usize) {
        let generation = owner.channel().generation;
        let channel = owner.channel();
        if channel.stopped {
            return;
        }
        if let Some(pending) = channel.pending.pop_front() {
            Self::deliver(owner, pending);
            if owner.channel().generation != generation {
                return;
            }
        }

        let channel = owner.channel();
        if channel.accepting_input() {
            if let Some(callback) = channel.consumed_callback {
                callback(owner, size);
            }
        }
    }

    fn push(owner: &mut O, pending: Pending) {
        let channel = owner.channel();
        match channel.state {
            State::Deinitialized | State::Ended | State::Errored => {
                trace!(state = ?channel.state, "dropping input fed to a closed channel");
                return;
            }
            State::Accepting if !channel.stopped && channel.pending.is_empty() => {}
            _ => {
                channel.pending.push_back(pending);
                return;
            }
        }
        Self::deliver(owner, pending);
    }

    /// Runs the data callback for `first`, then for anything queued behind it
    /// while the channel keeps accepting.
    fn deliver(owner: &mut O, first: Pending) {
        let generation = owner.channel().generation;
        let mut next = Some(first);
        while let Some(input) = next {
            let channel = owner.channel();
            channel.state = State::Calling;
            channel.early_consumed = None;
            let disposition = match channel.data_callback.clone() {
                Some(callback) => callback(owner, input.as_input()),
                None => {
                    warn!("no data callback installed, discarding input");
                    Disposition::Continue
                }
            };

            let channel = owner.channel();
            if channel.generation != generation {
                // Callback deinitialized or reinitialized the channel
                return;
            }
            match input {
                Pending::Eof => channel.terminate(State::Ended),
                Pending::Error(_) => channel.terminate(State::Errored),
                Pending::Data(_) => match (disposition, channel.early_consumed.take()) {
                    (Disposition::End, _) | (_, Some(true)) => channel.terminate(State::Ended),
                    (Disposition::Pause, None) => channel.state = State::Paused,
                    _ => channel.state = State::Accepting,
                },
            }
            next = if channel.state == State::Accepting && !channel.stopped {
                channel.pending.pop_front()
            } else {
                None
            };
        }
    }
}
