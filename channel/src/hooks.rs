//! Reference hooks held across consumer callbacks.
//!
//! A channel is usually embedded in a larger object (a client, a session)
//! whose lifetime is reference counted by its owner. [RefGuard] takes a
//! reference through that object's [Hooks] for as long as a consumer callback
//! runs, so a teardown path triggered from inside the callback cannot release
//! the enclosing object before the channel is done with it.

use std::rc::Rc;

/// Reference counting interface of the object that embeds a channel.
pub trait Hooks {
    /// Takes a reference on the enclosing object.
    fn acquire(&self);

    /// Releases a reference taken with [Hooks::acquire].
    fn release(&self);
}

/// Holds a reference through [Hooks] until dropped.
///
/// Constructing a guard without hooks is a no-op.
#[must_use = "the reference is released as soon as the guard is dropped"]
pub struct RefGuard {
    hooks: Option<Rc<dyn Hooks>>,
}

impl RefGuard {
    /// Acquires a reference through `hooks`, if any.
    pub fn new(hooks: Option<&Rc<dyn Hooks>>) -> Self {
        let hooks = hooks.cloned();
        if let Some(hooks) = &hooks {
            hooks.acquire();
        }
        Self { hooks }
    }
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        if let Some(hooks) = self.hooks.take() {
            hooks.release();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;

    /// Counts outstanding references and records the deepest nesting.
    #[derive(Default)]
    pub(crate) struct Counter {
        pub(crate) refs: Cell<usize>,
        pub(crate) peak: Cell<usize>,
        pub(crate) acquired: Cell<usize>,
    }

    impl Hooks for Counter {
        fn acquire(&self) {
            self.refs.set(self.refs.get() + 1);
            self.peak.set(self.peak.get().max(self.refs.get()));
            self.acquired.set(self.acquired.get() + 1);
        }

        fn release(&self) {
            assert!(self.refs.get() > 0, "released more references than acquired");
            self.refs.set(self.refs.get() - 1);
        }
    }

    #[test]
    fn test_guard_balances() {
        let counter = Rc::new(Counter::default());
        let hooks: Rc<dyn Hooks> = counter.clone();
        {
            let _outer = RefGuard::new(Some(&hooks));
            assert_eq!(counter.refs.get(), 1);
            {
                let _inner = RefGuard::new(Some(&hooks));
                assert_eq!(counter.refs.get(), 2);
            }
            assert_eq!(counter.refs.get(), 1);
        }
        assert_eq!(counter.refs.get(), 0);
        assert_eq!(counter.peak.get(), 2);
    }

    #[test]
    fn test_guard_without_hooks() {
        let guard = RefGuard::new(None);
        drop(guard);
    }
}
