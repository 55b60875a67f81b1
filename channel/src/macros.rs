//! Macros shared across the crate.

/// Builds a [std::num::NonZeroUsize] from a literal or expression, panicking
/// (at compile time when used in a `const` context) if it is zero.
macro_rules! NZUsize {
    ($val:expr) => {
        match ::std::num::NonZeroUsize::new($val) {
            Some(value) => value,
            None => panic!("value must be non-zero"),
        }
    };
}
