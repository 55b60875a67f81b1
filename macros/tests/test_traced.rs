use spigot_macros::test_traced;
use tracing::{debug, error, info, trace};

#[test_traced("INFO")]
fn test_info_level() {
    info!("This is an info log");
    debug!("This is a debug log (won't be shown)");
    assert_eq!(2 + 2, 4);
}

#[test_traced]
fn test_default_level() {
    debug!("This is a debug log");
    assert_eq!(3 * 3, 9);
}

#[test_traced("error")]
fn test_lowercase_level() {
    error!("This is an error log");
    assert_eq!(5 * 2, 10);
}

#[test_traced("TRACE")]
#[should_panic(expected = "traced panic")]
fn test_panic_propagates() {
    trace!("about to panic");
    panic!("traced panic");
}

#[test_traced]
fn test_result_return() -> Result<(), String> {
    debug!("returning a result");
    Ok(())
}
