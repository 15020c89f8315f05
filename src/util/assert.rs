const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Panic with a Firestore-styled internal assertion message when the condition is false.
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        fail(message);
    }
}

/// Logs and panics unconditionally. Used for states the engine can never reach.
pub fn fail(message: impl AsRef<str>) -> ! {
    let message = assertion_error(message);
    log::error!("{message}");
    panic!("{message}");
}

/// Build the string used when throwing assertion errors.
pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "Firestore ({}) INTERNAL ASSERT FAILED: {}",
        SDK_VERSION,
        message.as_ref()
    )
}
