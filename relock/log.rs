/// Record a handled exception on the active tracing subscriber.
///
/// Used for failures that are logged and recovered from rather than
/// propagated, e.g. failing to kill a child process on drop.
pub fn record_exception(message: impl Into<String>, stacktrace: impl Into<String>) {
    tracing::error!(
        exception.message = message.into(),
        exception.stacktrace = stacktrace.into(),
        "handled exception"
    );
}
