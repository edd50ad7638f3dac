//! Helper macros used across the crate.

/// Returns early with `$error` unless `$predicate` holds.
///
/// Like `assert!`, but for checks whose failure is an error value rather
/// than a bug.
///
/// ```ignore
/// ensure!(!state.closed, UsageError::StreamClosed.into());
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
