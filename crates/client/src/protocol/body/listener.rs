//! Callbacks of the asynchronous body stream modes.

use crate::protocol::{BodyError, UsageError};

/// Receives readiness notifications from a [`BodyInputStream`](super::BodyInputStream).
///
/// `on_data_available` is only called after the stream reported it had no
/// data (or when the listener is first attached), so a listener reads until
/// [`is_ready`](super::BodyInputStream::is_ready) returns `false` and then
/// waits for the next call. Exactly one of `on_all_data_read` and `on_error`
/// ends the sequence.
///
/// An error returned from `on_data_available` or `on_all_data_read` is
/// handed back to `on_error`.
pub trait ReadListener: Send + Sync {
    fn on_data_available(&self) -> Result<(), BodyError>;

    fn on_all_data_read(&self) -> Result<(), BodyError>;

    fn on_error(&self, error: BodyError);
}

/// Receives readiness notifications from a [`BodyOutputStream`](super::BodyOutputStream).
///
/// `on_write_possible` is called when the stream becomes ready after
/// [`is_ready`](super::BodyOutputStream::is_ready) returned `false`, or when
/// the listener is attached to a stream that is already ready.
pub trait WriteListener: Send + Sync {
    fn on_write_possible(&self) -> Result<(), BodyError>;

    fn on_error(&self, error: BodyError);
}

/// The mode a body stream is committed to.
///
/// A stream starts undecided; the first blocking operation commits it to
/// synchronous mode and attaching a listener or an executor commits it to
/// asynchronous mode. The commitment never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Mode {
    #[default]
    Undecided,
    Synchronous,
    Asynchronous,
}

impl Mode {
    pub(crate) fn enter_sync(&mut self) -> Result<(), UsageError> {
        match self {
            Mode::Asynchronous => Err(UsageError::SyncOperationInAsyncMode),
            _ => {
                *self = Mode::Synchronous;
                Ok(())
            }
        }
    }

    pub(crate) fn enter_async(&mut self) -> Result<(), UsageError> {
        match self {
            Mode::Synchronous => Err(UsageError::AsyncOperationInSyncMode),
            _ => {
                *self = Mode::Asynchronous;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_commits_once() {
        let mut mode = Mode::default();
        mode.enter_sync().unwrap();
        mode.enter_sync().unwrap();
        assert_eq!(mode.enter_async(), Err(UsageError::AsyncOperationInSyncMode));

        let mut mode = Mode::default();
        mode.enter_async().unwrap();
        assert_eq!(mode.enter_sync(), Err(UsageError::SyncOperationInAsyncMode));
    }
}
