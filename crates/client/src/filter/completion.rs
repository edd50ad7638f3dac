use std::fmt;

use futures::channel::oneshot;
use tracing::warn;

use crate::protocol::TransportError;

type Callback = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Reports the outcome of one write travelling down the filter chain.
///
/// Every write is completed exactly once: either explicitly through
/// [`complete`](Self::complete), or with [`TransportError::Canceled`] when the
/// completion is dropped on the way.
pub struct WriteCompletion {
    callback: Option<Callback>,
}

impl WriteCompletion {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<(), TransportError>) + Send + 'static,
    {
        Self { callback: Some(Box::new(callback)) }
    }

    /// A completion nobody waits for.
    pub fn ignore() -> Self {
        Self { callback: None }
    }

    /// A completion whose outcome is delivered through a oneshot channel.
    pub fn channel() -> (Self, oneshot::Receiver<Result<(), TransportError>>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self::new(move |result| {
            // the receiver may have given up waiting
            let _ = tx.send(result);
        });
        (completion, rx)
    }

    pub fn complete(mut self, result: Result<(), TransportError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl Drop for WriteCompletion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            warn!("write completion dropped without an outcome");
            callback(Err(TransportError::Canceled));
        }
    }
}

impl fmt::Debug for WriteCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteCompletion").field("pending", &self.callback.is_some()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_once() {
        let (completion, mut rx) = WriteCompletion::channel();
        completion.complete(Ok(()));
        assert!(matches!(rx.try_recv(), Ok(Some(Ok(())))));
    }

    #[test]
    fn drop_reports_canceled() {
        let (completion, mut rx) = WriteCompletion::channel();
        drop(completion);
        assert!(matches!(rx.try_recv(), Ok(Some(Err(TransportError::Canceled)))));
    }
}
