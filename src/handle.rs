use tokio::task::JoinHandle;

use std::time::Duration;

/// A background task that is aborted when its handle is dropped.
pub(crate) struct OwnedTaskHandle {
    name: String,
    inner: Option<JoinHandle<()>>,
}

impl OwnedTaskHandle {
    pub fn new(name: impl Into<String>, inner: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            inner: Some(inner),
        }
    }

    /// Give the task `grace` to finish on its own, then abort it.
    /// Returns `true` if it finished in time.
    pub async fn join_or_abort(mut self, grace: Duration) -> bool {
        let Some(mut handle) = self.inner.take() else {
            return true;
        };
        match crate::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(task = %self.name, error = %e, "background task panicked");
                true
            }
            Err(_) => {
                tracing::warn!(task = %self.name, "background task did not stop in time, aborting");
                handle.abort();
                let _ = handle.await;
                false
            }
        }
    }
}

impl Drop for OwnedTaskHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.take() {
            handle.abort();
        }
    }
}
