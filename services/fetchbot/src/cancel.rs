use tokio_util::sync::CancellationToken;

use crate::errors::LifecycleError;

/// Cooperative cancel flag shared by the admission path and the worker.
/// Transfers poll it at chunk boundaries; nothing is interrupted preemptively.
#[derive(Debug, Clone, Default)]
pub struct JobCancel {
    token: CancellationToken,
}

impl JobCancel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent; safe to call from any task at any time.
    pub fn request_cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn checkpoint(&self) -> Result<(), LifecycleError> {
        if self.is_cancelled() {
            Err(LifecycleError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
