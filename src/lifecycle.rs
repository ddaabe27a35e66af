//! Start/stop plumbing shared by the background services.

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("service already running")]
    AlreadyRunning,
    #[error("service is not running")]
    NotRunning,
}

/// A spawned background loop and the token that stops it.
#[derive(Debug)]
pub(crate) struct Running {
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl Running {
    /// Cancel the loop and wait for its current iteration to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            if !err.is_cancelled() {
                tracing::warn!("background task ended abnormally: {err}");
            }
        }
    }
}
