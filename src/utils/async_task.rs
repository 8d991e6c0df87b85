use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::error;
use tracing::warn;

use crate::Result;
use crate::StoreError;

/// Runs one store call, mapping an elapsed deadline to [`StoreError::Timeout`].
pub(crate) async fn call_with_timeout<F, T>(
    timeout_duration: Duration,
    task: F,
) -> std::result::Result<T, StoreError>
where
    F: Future<Output = std::result::Result<T, StoreError>>,
{
    match timeout(timeout_duration, task).await {
        Ok(r) => r,
        Err(_) => {
            warn!("store call timed out after {:?}", timeout_duration);
            Err(StoreError::Timeout(timeout_duration))
        }
    }
}

/// Spawns a named background task and logs its failure.
pub(crate) fn spawn_task<Fut>(
    name: &str,
    task: Fut,
) -> JoinHandle<()>
where
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!("spawned task: {name} stopped with error: {:?}", e);
        }
    })
}
