use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineCallError {
    #[error("{0} timed out")]
    TimedOut(&'static str),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Run an engine call with a time limit.
///
/// A call that times out is attempted once more; a second timeout gives up.
/// Errors returned by the engine itself are not retried.
pub async fn with_deadline<T, F, Fut>(
    operation: &'static str,
    limit: Duration,
    mut call: F,
) -> Result<T, EngineCallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    for attempt in 1..=2 {
        match tokio::time::timeout(limit, call()).await {
            Ok(result) => return result.map_err(EngineCallError::Failed),
            Err(_) => {
                tracing::warn!(
                    "Engine call {} timed out after {:?} (attempt {})",
                    operation,
                    limit,
                    attempt
                );
            }
        }
    }

    Err(EngineCallError::TimedOut(operation))
}
