//! Bounded fan-out for report jobs that run one blocking store-backed
//! computation per campaign or experiment and await all of them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::warn;

use crate::config::StoreConfig;
use crate::error::{InsightError, InsightResult};

/// Runs `job` once per key on the blocking pool, at most
/// `max_concurrent_reads` at a time, each bounded by `read_timeout_ms`.
/// Results come back in key order. A timed-out job keeps running in the
/// background and holds its permit until it returns; only its result is
/// discarded.
pub async fn fan_out<K, T, F>(
    keys: Vec<K>,
    settings: &StoreConfig,
    job: F,
) -> Vec<(K, InsightResult<T>)>
where
    K: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(K) -> InsightResult<T> + Send + Sync + 'static,
{
    let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_reads.max(1)));
    let job = Arc::new(job);
    let timeout_ms = settings.read_timeout_ms;

    let mut handles = Vec::with_capacity(keys.len());
    for key in keys {
        let semaphore = semaphore.clone();
        let job = job.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    return Err::<T, InsightError>(InsightError::Store(anyhow::anyhow!(
                        "fan-out closed: {e}"
                    )))
                }
            };
            let blocking = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job(task_key)
            });
            match tokio::time::timeout(Duration::from_millis(timeout_ms), blocking).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => Err(InsightError::Store(anyhow::anyhow!(
                    "blocking job failed: {join_err}"
                ))),
                Err(_) => {
                    warn!(timeout_ms, "Store-backed job timed out");
                    Err(InsightError::StoreTimeout(timeout_ms))
                }
            }
        });
        handles.push((key, handle));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (key, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(InsightError::Store(anyhow::anyhow!(
                "fan-out task failed: {join_err}"
            ))),
        };
        results.push((key, result));
    }
    results
}
