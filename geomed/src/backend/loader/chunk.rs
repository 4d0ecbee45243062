//! Bounded, failure-isolated execution of chunk jobs.
//!
//! Jobs run in batches of at most `max_concurrent` tasks with a
//! barrier between batches. The first failure sets a shared flag:
//! no new work starts, in-flight jobs run to completion, and the
//! first error is reported to the caller.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use super::Error;

/// Run all jobs, at most `max_concurrent` at a time.
pub async fn run_batches<T, F, Fut>(jobs: Vec<T>, max_concurrent: usize, run: F) -> Result<(), Error>
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    let max_concurrent = max_concurrent.max(1);
    let failed = Arc::new(AtomicBool::new(false));
    let mut first_error = None;

    let mut jobs = jobs.into_iter();
    loop {
        if failed.load(Ordering::Relaxed) {
            break;
        }

        let batch: Vec<T> = jobs.by_ref().take(max_concurrent).collect();
        if batch.is_empty() {
            break;
        }

        let mut handles = Vec::with_capacity(batch.len());
        for job in batch {
            let failed = failed.clone();
            let work = run(job);
            handles.push(tokio::spawn(async move {
                let result = work.await;
                if result.is_err() {
                    failed.store(true, Ordering::Relaxed);
                }
                result
            }));
        }

        // Barrier: the whole batch joins before the next one spawns.
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => (),
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(err) => {
                    failed.store(true, Ordering::Relaxed);
                    if first_error.is_none() {
                        first_error = Some(err.into());
                    }
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Bounded-attempt retry. Every error is treated as transient until
/// the budget runs out; the last one is returned.
pub async fn with_retries<T, F, Fut>(attempts: usize, what: &str, op: F) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let attempts = attempts.max(1);
    let mut tried = 0;

    loop {
        tried += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if tried < attempts => {
                warn!("{}: attempt {}/{} failed: {}", what, tried, attempts, err);
            }
            Err(err) => return Err(err),
        }
    }
}
