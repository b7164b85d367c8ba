//! Concurrent batch execution with a combined error
//!
//! Runs one operation per object concurrently under a shared cancellation
//! token. Failures never abort unaffected objects; they are collected and
//! returned together so each failure can be attributed to its object.

use std::fmt;
use std::future::Future;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::object::ObjectIdentity;
use crate::crd::SyncedResource;
use crate::error::Error;

/// Default upper bound on in-flight operations per batch
pub const DEFAULT_CONCURRENCY: usize = 16;

/// One failed object within a batch
#[derive(Debug)]
pub struct ObjectFailure {
    /// Position of the object in the input sequence
    pub index: usize,
    pub object: SyncedResource,
    pub error: Error,
}

/// Combined error of a batch; failures are ordered by input position
#[derive(Debug)]
pub struct BatchError {
    failures: Vec<ObjectFailure>,
    total: usize,
}

impl BatchError {
    pub fn failures(&self) -> &[ObjectFailure] {
        &self.failures
    }

    /// Number of objects the batch was started with
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn contains(&self, object: &SyncedResource) -> bool {
        self.failures.iter().any(|f| &f.object == object)
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} operations failed", self.failures.len(), self.total)?;
        for failure in &self.failures {
            write!(f, "; [{}] {}: {}", failure.index, failure.object, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchError {}

/// Run `operation` once for each object, at most `concurrency` at a time
///
/// Cancellation is observed per object: an object whose operation has not
/// completed when `cancel` fires is reported as failed with
/// [`Error::Cancelled`], and operations that have not started are never
/// invoked. The returned future is `Send` whenever `operation` is, so a batch
/// can run inside a spawned reconcile.
pub async fn run_all<'a, T, F, Fut>(
    objects: &'a [T],
    cancel: &'a CancellationToken,
    concurrency: usize,
    operation: F,
) -> Result<(), BatchError>
where
    T: ObjectIdentity + Sync,
    F: Fn(&'a T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Error>> + Send + 'a,
{
    let total = objects.len();
    let limit = concurrency.max(1);
    let mut pending = objects.iter().enumerate();
    let mut in_flight: FuturesUnordered<BoxFuture<'a, (usize, Result<(), Error>)>> =
        FuturesUnordered::new();
    let mut failures = Vec::new();

    loop {
        while in_flight.len() < limit {
            let Some((index, object)) = pending.next() else {
                break;
            };
            if cancel.is_cancelled() {
                failures.push(ObjectFailure {
                    index,
                    object: object.identity(),
                    error: Error::Cancelled,
                });
                continue;
            }
            let started = operation(object);
            in_flight.push(
                async move {
                    let result = tokio::select! {
                        biased;
                        res = started => res,
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                    };
                    (index, result)
                }
                .boxed(),
            );
        }

        match in_flight.next().await {
            Some((index, Err(error))) => failures.push(ObjectFailure {
                index,
                object: objects[index].identity(),
                error,
            }),
            Some((_, Ok(()))) => {}
            None => break,
        }
    }

    if failures.is_empty() {
        debug!(total, "Batch completed");
        return Ok(());
    }

    failures.sort_by_key(|f| f.index);
    debug!(total, failed = failures.len(), "Batch completed with failures");
    Err(BatchError { failures, total })
}

/// Split a batch outcome into the objects that succeeded and the failures
pub fn partition<'a, T>(
    objects: &'a [T],
    outcome: &Result<(), BatchError>,
) -> (Vec<&'a T>, Vec<&'a T>) {
    let failed = |idx: usize| match outcome {
        Ok(()) => false,
        Err(batch) => batch.failures.iter().any(|f| f.index == idx),
    };

    let mut succeeded = Vec::new();
    let mut failures = Vec::new();
    for (idx, object) in objects.iter().enumerate() {
        if failed(idx) {
            failures.push(object);
        } else {
            succeeded.push(object);
        }
    }
    (succeeded, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn refs(n: usize) -> Vec<SyncedResource> {
        (0..n)
            .map(|i| SyncedResource {
                group: String::new(),
                version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
                namespace: Some("default".to_string()),
                name: format!("cm-{i}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_all_succeed_invokes_each_once() {
        let objects = refs(25);
        let seen = Mutex::new(Vec::new());
        let cancel = CancellationToken::new();

        let result = run_all(&objects, &cancel, 4, |obj| {
            let seen = &seen;
            async move {
                seen.lock().unwrap().push(obj.name.clone());
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        let mut expected: Vec<_> = objects.iter().map(|o| o.name.clone()).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_single_failure_is_attributed() {
        let objects = refs(6);
        let calls = AtomicUsize::new(0);
        let cancel = CancellationToken::new();

        let result = run_all(&objects, &cancel, DEFAULT_CONCURRENCY, |obj| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if obj.name == "cm-3" {
                    Err(Error::ConfigError("rejected".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        let err = result.unwrap_err();
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].index, 3);
        assert_eq!(err.failures()[0].object.name, "cm-3");
        assert_eq!(err.total(), 6);
        assert!(err.to_string().contains("cm-3"));

        let outcome = Err(err);
        let (ok, failed) = partition(&objects, &outcome);
        assert_eq!(ok.len(), 5);
        assert_eq!(failed[0].name, "cm-3");
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_batch_future_is_send() {
        let objects = refs(2);
        let cancel = CancellationToken::new();
        let counter = AtomicUsize::new(0);
        let batch = run_all(&objects, &cancel, 2, |_| {
            let counter = &counter;
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        assert_send(&batch);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let objects = refs(12);
        let cancel = CancellationToken::new();
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let result = run_all(&objects, &cancel, 3, |_| {
            let (running, peak) = (&running, &peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_empty_batch_is_ok() {
        let objects: Vec<SyncedResource> = Vec::new();
        let cancel = CancellationToken::new();
        let result = run_all(&objects, &cancel, 1, |_| async { Ok(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_operations_are_not_successes() {
        let objects = refs(3);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let result = run_all(&objects, &cancel, 1, |obj| {
            let trigger = trigger.clone();
            async move {
                if obj.name == "cm-0" {
                    return Ok(());
                }
                trigger.cancel();
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.failures().len(), 2);
        assert!(err
            .failures()
            .iter()
            .all(|f| matches!(f.error, Error::Cancelled)));
        assert!(!err.contains(&objects[0]));
    }
}
