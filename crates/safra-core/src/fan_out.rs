use std::future::Future;
use std::panic::resume_unwind;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::ValidationError;

/// Default concurrency cap for fan-out over many stations or series.
pub const DEFAULT_FAN_OUT: usize = 5;

/// Run `task` over every item with at most `limit` futures in flight.
///
/// Results come back in input order. Excess items wait on a semaphore
/// instead of all hitting the upstream at once. A panicking task panics the
/// caller.
pub async fn fan_out<T, R, F, Fut>(items: Vec<T>, limit: usize, task: F) -> Result<Vec<R>, ValidationError>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    if limit == 0 {
        return Err(ValidationError::ZeroConcurrency);
    }

    let gate = Arc::new(Semaphore::new(limit));
    let mut tasks = JoinSet::new();
    let total = items.len();

    for (index, item) in items.into_iter().enumerate() {
        let gate = Arc::clone(&gate);
        let future = task(item);
        tasks.spawn(async move {
            // The semaphore is never closed, so acquisition only waits.
            let _permit = gate.acquire_owned().await.ok();
            (index, future.await)
        });
    }

    let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, value)) => results[index] = Some(value),
            Err(error) if error.is_panic() => resume_unwind(error.into_panic()),
            Err(_) => {}
        }
    }

    Ok(results.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_the_cap_and_preserves_order() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = fan_out((0..12).collect(), DEFAULT_FAN_OUT, |station: u32| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(u64::from(20 - station))).await;
                active.fetch_sub(1, Ordering::SeqCst);
                station * 10
            }
        })
        .await
        .expect("fan out");

        assert_eq!(results, (0..12).map(|s| s * 10).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= DEFAULT_FAN_OUT);
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn zero_limit_is_rejected() {
        let error = fan_out(vec![1], 0, |n: i32| async move { n })
            .await
            .expect_err("should fail");
        assert_eq!(error, ValidationError::ZeroConcurrency);
    }

    #[tokio::test]
    async fn empty_input_yields_empty_output() {
        let results = fan_out(Vec::<u8>::new(), 3, |n| async move { n })
            .await
            .expect("fan out");
        assert!(results.is_empty());
    }
}
