//! Bounded-concurrency fan-out for bulk storage operations.

use std::fmt::Display;
use std::future::Future;

use futures::StreamExt;
use tracing::warn;

/// Runs async work items with at most `concurrency` in flight.
///
/// Every item is attempted exactly once and completion order is not
/// preserved. An item's failure never cancels its siblings; callers get every
/// outcome back and decide whether to aggregate or ignore errors.
#[derive(Debug, Clone, Copy)]
pub struct BatchExecutor {
  concurrency: usize,
}

impl BatchExecutor {
  pub fn new(concurrency: usize) -> Self {
    Self {
      concurrency: concurrency.max(1),
    }
  }

  pub fn concurrency(&self) -> usize {
    self.concurrency
  }

  /// Run `work` over `items`, returning every outcome in completion order.
  pub async fn run<I, T, F, Fut, R>(&self, items: I, work: F) -> Vec<R>
  where
    I: IntoIterator<Item = T>,
    I::IntoIter: Send,
    T: Send,
    F: FnMut(T) -> Fut + Send,
    Fut: Future<Output = R> + Send,
    R: Send,
  {
    futures::stream::iter(items)
      .map(work)
      .buffer_unordered(self.concurrency)
      .boxed()
      .collect()
      .await
  }

  /// Like [`run`](Self::run) for fallible work, but fails if any item failed.
  ///
  /// All items still run to completion; the first error seen is returned.
  pub async fn try_run<I, T, F, Fut, R, E>(&self, items: I, work: F) -> Result<Vec<R>, E>
  where
    I: IntoIterator<Item = T>,
    I::IntoIter: Send,
    T: Send,
    F: FnMut(T) -> Fut + Send,
    Fut: Future<Output = Result<R, E>> + Send,
    R: Send,
    E: Send,
  {
    let outcomes = self.run(items, work).await;
    let mut values = Vec::with_capacity(outcomes.len());
    let mut first_error = None;
    for outcome in outcomes {
      match outcome {
        Ok(value) => values.push(value),
        Err(e) if first_error.is_none() => first_error = Some(e),
        Err(_) => {}
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(values),
    }
  }
}

impl Default for BatchExecutor {
  fn default() -> Self {
    Self::new(10)
  }
}

/// Retry `op` up to `attempts` times with no backoff, returning the last error.
pub async fn retry_fixed<F, Fut, T, E>(attempts: u32, label: &str, mut op: F) -> Result<T, E>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: Display,
{
  let attempts = attempts.max(1);
  let mut attempt = 1;
  loop {
    match op().await {
      Ok(value) => return Ok(value),
      Err(e) if attempt < attempts => {
        warn!(label = %label, attempt, attempts, error = %e, "attempt failed, retrying");
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn test_concurrency_is_bounded() {
    let executor = BatchExecutor::new(3);
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let results = executor
      .run(0..20, |i| {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        async move {
          let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
          peak.fetch_max(now, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(5)).await;
          in_flight.fetch_sub(1, Ordering::SeqCst);
          i
        }
      })
      .await;

    assert_eq!(results.len(), 20);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    let mut sorted = results;
    sorted.sort();
    assert_eq!(sorted, (0..20).collect::<Vec<_>>());
  }

  #[tokio::test]
  async fn test_failure_does_not_cancel_siblings() {
    let executor = BatchExecutor::new(2);
    let attempted = Arc::new(AtomicUsize::new(0));

    let result: Result<Vec<u32>, String> = executor
      .try_run(0..6u32, |i| {
        let attempted = attempted.clone();
        async move {
          attempted.fetch_add(1, Ordering::SeqCst);
          if i == 1 {
            Err(format!("item {} failed", i))
          } else {
            Ok(i)
          }
        }
      })
      .await;

    assert_eq!(result.unwrap_err(), "item 1 failed");
    assert_eq!(attempted.load(Ordering::SeqCst), 6);
  }

  #[tokio::test]
  async fn test_retry_fixed_gives_up_after_attempts() {
    let calls = AtomicUsize::new(0);
    let result: Result<(), String> = retry_fixed(3, "flaky", || {
      calls.fetch_add(1, Ordering::SeqCst);
      async { Err("boom".to_string()) }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_retry_fixed_recovers() {
    let calls = AtomicUsize::new(0);
    let result: Result<usize, String> = retry_fixed(3, "flaky", || {
      let n = calls.fetch_add(1, Ordering::SeqCst);
      async move {
        if n == 0 {
          Err("first".to_string())
        } else {
          Ok(n)
        }
      }
    })
    .await;

    assert_eq!(result.unwrap(), 1);
  }
}
