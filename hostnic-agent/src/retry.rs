use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::metrics;

/// Bounded retry policy: `attempts` tries with exponential backoff
/// starting at `base`.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub attempts: u32,
    pub base: Duration,
}

impl Backoff {
    pub const fn new(attempts: u32, base: Duration) -> Self {
        Self { attempts, base }
    }

    /// Default policy for cloud API calls.
    pub const fn cloud() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

/// Run `op` until it succeeds or the attempt budget is exhausted. The
/// final error is returned unchanged. Each retry is counted under the
/// `what` label.
pub async fn retry<T, E, F, Fut>(policy: Backoff, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = policy.base;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= policy.attempts => return Err(e),
            Err(e) => {
                warn!(%e, "{what}: attempt {attempt}/{} failed, retrying in {delay:?}", policy.attempts);
                metrics::count_retry(what);
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_returns_first_success() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, String> =
            retry(Backoff::new(3, Duration::from_millis(1)), "op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, String> =
            retry(Backoff::new(5, Duration::from_millis(1)), "op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(out, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, String> =
            retry(Backoff::new(3, Duration::from_millis(1)), "op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            })
            .await;
        assert_eq!(out, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
