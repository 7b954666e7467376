use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::sublog::SubLogger;

/// Retry scheduler with exponential backoff.
///
/// `run` sleeps `first`, then drives the attempt until it succeeds or the
/// shutdown watch flips. The gap after a failed attempt starts at the `min`
/// floor, stays there for the second retry, then doubles toward the `max`
/// cap. Retries are strictly sequential.
#[derive(Debug, Clone, Copy)]
pub struct Promise {
    pub first: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl Default for Promise {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(2),
            min: Duration::from_secs(10),
            max: Duration::from_secs(60),
        }
    }
}

impl Promise {
    /// Runs `attempt` to success. Returns `None` if cancelled by the
    /// shutdown watch; the pending sleep is aborted and no further attempt
    /// is made.
    pub async fn run<T, F, Fut>(
        &self,
        log: &SubLogger,
        mut shutdown: watch::Receiver<bool>,
        mut attempt: F,
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if !pause(&mut shutdown, self.first).await {
            return None;
        }

        let mut retries: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return None;
            }
            match attempt().await {
                Ok(v) => return Some(v),
                Err(err) => {
                    let wait = self.interval(retries);
                    log.warn(format!(
                        "{err:#}; retrying in {}",
                        humantime::format_duration(wait)
                    ));
                    if !pause(&mut shutdown, wait).await {
                        return None;
                    }
                    retries = retries.saturating_add(1);
                }
            }
        }
    }

    /// Gap slept after the `retries`-th failed attempt (zero-based).
    fn interval(&self, retries: u32) -> Duration {
        let shift = retries.saturating_sub(1).min(16);
        self.min.saturating_mul(1u32 << shift).min(self.max)
    }
}

/// Sleeps for `d` unless the shutdown watch flips first. Returns false on
/// cancellation (or when the watch sender is gone).
async fn pause(shutdown: &mut watch::Receiver<bool>, d: Duration) -> bool {
    tokio::select! {
        _ = shutdown.wait_for(|v| *v) => false,
        _ = tokio::time::sleep(d) => true,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    fn test_promise() -> Promise {
        Promise {
            first: Duration::from_secs(2),
            min: Duration::from_secs(10),
            max: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_spacing_follows_the_backoff_law() {
        let log = SubLogger::new("test");
        let (_tx, rx) = watch::channel(false);

        let start = Instant::now();
        let stamps = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let count = Arc::new(AtomicU32::new(0));

        let stamps2 = stamps.clone();
        let count2 = count.clone();
        let out = test_promise()
            .run(&log, rx, move || {
                let stamps = stamps2.clone();
                let count = count2.clone();
                async move {
                    stamps.lock().await.push(start.elapsed().as_secs_f64());
                    if count.fetch_add(1, Ordering::SeqCst) < 4 {
                        anyhow::bail!("refused")
                    }
                    Ok(42)
                }
            })
            .await;

        assert_eq!(out, Some(42));
        let stamps = stamps.lock().await.clone();
        let expect = [2.0, 12.0, 22.0, 42.0, 82.0];
        assert_eq!(stamps.len(), expect.len());
        for (got, want) in stamps.iter().zip(expect) {
            assert!((got - want).abs() < 0.2, "got {got}, want {want}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn intervals_are_monotone_and_capped() {
        let p = test_promise();
        let mut prev = Duration::ZERO;
        for k in 0..12 {
            let i = p.interval(k);
            assert!(i >= p.min && i <= p.max);
            assert!(i >= prev);
            prev = i;
        }
        assert_eq!(prev, p.max);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_the_pending_sleep() {
        let log = SubLogger::new("test");
        let (tx, rx) = watch::channel(false);
        let attempts = Arc::new(AtomicU32::new(0));

        let attempts2 = attempts.clone();
        let task = tokio::spawn(async move {
            let out: Option<()> = test_promise()
                .run(&log, rx, move || {
                    let attempts = attempts2.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        anyhow::bail!("always down")
                    }
                })
                .await;
            out
        });

        // Let the first attempt fail, then cancel mid-backoff.
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();
        let out = task.await.unwrap();
        assert_eq!(out, None);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
