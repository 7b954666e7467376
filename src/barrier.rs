use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::watch;

/// Single-use rendezvous released after `n` completion signals.
///
/// `done` calls past the count are no-ops, and `wait` after release returns
/// immediately. Used to await both halves of a bidirectional pipe before
/// closing resources.
#[derive(Debug)]
pub struct Barrier {
    remaining: AtomicU32,
    released: watch::Sender<bool>,
}

impl Barrier {
    pub fn new(n: u32) -> Self {
        let (tx, _rx) = watch::channel(n == 0);
        Self {
            remaining: AtomicU32::new(n),
            released: tx,
        }
    }

    /// Records one completion. The `n`-th call releases all waiters.
    pub fn done(&self) {
        let prev = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .unwrap_or(0);
        if prev == 1 {
            let _ = self.released.send(true);
        }
    }

    /// Resolves once `done` has been called `n` times total.
    pub async fn wait(&self) {
        let mut rx = self.released.subscribe();
        // wait_for checks the current value first, so a wait that starts
        // after release completes without blocking.
        let _ = rx.wait_for(|v| *v).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn releases_after_n_signals() {
        let b = Arc::new(Barrier::new(2));

        let waiter = tokio::spawn({
            let b = b.clone();
            async move { b.wait().await }
        });

        b.done();
        assert!(!waiter.is_finished());
        b.done();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("barrier must release")
            .unwrap();
    }

    #[tokio::test]
    async fn extra_done_calls_are_noops_and_late_wait_returns() {
        let b = Barrier::new(1);
        b.done();
        b.done();
        b.done();
        tokio::time::timeout(Duration::from_millis(100), b.wait())
            .await
            .expect("wait after release must not block");
    }

    #[tokio::test]
    async fn zero_count_is_released_from_the_start() {
        let b = Barrier::new(0);
        tokio::time::timeout(Duration::from_millis(100), b.wait())
            .await
            .expect("zero barrier must not block");
    }
}
