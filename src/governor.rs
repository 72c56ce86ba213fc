//! The process-wide upstream rate governor (spec §4.3, §4.6, §9 design
//! note): a queue of waiters served by a single ticker, not ad-hoc
//! sleeps scattered across call sites. FIFO across callers; shared by
//! every job, so parallelism across jobs increases throughput only
//! when time is spent in the store rather than upstream.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

const SPACING: Duration = Duration::from_millis(50);
const PAUSE_EVERY: u64 = 500;
const PAUSE: Duration = Duration::from_secs(10);

/// A handle callers clone and pass into pipeline flows. Acquiring a
/// permit blocks until the ticker has paid out the required spacing
/// since the previous request.
#[derive(Clone)]
pub struct RateGovernor {
    tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl RateGovernor {
    /// Spawns the ticker task and returns a handle to it. The ticker
    /// runs for the lifetime of the returned handle's last clone; there
    /// is exactly one ticker per process (spec §9: "construct once at
    /// process init and inject").
    #[must_use]
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::channel::<oneshot::Sender<()>>(1024);

        tokio::spawn(async move {
            let mut count: u64 = 0;
            while let Some(waiter) = rx.recv().await {
                tokio::time::sleep(SPACING).await;
                count += 1;
                let _ = waiter.send(());
                if count % PAUSE_EVERY == 0 {
                    tracing::debug!(count, "rate governor pausing after batch");
                    tokio::time::sleep(PAUSE).await;
                }
            }
        });

        Self { tx }
    }

    /// Waits for a permit to make one upstream request. Dropping the
    /// returned future before it resolves drops the waiter out of the
    /// queue (cancellation, per spec §9's "cancellation drops
    /// waiters").
    ///
    /// # Errors
    ///
    /// Returns an error if the governor's ticker task has shut down.
    pub async fn acquire(&self) -> Result<(), crate::Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(reply_tx)
            .await
            .map_err(|_| crate::Error::Upstream("rate governor has shut down".into()))?;
        reply_rx
            .await
            .map_err(|_| crate::Error::Upstream("rate governor dropped a waiter".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn spaces_requests_by_at_least_the_configured_interval() {
        let gov = RateGovernor::start();
        let start = Instant::now();
        for _ in 0..5 {
            gov.acquire().await.unwrap();
        }
        assert!(start.elapsed() >= SPACING * 4);
    }

    #[tokio::test]
    async fn serves_callers_fifo() {
        let gov = RateGovernor::start();
        let a = gov.acquire();
        let b = gov.acquire();
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.is_ok());
        assert!(rb.is_ok());
    }
}
