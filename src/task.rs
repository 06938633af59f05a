//! Cancellable periodic tasks.
//!
//! Every background loop in the engine (scheduler, refresh sweep, executor) is a
//! [`PeriodicTask`]: a timer plus a [`CancellationToken`]. A tick that is already
//! running always finishes; the token is only observed between ticks and by the
//! tick body itself between units of work.

use std::{future::Future, time::Duration};

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
}

impl PeriodicTask {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self { name, period }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Runs `tick` immediately and then once per period until `shutdown` fires.
    ///
    /// Missed periods (a tick that overran) are skipped rather than replayed back to
    /// back.
    pub async fn run<F, Fut>(self, shutdown: CancellationToken, mut tick: F)
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(task = self.name, period_secs = self.period.as_secs(), "periodic task started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(task = self.name, "shutdown requested; periodic task stopping");
                    break;
                }
                _ = interval.tick() => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    debug!(task = self.name, "tick");
                    tick(shutdown.clone()).await;
                }
            }
        }

        info!(task = self.name, "periodic task stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[tokio::test]
    async fn stops_after_cancellation_and_finishes_inflight_tick() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let task = PeriodicTask::new("test", Duration::from_millis(10));
        let handle = {
            let ticks = ticks.clone();
            let finished = finished.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(task.run(shutdown, move |token| {
                let ticks = ticks.clone();
                let finished = finished.clone();
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    // A tick observes cancellation but still completes.
                    token.cancel();
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                }
            }))
        };

        handle.await.unwrap();
        assert!(shutdown.is_cancelled());
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn never_ticks_when_cancelled_up_front() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let counter = ticks.clone();
        PeriodicTask::new("idle", Duration::from_millis(10))
            .run(shutdown, move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
