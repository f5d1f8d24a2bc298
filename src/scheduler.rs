//! The per-target worker scheduler (spec §5, §4.6; SPEC_FULL §4): one
//! serialised task per metadata device that fires the periodic
//! writeback/policy-tick pass and runs flushes the rest of the core asks
//! for, off the request-ingress hot path.
//!
//! Grounded in the teacher's background-loop shape in
//! `multitenant/metering.rs` (`tokio::spawn` around a `loop` gated by
//! `tokio::time::sleep`), generalized to a `tokio::select!` over a fixed
//! tick and an inbound work queue so a flush request doesn't wait for
//! the next tick.

use crate::error::Result;
use crate::policy::Policy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

enum WorkItem {
    Flush(oneshot::Sender<Result<()>>),
}

/// Owns the worker task's lifetime. The request-ingress path (spec §5)
/// never touches this directly except to request a flush (FUA/FLUSH) or
/// to shut down on device presuspend.
pub struct Scheduler {
    tx: mpsc::UnboundedSender<WorkItem>,
    handle: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the worker task. `tick_period` is the writeback cadence
    /// (spec §4.6; default [`crate::config::DEFAULT_WRITEBACK_TICK`]).
    /// `on_tick` fires the policy's tick plus any due writeback; `on_flush`
    /// commits metadata on demand.
    pub fn spawn<Tick, Flush>(policy: Arc<dyn Policy>, tick_period: Duration, mut on_tick: Tick, mut on_flush: Flush) -> Self
    where
        Tick: FnMut(&Arc<dyn Policy>) + Send + 'static,
        Flush: FnMut() -> Result<()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkItem>();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        on_tick(&policy);
                    }
                    item = rx.recv() => {
                        match item {
                            Some(WorkItem::Flush(done)) => {
                                let _ = done.send(on_flush());
                            }
                            None => break,
                        }
                    }
                }
            }
        });
        Self { tx, handle }
    }

    /// Request an out-of-band metadata commit and wait for it (spec
    /// §4.6: "on FUA/FLUSH, commit metadata before completing the bio").
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WorkItem::Flush(done_tx)).is_err() {
            return Err(crate::error::CacheError::Internal("scheduler worker has stopped".into()));
        }
        done_rx
            .await
            .map_err(|_| crate::error::CacheError::Internal("scheduler dropped flush response".into()))?
    }

    /// Stop the worker task and wait for it to exit.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::writeback::WritebackPolicy;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn flush_runs_the_supplied_closure() {
        let policy: Arc<dyn Policy> = Arc::new(WritebackPolicy::new());
        let flushes = Arc::new(AtomicU64::new(0));
        let counted = flushes.clone();
        let scheduler = Scheduler::spawn(
            policy,
            Duration::from_secs(3600),
            |_p| {},
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        scheduler.flush().await.unwrap();
        scheduler.flush().await.unwrap();
        assert_eq!(flushes.load(Ordering::SeqCst), 2);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn tick_fires_policy_tick_on_schedule() {
        let policy: Arc<dyn Policy> = Arc::new(WritebackPolicy::new());
        let ticks = Arc::new(AtomicU64::new(0));
        let counted = ticks.clone();
        let scheduler = Scheduler::spawn(
            policy,
            Duration::from_millis(5),
            move |_p| {
                counted.fetch_add(1, Ordering::SeqCst);
            },
            || Ok(()),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);
        scheduler.shutdown().await;
    }
}
