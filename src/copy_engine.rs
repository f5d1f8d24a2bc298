//! The copy engine (spec §1, §4.6): an async "copy region A -> region B"
//! primitive, abstracted away as an external collaborator the cache core
//! never implements itself, only drives.
//!
//! Grounded in the teacher's background-job submission shape in
//! `multitenant/metering.rs` (`tokio::spawn` doing the work, a channel
//! carrying the result back) — generalized from "collect metrics on a
//! timer" to "copy one block, then tell me".

use crate::block::{CBlock, OBlock};
use crate::error::Result;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    OriginToCache,
    CacheToOrigin,
}

#[derive(Debug, Clone, Copy)]
pub struct CopyRequest {
    pub ob: OBlock,
    pub cb: CBlock,
    pub direction: CopyDirection,
}

/// Something that can migrate one block's content between the origin and
/// cache devices without the caller blocking on it.
pub trait CopyEngine: Send + Sync {
    /// Submit a copy. The outcome arrives on the returned receiver once
    /// the copy (or its failure) completes; dropping the receiver is
    /// safe, the copy still runs to completion.
    fn submit(&self, req: CopyRequest) -> oneshot::Receiver<Result<()>>;
}

/// Completes every copy immediately with no I/O — for tests and for
/// callers with no real origin/cache devices behind the handles.
pub struct NullCopyEngine;

impl CopyEngine for NullCopyEngine {
    fn submit(&self, _req: CopyRequest) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        rx
    }
}

/// Fake copy engine with a configurable artificial delay, for exercising
/// the `ACTIVE`/in-flight window between a copy starting and its endio
/// (spec §4.6).
pub struct FakeCopyEngine {
    delay: std::time::Duration,
}

impl FakeCopyEngine {
    pub fn new(delay: std::time::Duration) -> Self {
        Self { delay }
    }
}

impl Default for FakeCopyEngine {
    fn default() -> Self {
        Self::new(std::time::Duration::ZERO)
    }
}

impl CopyEngine for FakeCopyEngine {
    fn submit(&self, _req: CopyRequest) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        let delay = self.delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send(Ok(()));
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{CBlock, OBlock};

    #[tokio::test]
    async fn null_copy_engine_completes_immediately() {
        let engine = NullCopyEngine;
        let rx = engine.submit(CopyRequest {
            ob: OBlock::new(1),
            cb: CBlock::new(1),
            direction: CopyDirection::OriginToCache,
        });
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn fake_copy_engine_completes_after_delay() {
        let engine = FakeCopyEngine::new(std::time::Duration::from_millis(1));
        let rx = engine.submit(CopyRequest {
            ob: OBlock::new(2),
            cb: CBlock::new(2),
            direction: CopyDirection::CacheToOrigin,
        });
        assert!(rx.await.unwrap().is_ok());
    }
}
