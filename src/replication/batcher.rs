//! Updates Batcher
//!
//! Runs batchable updates for one node concurrently, up to a fixed number
//! in flight, and hands completions back to the caller for accounting.

use crate::domain::errors::ReplError;
use crate::replication::types::ApplyResult;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinSet;

/// Batcher of in-flight updates for a single node.
///
/// `C` is the caller's per-update context, returned untouched with the
/// result. Tasks are spawned in submission order on the current runtime.
pub struct UpdatesBatcher<C> {
    max_in_flight: usize,
    in_flight: JoinSet<(C, ApplyResult)>,
}

impl<C: Send + 'static> UpdatesBatcher<C> {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
            in_flight: JoinSet::new(),
        }
    }

    /// Start `apply` and return updates completed while making room for it.
    pub async fn batch<F>(&mut self, ctx: C, apply: F) -> Vec<(C, ApplyResult)>
    where
        F: Future<Output = ApplyResult> + Send + 'static,
    {
        let mut done = Vec::new();
        while self.in_flight.len() >= self.max_in_flight {
            match self.in_flight.join_next().await {
                Some(res) => {
                    if let Some(completed) = Self::completed(res) {
                        done.push(completed);
                    }
                }
                None => break,
            }
        }
        self.in_flight.spawn(async move {
            let res = AssertUnwindSafe(apply)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ReplError::Logic("batched update panicked".into())));
            (ctx, res)
        });
        done
    }

    /// Wait for every in-flight update to complete or fail.
    pub async fn await_batched_updates(&mut self) -> Vec<(C, ApplyResult)> {
        let mut done = Vec::with_capacity(self.in_flight.len());
        while let Some(res) = self.in_flight.join_next().await {
            if let Some(completed) = Self::completed(res) {
                done.push(completed);
            }
        }
        done
    }

    pub fn batched_count(&self) -> usize {
        self.in_flight.len()
    }

    fn completed(
        res: Result<(C, ApplyResult), tokio::task::JoinError>,
    ) -> Option<(C, ApplyResult)> {
        match res {
            Ok(completed) => Some(completed),
            Err(e) => {
                // Tasks are never aborted, so this is a runtime shutdown
                tracing::error!("batched update task failed: {}", e);
                None
            }
        }
    }
}

/// First error among completed updates.
pub fn first_error<C>(done: &[(C, ApplyResult)]) -> Option<ReplError> {
    done.iter().find_map(|(_, res)| res.as_ref().err().cloned())
}
