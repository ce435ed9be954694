//! Single consumer of the work queue.
//!
//! The worker takes one key at a time, waits for a permit from a token
//! bucket and runs a sync pass. A settled pass clears the key's backoff;
//! anything else re-queues it with per-key exponential delay.

use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};

use crate::controller::SyncOutcome;
use crate::queue::WorkQueue;
use crate::Result;

/// One convergence pass
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Syncer: Send + Sync {
    /// Run a single pass
    async fn sync(&self) -> Result<SyncOutcome>;
}

/// Drains the queue one key at a time
pub struct Worker {
    queue: WorkQueue<String>,
    syncer: Arc<dyn Syncer>,
    limiter: DefaultDirectRateLimiter,
}

impl Worker {
    /// Create a worker allowing `permits_per_minute` passes with `burst` headroom
    pub fn new(
        queue: WorkQueue<String>,
        syncer: Arc<dyn Syncer>,
        permits_per_minute: NonZeroU32,
        burst: NonZeroU32,
    ) -> Self {
        let quota = Quota::per_minute(permits_per_minute).allow_burst(burst);
        Self {
            queue,
            syncer,
            limiter: RateLimiter::direct(quota),
        }
    }

    /// Process keys until the queue shuts down
    pub async fn run(&self) {
        info!("Worker started");
        while let Some(key) = self.queue.get().await {
            self.limiter.until_ready().await;
            self.process(&key).await;
        }
        info!("Worker stopped");
    }

    async fn process(&self, key: &str) {
        match self.syncer.sync().await {
            Ok(SyncOutcome::Converged) => {
                debug!(key = %key, "Sync converged");
                self.queue.forget(key);
            }
            Ok(SyncOutcome::RequeueRequested) => {
                debug!(key = %key, "Sync requested requeue");
                self.queue.add_rate_limited(key.to_string());
            }
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    requeues = self.queue.num_requeues(key),
                    "Sync failed, requeueing"
                );
                self.queue.add_rate_limited(key.to_string());
            }
        }
        self.queue.done(key);
    }
}
