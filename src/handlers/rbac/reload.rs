//! Keeps the authorization policy in step with the document it was loaded from.
//!
//! [`ReloadingPolicy`] is an [`Enforcer`] whose policy is swapped in place, so
//! the pipeline picks up ConfigMap edits without a restart. Requests already
//! being checked finish against the policy they started with.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::policy::{Enforcer, Policy};
use crate::handlers::Result;

/// Where the current policy document is read from.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn load(&self) -> Result<Policy>;
}

pub struct ReloadingPolicy {
    current: RwLock<Arc<Policy>>,
}

impl ReloadingPolicy {
    pub fn new(initial: Policy) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn current(&self) -> Arc<Policy> {
        self.current.read().clone()
    }

    /// Load the policy again. On error the policy in force is left untouched.
    ///
    /// Returns whether the policy changed.
    pub async fn refresh(&self, source: &dyn PolicySource) -> Result<bool> {
        let policy = source.load().await?;
        if *self.current() == policy {
            debug!("Authorization policy unchanged");
            return Ok(false);
        }
        let enabled = policy.is_enabled();
        let rules = policy.rules().len();
        *self.current.write() = Arc::new(policy);
        if enabled {
            info!(rules, "Reloaded authorization policy");
        } else {
            warn!("Authorization policy reloaded with RBAC disabled");
        }
        Ok(true)
    }

    /// Refresh every `interval` until `shutdown` is cancelled.
    pub async fn run(
        self: Arc<Self>,
        source: Arc<dyn PolicySource>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; the initial policy is already loaded
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh(source.as_ref()).await {
                        warn!(
                            error = %e,
                            "Failed to reload authorization policy, keeping the previous one"
                        );
                    }
                }
            }
        }
        debug!("Policy reload stopped");
    }
}

impl Enforcer for ReloadingPolicy {
    fn enforce(&self, subject: &str, resource: &str, action: &str, object: &str) -> Result<bool> {
        self.current().enforce(subject, resource, action, object)
    }
}
