//! Tearing instances down and releasing what they hold

use crate::error::PreviewError;
use crate::registry::{InstanceRegistry, Teardown};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Claim attempts before giving up on an instance whose teardowns keep failing
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Why an instance is being reclaimed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReclaimReason {
    /// TTL elapsed
    Expired,
    /// Made room for a new instance
    Evicted,
    /// Explicit deletion
    Deleted,
    /// Host shutting down
    Shutdown,
}

impl ReclaimReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReclaimReason::Expired => "expired",
            ReclaimReason::Evicted => "evicted",
            ReclaimReason::Deleted => "deleted",
            ReclaimReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ReclaimReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Reclaimer {
    registry: Arc<InstanceRegistry>,
    grace_period: Duration,
    startup_timeout: Duration,
}

impl Reclaimer {
    pub fn new(registry: Arc<InstanceRegistry>, grace_period: Duration, startup_timeout: Duration) -> Self {
        Self {
            registry,
            grace_period,
            startup_timeout,
        }
    }

    /// Tear down the instance for `app_id`
    ///
    /// Returns `AlreadyReclaimed` when there was nothing to tear down or a
    /// concurrent teardown finished the job. With `generation` set only that
    /// generation is touched.
    pub async fn try_reclaim(
        &self,
        app_id: &str,
        generation: Option<u64>,
        reason: ReclaimReason,
    ) -> Result<(), PreviewError> {
        let mut waited_for_start = false;

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            match self.registry.begin_teardown(app_id, generation) {
                Teardown::Absent => {
                    return Err(PreviewError::AlreadyReclaimed {
                        app_id: app_id.to_string(),
                    });
                }
                Teardown::InProgress(mut done) => {
                    debug!(app_id, %reason, "Waiting for concurrent teardown");
                    let _ = done.wait_for(|finished| *finished).await;
                }
                Teardown::Starting(mut ready) => {
                    if waited_for_start {
                        break;
                    }
                    waited_for_start = true;
                    debug!(app_id, %reason, "Waiting for starting instance before reclaiming");
                    // Closed channel means the launch failed and the slot is gone
                    let _ = tokio::time::timeout(self.startup_timeout, ready.recv()).await;
                }
                Teardown::Claimed(mut claim) => {
                    let stopped = match claim.handle.as_mut() {
                        Some(handle) => handle.stop(app_id, self.grace_period).await,
                        None => Ok(()),
                    };

                    return match stopped {
                        Ok(()) => {
                            self.registry.complete_teardown(&claim);
                            info!(
                                app_id,
                                port = claim.port,
                                generation = claim.generation,
                                %reason,
                                "Instance reclaimed"
                            );
                            Ok(())
                        }
                        Err(e) => {
                            error!(app_id, port = claim.port, %reason, error = %e, "Teardown failed");
                            self.registry.restore(claim);
                            Err(PreviewError::TeardownFailed {
                                app_id: app_id.to_string(),
                                cause: e.to_string(),
                            })
                        }
                    };
                }
            }
        }

        Err(PreviewError::TeardownFailed {
            app_id: app_id.to_string(),
            cause: "instance could not be claimed for teardown".to_string(),
        })
    }

    /// Like [`try_reclaim`](Self::try_reclaim), with nothing-to-do treated as
    /// success. Returns whether this call performed the teardown.
    pub async fn reclaim(
        &self,
        app_id: &str,
        generation: Option<u64>,
        reason: ReclaimReason,
    ) -> Result<bool, PreviewError> {
        match self.try_reclaim(app_id, generation, reason).await {
            Ok(()) => Ok(true),
            Err(PreviewError::AlreadyReclaimed { .. }) => {
                debug!(app_id, %reason, "Already reclaimed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
