//! Capacity enforcement and eviction

use crate::error::PreviewError;
use crate::reclaimer::{ReclaimReason, Reclaimer};
use crate::registry::{EvictionCandidate, InstanceRegistry};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Held by a creation until its slot is reserved
///
/// While a permit exists no other creation can evict or reserve.
pub struct AdmissionPermit {
    _gate: OwnedMutexGuard<()>,
}

pub struct AdmissionController {
    gate: Arc<Mutex<()>>,
    registry: Arc<InstanceRegistry>,
    reclaimer: Arc<Reclaimer>,
}

impl AdmissionController {
    pub fn new(registry: Arc<InstanceRegistry>, reclaimer: Arc<Reclaimer>) -> Self {
        Self {
            gate: Arc::new(Mutex::new(())),
            registry,
            reclaimer,
        }
    }

    /// Wait for the gate, evicting the oldest instances until there is room
    ///
    /// Returns the victims' app ids alongside the permit.
    pub async fn admit(&self, app_id: &str) -> Result<(AdmissionPermit, Vec<String>), PreviewError> {
        let gate = Arc::clone(&self.gate).lock_owned().await;
        let max = self.registry.max_instances();
        let mut evicted = Vec::new();

        while self.registry.len() >= max {
            // A slot that appeared while waiting on the gate is joined, not replaced
            if self.registry.state(app_id).is_some() {
                debug!(app_id, "App already holds a slot, skipping eviction");
                break;
            }

            let Some(victim) = select_victim(&self.registry.eviction_candidates()) else {
                warn!(app_id, max, "Capacity full and every instance is still starting");
                return Err(PreviewError::EvictionFailed {
                    reason: "all instances are still starting".to_string(),
                });
            };

            info!(app_id, victim = %victim.app_id, created_at = %victim.created_at, "Evicting oldest instance");
            match self
                .reclaimer
                .try_reclaim(&victim.app_id, None, ReclaimReason::Evicted)
                .await
            {
                Ok(()) => evicted.push(victim.app_id),
                // Finished by someone else in the meantime
                Err(PreviewError::AlreadyReclaimed { .. }) => {}
                Err(e) => {
                    warn!(app_id, victim = %victim.app_id, error = %e, "Eviction failed");
                    return Err(PreviewError::EvictionFailed {
                        reason: format!("could not reclaim '{}': {}", victim.app_id, e),
                    });
                }
            }
        }

        Ok((AdmissionPermit { _gate: gate }, evicted))
    }
}

/// Oldest Running or Expiring instance, ties broken by app id
pub fn select_victim(candidates: &[EvictionCandidate]) -> Option<EvictionCandidate> {
    candidates
        .iter()
        .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.app_id.cmp(&b.app_id)))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppDefinition, AppSource};
    use crate::launcher::InstanceHandle;
    use crate::ports::PortAllocator;
    use crate::registry::Reservation;
    use crate::scheduler::{ExpiryEvent, InstanceState, LifecycleScheduler};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn candidate(app_id: &str, secs: i64) -> EvictionCandidate {
        EvictionCandidate {
            app_id: app_id.to_string(),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            state: InstanceState::Running,
        }
    }

    #[test]
    fn test_select_oldest() {
        let candidates = vec![candidate("b", 5), candidate("a", 10), candidate("c", 1)];
        assert_eq!(select_victim(&candidates).unwrap().app_id, "c");
    }

    #[test]
    fn test_ties_broken_by_app_id() {
        let candidates = vec![candidate("zeta", 1), candidate("alpha", 1), candidate("mid", 2)];
        assert_eq!(select_victim(&candidates).unwrap().app_id, "alpha");
    }

    #[test]
    fn test_no_candidates() {
        assert!(select_victim(&[]).is_none());
    }

    fn controller(base: u16, max: usize) -> (AdmissionController, Arc<InstanceRegistry>, UnboundedReceiver<ExpiryEvent>) {
        let ports = Arc::new(PortAllocator::new(base..=base + 3, "127.0.0.1"));
        let (scheduler, rx) = LifecycleScheduler::new();
        let registry = Arc::new(InstanceRegistry::new(ports, scheduler, max));
        let reclaimer = Arc::new(Reclaimer::new(
            Arc::clone(&registry),
            Duration::from_secs(1),
            Duration::from_secs(1),
        ));
        (AdmissionController::new(Arc::clone(&registry), reclaimer), registry, rx)
    }

    /// Reserve and activate `def` behind a handle that cannot be stopped
    fn run_stuck(registry: &InstanceRegistry, def: &AppDefinition) -> u16 {
        let Reservation::Reserved { generation, .. } = registry.reserve(def).unwrap() else {
            panic!("expected Reserved");
        };
        registry.activate(&def.app_id, generation, InstanceHandle::Stuck).unwrap()
    }

    fn definition() -> AppDefinition {
        AppDefinition::new("u", AppSource::default(), Utc::now(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_failed_eviction_keeps_victim_running() {
        let (admission, registry, _rx) = controller(43400, 1);
        let victim = definition();
        let port = run_stuck(&registry, &victim);

        let err = admission.admit("newcomer").await.err().unwrap();
        assert!(matches!(err, PreviewError::EvictionFailed { .. }));
        assert!(err.to_string().contains(&victim.app_id));

        // Teardown was undone: still routable and still owning its port
        assert_eq!(registry.state(&victim.app_id), Some(InstanceState::Running));
        assert_eq!(registry.lookup(&victim.app_id), Some(port));
        assert!(registry.ports().is_reserved(port));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_admit_joins_existing_slot_without_evicting() {
        let (admission, registry, _rx) = controller(43410, 2);
        let bystander = definition();
        let port = run_stuck(&registry, &bystander);
        let starting = definition();
        assert!(matches!(registry.reserve(&starting).unwrap(), Reservation::Reserved { .. }));

        let (_permit, evicted) = admission.admit(&starting.app_id).await.unwrap();
        assert!(evicted.is_empty());
        assert_eq!(registry.lookup(&bystander.app_id), Some(port));
        assert_eq!(registry.len(), 2);
    }
}
