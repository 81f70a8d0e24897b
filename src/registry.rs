//! Authoritative table of preview instances
//!
//! Every change to an instance's state, its port ownership and its expiry
//! timer happens under one lock. The route table used by the router is a
//! separate `DashMap` updated inside the same critical sections, so lookups
//! never contend with lifecycle work.

use crate::app::AppDefinition;
use crate::error::PreviewError;
use crate::launcher::InstanceHandle;
use crate::ports::PortAllocator;
use crate::scheduler::{ExpiryTimer, InstanceState, LifecycleScheduler};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Minimum delay before retrying the teardown of a restored instance
const TEARDOWN_RETRY_DELAY: Duration = Duration::from_secs(1);

struct Instance {
    generation: u64,
    port: u16,
    state: InstanceState,
    handle: Option<InstanceHandle>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    timer: Option<ExpiryTimer>,
    /// Fires when a Starting instance becomes Running; dropped if it fails
    ready_tx: broadcast::Sender<()>,
    /// Flips to true when an in-progress teardown finishes either way
    done_tx: watch::Sender<bool>,
}

/// Snapshot of one instance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub app_id: String,
    pub port: u16,
    pub state: InstanceState,
    pub generation: u64,
    pub kind: &'static str,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of asking for a slot for an app
#[derive(Debug)]
pub enum Reservation {
    /// A Starting slot now owns `port`; the caller must launch and then
    /// activate or abandon it
    Reserved { port: u16, generation: u64 },
    /// The app already has a routable instance
    Live(u16),
    /// Another caller is launching this app
    Pending(broadcast::Receiver<()>),
    /// The app's instance is being torn down
    TearingDown(watch::Receiver<bool>),
}

/// An instance claimed for teardown
#[derive(Debug)]
pub struct Claim {
    pub app_id: String,
    pub generation: u64,
    pub port: u16,
    pub handle: Option<InstanceHandle>,
}

/// Outcome of trying to claim an instance for teardown
#[derive(Debug)]
pub enum Teardown {
    /// Nothing to tear down (or only a newer generation exists)
    Absent,
    /// Another teardown is running; resolves when it finishes
    InProgress(watch::Receiver<bool>),
    /// The instance is still launching
    Starting(broadcast::Receiver<()>),
    /// The caller owns the teardown
    Claimed(Claim),
}

/// A Running or Expiring instance that admission may evict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub app_id: String,
    pub created_at: DateTime<Utc>,
    pub state: InstanceState,
}

pub struct InstanceRegistry {
    inner: Mutex<HashMap<String, Instance>>,
    routes: DashMap<String, u16>,
    ports: Arc<PortAllocator>,
    scheduler: LifecycleScheduler,
    max_instances: usize,
    next_generation: AtomicU64,
}

impl InstanceRegistry {
    pub fn new(ports: Arc<PortAllocator>, scheduler: LifecycleScheduler, max_instances: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            routes: DashMap::new(),
            ports,
            scheduler,
            max_instances,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    /// Port of the routable instance for `app_id`
    pub fn lookup(&self, app_id: &str) -> Option<u16> {
        self.routes.get(app_id).map(|entry| *entry.value())
    }

    /// Number of instances holding a port (Starting, Running or Expiring)
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn state(&self, app_id: &str) -> Option<InstanceState> {
        self.inner.lock().get(app_id).map(|slot| slot.state)
    }

    pub fn app_ids(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }

    /// All instances, oldest first
    pub fn list(&self) -> Vec<InstanceInfo> {
        let inner = self.inner.lock();
        let mut list: Vec<InstanceInfo> = inner
            .iter()
            .map(|(app_id, slot)| InstanceInfo {
                app_id: app_id.clone(),
                port: slot.port,
                state: slot.state,
                generation: slot.generation,
                kind: slot.handle.as_ref().map_or("pending", InstanceHandle::kind),
                created_at: slot.created_at,
                expires_at: slot.expires_at,
            })
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.app_id.cmp(&b.app_id)));
        list
    }

    pub fn eviction_candidates(&self) -> Vec<EvictionCandidate> {
        self.inner
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot.state, InstanceState::Running | InstanceState::Expiring))
            .map(|(app_id, slot)| EvictionCandidate {
                app_id: app_id.clone(),
                created_at: slot.created_at,
                state: slot.state,
            })
            .collect()
    }

    /// Running instances whose expiry has passed, as (app id, generation)
    pub fn overdue(&self, now: DateTime<Utc>) -> Vec<(String, u64)> {
        self.inner
            .lock()
            .iter()
            .filter(|(_, slot)| slot.state == InstanceState::Running && slot.expires_at <= now)
            .map(|(app_id, slot)| (app_id.clone(), slot.generation))
            .collect()
    }

    /// The reservation a caller joins when `app_id` already holds a slot
    pub fn existing(&self, app_id: &str) -> Option<Reservation> {
        self.inner.lock().get(app_id).and_then(Self::join_slot)
    }

    fn join_slot(slot: &Instance) -> Option<Reservation> {
        match slot.state {
            InstanceState::Running => Some(Reservation::Live(slot.port)),
            InstanceState::Starting => Some(Reservation::Pending(slot.ready_tx.subscribe())),
            InstanceState::Expiring => Some(Reservation::TearingDown(slot.done_tx.subscribe())),
            InstanceState::Reclaimed | InstanceState::Failed => None,
        }
    }

    /// Reserve a port and a Starting slot for `def`
    ///
    /// Bind probes run outside the lock; the port claim and the slot
    /// insertion happen together under it.
    pub fn reserve(&self, def: &AppDefinition) -> Result<Reservation, PreviewError> {
        let app_id = def.app_id.as_str();
        if let Some(existing) = self.existing(app_id) {
            return Ok(existing);
        }

        let mut skipped = BTreeSet::new();
        loop {
            let port = self.ports.next_candidate(&skipped)?;
            if !self.ports.probe(port) {
                self.ports.discard(port);
                skipped.insert(port);
                continue;
            }

            let mut inner = self.inner.lock();
            if let Some(existing) = inner.get(app_id).and_then(Self::join_slot) {
                self.ports.discard(port);
                return Ok(existing);
            }
            if inner.len() >= self.max_instances {
                self.ports.discard(port);
                return Err(PreviewError::EvictionFailed {
                    reason: format!("capacity of {} instances reached", self.max_instances),
                });
            }
            if !self.ports.claim(port) {
                skipped.insert(port);
                continue;
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let (ready_tx, _) = broadcast::channel(1);
            let (done_tx, _) = watch::channel(false);
            inner.insert(
                app_id.to_string(),
                Instance {
                    generation,
                    port,
                    state: InstanceState::Starting,
                    handle: None,
                    created_at: Utc::now(),
                    expires_at: def.expires_at,
                    timer: None,
                    ready_tx,
                    done_tx,
                },
            );

            debug!(app_id, port, generation, "Reserved instance slot");
            return Ok(Reservation::Reserved { port, generation });
        }
    }

    /// Mark a launched instance Running, arm its timer and make it routable
    ///
    /// Hands the handle back if the slot is no longer the one reserved.
    pub fn activate(&self, app_id: &str, generation: u64, handle: InstanceHandle) -> Result<u16, InstanceHandle> {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.get_mut(app_id).filter(|slot| slot.generation == generation) else {
            return Err(handle);
        };
        if !slot.state.compare_and_transition(InstanceState::Starting, InstanceState::Running) {
            return Err(handle);
        }

        slot.handle = Some(handle);
        slot.timer = Some(self.scheduler.arm(app_id, generation, slot.expires_at));
        self.routes.insert(app_id.to_string(), slot.port);
        let _ = slot.ready_tx.send(());

        info!(app_id, port = slot.port, generation, expires_at = %slot.expires_at, "Instance running");
        Ok(slot.port)
    }

    /// Drop a Starting slot whose launch failed and release its port
    pub fn abandon(&self, app_id: &str, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        let matches = inner
            .get_mut(app_id)
            .filter(|slot| slot.generation == generation)
            .is_some_and(|slot| slot.state.compare_and_transition(InstanceState::Starting, InstanceState::Failed));
        if !matches {
            return false;
        }

        if let Some(slot) = inner.remove(app_id) {
            self.ports.release(slot.port);
            warn!(app_id, port = slot.port, generation, "Abandoned failed instance");
        }
        true
    }

    /// Claim an instance for teardown (`Running -> Expiring`)
    ///
    /// With `generation` set, only that generation is claimed.
    pub fn begin_teardown(&self, app_id: &str, generation: Option<u64>) -> Teardown {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.get_mut(app_id) else {
            return Teardown::Absent;
        };
        if generation.is_some_and(|g| g != slot.generation) {
            return Teardown::Absent;
        }

        match slot.state {
            InstanceState::Starting => Teardown::Starting(slot.ready_tx.subscribe()),
            InstanceState::Expiring => Teardown::InProgress(slot.done_tx.subscribe()),
            InstanceState::Running => {
                slot.state.compare_and_transition(InstanceState::Running, InstanceState::Expiring);
                self.routes.remove(app_id);
                if let Some(timer) = slot.timer.take() {
                    timer.cancel();
                }
                slot.done_tx = watch::channel(false).0;

                debug!(app_id, port = slot.port, generation = slot.generation, "Claimed instance for teardown");
                Teardown::Claimed(Claim {
                    app_id: app_id.to_string(),
                    generation: slot.generation,
                    port: slot.port,
                    handle: slot.handle.take(),
                })
            }
            InstanceState::Reclaimed | InstanceState::Failed => Teardown::Absent,
        }
    }

    /// Finish a teardown: mark Reclaimed, release the port, drop the slot
    pub fn complete_teardown(&self, claim: &Claim) -> bool {
        let mut inner = self.inner.lock();
        let matches = inner
            .get_mut(&claim.app_id)
            .filter(|slot| slot.generation == claim.generation)
            .is_some_and(|slot| slot.state.compare_and_transition(InstanceState::Expiring, InstanceState::Reclaimed));
        if !matches {
            return false;
        }

        if let Some(slot) = inner.remove(&claim.app_id) {
            self.ports.release(slot.port);
            let _ = slot.done_tx.send(true);
        }
        true
    }

    /// Undo a failed teardown: back to Running with a fresh timer
    pub fn restore(&self, claim: Claim) -> bool {
        let mut inner = self.inner.lock();
        let Some(slot) = inner
            .get_mut(&claim.app_id)
            .filter(|slot| slot.generation == claim.generation)
        else {
            return false;
        };
        if !slot.state.compare_and_transition(InstanceState::Expiring, InstanceState::Running) {
            return false;
        }

        let retry_at = Utc::now()
            + chrono::Duration::from_std(TEARDOWN_RETRY_DELAY).unwrap_or_else(|_| chrono::Duration::seconds(1));
        slot.handle = claim.handle;
        slot.timer = Some(self.scheduler.arm(&claim.app_id, slot.generation, slot.expires_at.max(retry_at)));
        self.routes.insert(claim.app_id.clone(), slot.port);
        let _ = slot.done_tx.send(true);

        warn!(app_id = %claim.app_id, port = slot.port, generation = slot.generation, "Restored instance after failed teardown");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppSource;
    use crate::launcher::{InstanceLauncher, LaunchSettings};
    use crate::render::ScaffoldRenderer;

    fn registry(base: u16, len: u16, max: usize) -> (InstanceRegistry, tokio::sync::mpsc::UnboundedReceiver<crate::scheduler::ExpiryEvent>) {
        let ports = Arc::new(PortAllocator::new(base..=base + len - 1, "127.0.0.1"));
        let (scheduler, rx) = LifecycleScheduler::new();
        (InstanceRegistry::new(ports, scheduler, max), rx)
    }

    fn definition(ttl: Duration) -> AppDefinition {
        AppDefinition::new("u", AppSource::default(), Utc::now(), ttl)
    }

    async fn launch(def: &AppDefinition, port: u16) -> InstanceHandle {
        InstanceLauncher::new(Arc::new(ScaffoldRenderer), LaunchSettings::default())
            .launch(def, port)
            .await
            .unwrap()
    }

    fn reserved(reservation: Reservation) -> (u16, u64) {
        match reservation {
            Reservation::Reserved { port, generation } => (port, generation),
            other => panic!("expected Reserved, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reserve_activate_lookup() {
        let (registry, _rx) = registry(43000, 4, 4);
        let def = definition(Duration::from_secs(60));

        let (port, generation) = reserved(registry.reserve(&def).unwrap());
        assert_eq!(registry.state(&def.app_id), Some(InstanceState::Starting));
        assert!(registry.ports().is_reserved(port));
        // Not routable until running
        assert_eq!(registry.lookup(&def.app_id), None);

        let handle = launch(&def, port).await;
        assert_eq!(registry.activate(&def.app_id, generation, handle).unwrap(), port);
        assert_eq!(registry.state(&def.app_id), Some(InstanceState::Running));
        assert_eq!(registry.lookup(&def.app_id), Some(port));

        // A second reservation sees the live instance
        assert!(matches!(registry.reserve(&def).unwrap(), Reservation::Live(p) if p == port));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_reservation_while_starting() {
        let (registry, _rx) = registry(43010, 4, 4);
        let def = definition(Duration::from_secs(60));

        let (port, generation) = reserved(registry.reserve(&def).unwrap());
        let Reservation::Pending(mut ready) = registry.reserve(&def).unwrap() else {
            panic!("expected Pending");
        };

        let handle = launch(&def, port).await;
        registry.activate(&def.app_id, generation, handle).unwrap();
        ready.recv().await.unwrap();
        assert_eq!(registry.lookup(&def.app_id), Some(port));
    }

    #[tokio::test]
    async fn test_abandon_releases_port() {
        let (registry, _rx) = registry(43020, 4, 4);
        let def = definition(Duration::from_secs(60));

        let (port, generation) = reserved(registry.reserve(&def).unwrap());
        assert!(registry.abandon(&def.app_id, generation));
        assert!(!registry.ports().is_reserved(port));
        assert!(registry.is_empty());
        // Second abandon is a no-op
        assert!(!registry.abandon(&def.app_id, generation));
    }

    #[tokio::test]
    async fn test_capacity_guard() {
        let (registry, _rx) = registry(43030, 4, 1);
        let first = definition(Duration::from_secs(60));
        let second = definition(Duration::from_secs(60));

        reserved(registry.reserve(&first).unwrap());
        let err = registry.reserve(&second).unwrap_err();
        assert!(matches!(err, PreviewError::EvictionFailed { .. }));
        assert_eq!(registry.ports().in_use().len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_claim_is_exclusive() {
        let (registry, _rx) = registry(43040, 4, 4);
        let def = definition(Duration::from_secs(60));
        let (port, generation) = reserved(registry.reserve(&def).unwrap());
        registry.activate(&def.app_id, generation, launch(&def, port).await).unwrap();

        let Teardown::Claimed(mut claim) = registry.begin_teardown(&def.app_id, None) else {
            panic!("expected Claimed");
        };
        assert_eq!(registry.state(&def.app_id), Some(InstanceState::Expiring));
        assert_eq!(registry.lookup(&def.app_id), None);
        // Port stays owned while expiring
        assert!(registry.ports().is_reserved(port));

        let Teardown::InProgress(mut done) = registry.begin_teardown(&def.app_id, None) else {
            panic!("expected InProgress");
        };

        let mut handle = claim.handle.take().unwrap();
        handle.stop(&def.app_id, Duration::from_secs(1)).await.unwrap();
        assert!(registry.complete_teardown(&claim));
        done.wait_for(|d| *d).await.unwrap();

        assert!(registry.is_empty());
        assert!(!registry.ports().is_reserved(port));
        assert!(matches!(registry.begin_teardown(&def.app_id, None), Teardown::Absent));
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let (registry, _rx) = registry(43050, 4, 4);
        let def = definition(Duration::from_secs(60));
        let (port, generation) = reserved(registry.reserve(&def).unwrap());
        registry.activate(&def.app_id, generation, launch(&def, port).await).unwrap();

        assert!(matches!(
            registry.begin_teardown(&def.app_id, Some(generation + 100)),
            Teardown::Absent
        ));
        assert_eq!(registry.state(&def.app_id), Some(InstanceState::Running));
    }

    #[tokio::test]
    async fn test_restore_after_failed_teardown() {
        let (registry, _rx) = registry(43060, 4, 4);
        let def = definition(Duration::from_secs(60));
        let (port, generation) = reserved(registry.reserve(&def).unwrap());
        registry.activate(&def.app_id, generation, launch(&def, port).await).unwrap();

        let Teardown::Claimed(claim) = registry.begin_teardown(&def.app_id, None) else {
            panic!("expected Claimed");
        };
        assert!(registry.restore(claim));
        assert_eq!(registry.state(&def.app_id), Some(InstanceState::Running));
        assert_eq!(registry.lookup(&def.app_id), Some(port));
        assert_eq!(registry.list()[0].kind, "static");
    }

    #[tokio::test]
    async fn test_timer_armed_on_activate() {
        let (registry, mut rx) = registry(43070, 4, 4);
        let def = definition(Duration::from_millis(50));
        let (port, generation) = reserved(registry.reserve(&def).unwrap());
        registry.activate(&def.app_id, generation, launch(&def, port).await).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.app_id, def.app_id);
        assert_eq!(event.generation, generation);
        assert_eq!(registry.overdue(Utc::now()).len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_candidates_skip_starting() {
        let (registry, _rx) = registry(43080, 4, 4);
        let running = definition(Duration::from_secs(60));
        let starting = definition(Duration::from_secs(60));

        let (port, generation) = reserved(registry.reserve(&running).unwrap());
        registry.activate(&running.app_id, generation, launch(&running, port).await).unwrap();
        reserved(registry.reserve(&starting).unwrap());

        let candidates = registry.eviction_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].app_id, running.app_id);
    }
}
