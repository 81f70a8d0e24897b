//! Orchestration of the preview lifecycle
//!
//! `PreviewManager` wires admission, port allocation, launching, the
//! registry, expiry timers and reclamation together, and exposes the
//! operations the HTTP layer needs.

use crate::admission::AdmissionController;
use crate::app::{AppDefinition, AppSource};
use crate::config::Config;
use crate::error::PreviewError;
use crate::launcher::{InstanceLauncher, LaunchSettings};
use crate::ports::PortAllocator;
use crate::reclaimer::{ReclaimReason, Reclaimer};
use crate::registry::{InstanceInfo, InstanceRegistry, Reservation};
use crate::render::PreviewRenderer;
use crate::scheduler::{ExpiryEvent, LifecycleScheduler};
use crate::session::{SessionStatus, SessionStore};
use crate::store::{AppStore, StoredApp};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Longest accepted user id
pub const MAX_USER_ID_LEN: usize = 128;

/// Counters for lifecycle events
#[derive(Debug, Default)]
pub struct LifecycleStats {
    launched: AtomicU64,
    launch_failures: AtomicU64,
    reclaimed: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
    rehydrated: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub launched: u64,
    pub launch_failures: u64,
    pub reclaimed: u64,
    pub expired: u64,
    pub evicted: u64,
    pub rehydrated: u64,
}

impl LifecycleStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            launched: self.launched.load(Ordering::Relaxed),
            launch_failures: self.launch_failures.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            rehydrated: self.rehydrated.load(Ordering::Relaxed),
        }
    }
}

/// Result of a successful creation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedPreview {
    pub session_id: String,
    pub app_id: String,
    pub preview_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Externally visible session status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub app_id: String,
    pub public_url: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub active_instances: usize,
    pub max_instances: usize,
    pub available_ports: usize,
    pub counters: StatsSnapshot,
}

pub struct PreviewManager {
    registry: Arc<InstanceRegistry>,
    admission: AdmissionController,
    reclaimer: Arc<Reclaimer>,
    launcher: Arc<InstanceLauncher>,
    store: Arc<dyn AppStore>,
    sessions: SessionStore,
    stats: Arc<LifecycleStats>,
    default_ttl: Duration,
    startup_timeout: Duration,
    public_url: String,
}

impl PreviewManager {
    /// Build the manager and start its expiry worker
    pub fn new(config: &Config, store: Arc<dyn AppStore>, renderer: Arc<dyn PreviewRenderer>) -> Arc<Self> {
        let preview = &config.preview;
        let ports = Arc::new(PortAllocator::new(preview.port_range(), &preview.listen_host));
        let (scheduler, expiry_rx) = LifecycleScheduler::new();
        let registry = Arc::new(InstanceRegistry::new(
            ports,
            scheduler,
            preview.max_concurrent_instances,
        ));
        let reclaimer = Arc::new(Reclaimer::new(
            Arc::clone(&registry),
            preview.shutdown_grace_period(),
            preview.startup_timeout(),
        ));
        let admission = AdmissionController::new(Arc::clone(&registry), Arc::clone(&reclaimer));
        let launcher = Arc::new(InstanceLauncher::new(
            renderer,
            LaunchSettings {
                listen_host: preview.listen_host.clone(),
                backend: preview.backend.clone(),
                startup_timeout: preview.startup_timeout(),
                health_check_interval: preview.health_check_interval(),
                health_path: preview.health_path.clone(),
            },
        ));

        let manager = Arc::new(Self {
            registry,
            admission,
            reclaimer,
            launcher,
            store,
            sessions: SessionStore::new(preview.session_retention()),
            stats: Arc::new(LifecycleStats::default()),
            default_ttl: preview.default_ttl(),
            startup_timeout: preview.startup_timeout(),
            public_url: config.server.public_base_url(),
        });

        tokio::spawn(expiry_worker(Arc::downgrade(&manager), expiry_rx));

        info!(
            max_instances = preview.max_concurrent_instances,
            port_range = ?preview.port_range(),
            ttl_secs = preview.default_ttl_secs,
            "Preview manager started"
        );
        manager
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn preview_url(&self, app_id: &str) -> String {
        format!("{}/preview/{}/", self.public_url, app_id)
    }

    /// Port of the routable instance for `app_id`
    pub fn lookup(&self, app_id: &str) -> Option<u16> {
        self.registry.lookup(app_id)
    }

    /// Full creation sequence for a new app
    pub async fn create_preview(&self, user_id: &str, source: AppSource) -> Result<CreatedPreview, PreviewError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(PreviewError::InvalidRequest("userId must not be empty".to_string()));
        }
        if user_id.len() > MAX_USER_ID_LEN {
            return Err(PreviewError::InvalidRequest(format!(
                "userId must be at most {} characters",
                MAX_USER_ID_LEN
            )));
        }

        let now = Utc::now();
        let def = AppDefinition::new(user_id, source, now, self.default_ttl);
        self.store.save(&def)?;
        let session_id = self.sessions.open(&def.app_id, user_id, now, def.expires_at);

        info!(app_id = %def.app_id, session_id, user_id, "Creating preview");

        match self.launch(&def).await {
            Ok(port) => {
                self.sessions.settle(&session_id, SessionStatus::Live);
                info!(app_id = %def.app_id, port, "Preview live");
                Ok(CreatedPreview {
                    session_id,
                    preview_url: self.preview_url(&def.app_id),
                    app_id: def.app_id,
                    expires_at: def.expires_at,
                })
            }
            Err(e) => {
                self.sessions.settle(&session_id, SessionStatus::Failed);
                if let Err(store_err) = self.store.remove(&def.app_id) {
                    warn!(app_id = %def.app_id, error = %store_err, "Failed to remove definition of failed preview");
                }
                error!(app_id = %def.app_id, error = %e, "Preview creation failed");
                Err(e)
            }
        }
    }

    /// Admit, reserve, launch and register an instance for `def`
    ///
    /// Returns the port of the running instance, which may have been
    /// started by a concurrent caller. An app that already holds a slot
    /// joins it without going through admission.
    pub async fn launch(&self, def: &AppDefinition) -> Result<u16, PreviewError> {
        let app_id = def.app_id.as_str();

        // One retry covers an instance that was mid-teardown on the first pass
        for _ in 0..2 {
            let reservation = match self.registry.existing(app_id) {
                Some(existing) => existing,
                None => {
                    let (permit, evicted) = self.admission.admit(app_id).await?;
                    for _ in &evicted {
                        LifecycleStats::bump(&self.stats.evicted);
                        LifecycleStats::bump(&self.stats.reclaimed);
                    }

                    let reservation = self.registry.reserve(def)?;
                    drop(permit);
                    reservation
                }
            };

            match reservation {
                Reservation::Reserved { port, generation } => {
                    return self.start_instance(def, port, generation).await;
                }
                Reservation::Live(port) => return Ok(port),
                Reservation::Pending(mut ready) => {
                    debug!(app_id, "Waiting for concurrent launch");
                    let _ = tokio::time::timeout(self.startup_timeout, ready.recv()).await;
                    return self
                        .registry
                        .lookup(app_id)
                        .ok_or_else(|| PreviewError::launch_failed(app_id, "concurrent launch did not complete"));
                }
                Reservation::TearingDown(mut done) => {
                    debug!(app_id, "Waiting for teardown before relaunching");
                    let _ = done.wait_for(|finished| *finished).await;
                }
            }
        }

        Err(PreviewError::launch_failed(app_id, "instance is being torn down"))
    }

    /// Launch into a reserved slot and settle it
    ///
    /// The launch runs as its own task, so the slot ends up Running or
    /// released even when the caller is dropped mid-launch.
    async fn start_instance(&self, def: &AppDefinition, port: u16, generation: u64) -> Result<u16, PreviewError> {
        let task = tokio::spawn(start_reserved(
            Arc::clone(&self.launcher),
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
            def.clone(),
            port,
            generation,
        ));

        match task.await {
            Ok(result) => result,
            Err(e) => {
                let app_id = def.app_id.as_str();
                error!(app_id, port, generation, error = %e, "Launch task failed");
                self.registry.abandon(app_id, generation);
                LifecycleStats::bump(&self.stats.launch_failures);
                Err(PreviewError::launch_failed(app_id, e))
            }
        }
    }

    /// Bring back an app with no live instance from storage
    pub async fn rehydrate(&self, app_id: &str) -> Result<u16, PreviewError> {
        match self.store.load(app_id, Utc::now())? {
            StoredApp::Found(def) => {
                info!(app_id, "Rehydrating preview from storage");
                let port = self.launch(&def).await?;
                LifecycleStats::bump(&self.stats.rehydrated);
                Ok(port)
            }
            StoredApp::Expired => Err(PreviewError::Expired {
                app_id: app_id.to_string(),
            }),
            StoredApp::NotFound => Err(PreviewError::NotFound {
                app_id: app_id.to_string(),
            }),
        }
    }

    /// Reclaim the instance for `app_id`, returning whether this call tore it down
    pub async fn reclaim(&self, app_id: &str, reason: ReclaimReason) -> Result<bool, PreviewError> {
        let reclaimed = self.reclaimer.reclaim(app_id, None, reason).await?;
        if reclaimed {
            self.count_reclaim(reason);
        }
        Ok(reclaimed)
    }

    fn count_reclaim(&self, reason: ReclaimReason) {
        LifecycleStats::bump(&self.stats.reclaimed);
        match reason {
            ReclaimReason::Expired => LifecycleStats::bump(&self.stats.expired),
            ReclaimReason::Evicted => LifecycleStats::bump(&self.stats.evicted),
            ReclaimReason::Deleted | ReclaimReason::Shutdown => {}
        }
    }

    async fn handle_expiry(&self, event: ExpiryEvent) {
        match self
            .reclaimer
            .reclaim(&event.app_id, Some(event.generation), ReclaimReason::Expired)
            .await
        {
            Ok(true) => self.count_reclaim(ReclaimReason::Expired),
            Ok(false) => debug!(app_id = %event.app_id, generation = event.generation, "Expiry found nothing to reclaim"),
            Err(e) => warn!(app_id = %event.app_id, error = %e, "Expiry reclaim failed, timer re-armed"),
        }
    }

    /// Explicit deletion: reclaim the instance and forget the definition
    ///
    /// Returns false when there was neither an instance nor a definition.
    pub async fn delete_preview(&self, app_id: &str) -> Result<bool, PreviewError> {
        let reclaimed = self.reclaim(app_id, ReclaimReason::Deleted).await?;
        let removed = self.store.remove(app_id)?;
        if reclaimed || removed {
            info!(app_id, reclaimed, removed, "Preview deleted");
        }
        Ok(reclaimed || removed)
    }

    pub fn session_status(&self, session_id: &str) -> Option<SessionView> {
        self.sessions.get(session_id, Utc::now()).map(|session| SessionView {
            public_url: self.preview_url(&session.app_id),
            session_id: session.session_id,
            app_id: session.app_id,
            status: session.status,
        })
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            active_instances: self.registry.len(),
            max_instances: self.registry.max_instances(),
            available_ports: self.registry.ports().available(),
            counters: self.stats.snapshot(),
        }
    }

    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.registry.list()
    }

    /// Reclaim Running instances whose expiry passed without a timer event
    pub async fn reap_overdue(&self) -> usize {
        let overdue = self.registry.overdue(Utc::now());
        let mut reaped = 0;
        for (app_id, generation) in overdue {
            warn!(app_id, generation, "Reaping overdue instance");
            self.handle_expiry(ExpiryEvent { app_id, generation }).await;
            reaped += 1;
        }
        reaped
    }

    /// Drop retained sessions and expired stored definitions
    pub fn sweep(&self) {
        let now = Utc::now();
        let sessions = self.sessions.sweep(now);
        let definitions = match self.store.purge_expired(now) {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "Failed to purge expired definitions");
                0
            }
        };
        if sessions > 0 || definitions > 0 {
            debug!(sessions, definitions, "Sweep removed stale entries");
        }
    }

    /// Reclaim every instance
    pub async fn shutdown(&self) {
        let app_ids = self.registry.app_ids();
        info!(count = app_ids.len(), "Reclaiming all instances");

        for app_id in app_ids {
            if let Err(e) = self.reclaim(&app_id, ReclaimReason::Shutdown).await {
                warn!(app_id, error = %e, "Failed to reclaim instance during shutdown");
            }
        }
    }
}

async fn start_reserved(
    launcher: Arc<InstanceLauncher>,
    registry: Arc<InstanceRegistry>,
    stats: Arc<LifecycleStats>,
    def: AppDefinition,
    port: u16,
    generation: u64,
) -> Result<u16, PreviewError> {
    let app_id = def.app_id.as_str();

    match launcher.launch(&def, port).await {
        Ok(handle) => match registry.activate(app_id, generation, handle) {
            Ok(port) => {
                LifecycleStats::bump(&stats.launched);
                Ok(port)
            }
            Err(mut handle) => {
                warn!(app_id, port, generation, "Instance slot vanished during launch");
                if let Err(e) = handle.stop(app_id, Duration::ZERO).await {
                    warn!(app_id, error = %e, "Failed to stop orphaned instance");
                }
                LifecycleStats::bump(&stats.launch_failures);
                Err(PreviewError::launch_failed(app_id, "instance slot vanished during launch"))
            }
        },
        Err(e) => {
            registry.abandon(app_id, generation);
            LifecycleStats::bump(&stats.launch_failures);
            Err(e)
        }
    }
}

async fn expiry_worker(manager: Weak<PreviewManager>, mut events: mpsc::UnboundedReceiver<ExpiryEvent>) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        debug!(app_id = %event.app_id, generation = event.generation, "Handling expiry event");
        tokio::spawn(async move { manager.handle_expiry(event).await });
    }
    debug!("Expiry worker stopped");
}
