//! Reconciliation of the registry against the backend's instance list.
//!
//! The backend is ground truth for which instances exist; the registry
//! is ground truth for intent. Rooms whose instance vanished or exited
//! are moved to `Error`. Managed instances no room claims are handled
//! per [`OrphanPolicy`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use roomforge_backend::{InstanceStatus, InstanceSummary, labels};
use roomforge_protocol::{BackendRef, Room, RoomId, RoomStatus, validate_room_name};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::{OrphanPolicy, RoomError, RoomManager};

pub(crate) const INSTANCE_MISSING: &str = "backend instance missing";
pub(crate) const INSTANCE_EXITED: &str = "backend instance exited";

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Another pass was already running; nothing was checked.
    pub skipped: bool,
    /// Rooms compared against the backend.
    pub checked: usize,
    /// Rooms whose instance no longer exists.
    pub missing: Vec<RoomId>,
    /// Running rooms whose instance stopped on its own.
    pub exited: Vec<RoomId>,
    /// Rooms left alone because an operation held their lock.
    pub busy: Vec<RoomId>,
    /// Unclaimed managed instances left in place.
    pub orphans: Vec<BackendRef>,
    /// Rooms rebuilt from unclaimed instances.
    pub adopted: Vec<RoomId>,
    /// Unclaimed instances deleted.
    pub removed_orphans: Vec<BackendRef>,
}

impl ReconcileReport {
    /// Returns `true` if the pass changed or flagged anything.
    pub fn has_findings(&self) -> bool {
        !(self.missing.is_empty()
            && self.exited.is_empty()
            && self.orphans.is_empty()
            && self.adopted.is_empty()
            && self.removed_orphans.is_empty())
    }
}

/// Clears the in-progress flag when a pass ends, however it ends.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RoomManager {
    /// Compares the registry against the backend and repairs drift.
    ///
    /// Never overlaps itself: a concurrent call returns a report with
    /// `skipped` set. Rooms whose lock is held are skipped this pass.
    pub async fn reconcile(&self) -> Result<ReconcileReport, RoomError> {
        let inner = &self.inner;
        if inner.reconciling.swap(true, Ordering::AcqRel) {
            tracing::debug!("reconcile already in progress, skipping");
            return Ok(ReconcileReport {
                skipped: true,
                ..ReconcileReport::default()
            });
        }
        let _in_progress = InProgress(&inner.reconciling);

        // Snapshot before listing, so a room that changes while the list
        // is in flight is recognized by its transition stamp.
        let snapshot = inner.registry.list();
        let instances = inner
            .config
            .retry
            .run("list", || inner.backend.list())
            .await?;
        let by_ref: HashMap<&BackendRef, &InstanceSummary> =
            instances.iter().map(|i| (&i.backend_ref, i)).collect();

        let mut report = ReconcileReport::default();
        for room in snapshot {
            if !matches!(room.status, RoomStatus::Running | RoomStatus::Stopped) {
                continue;
            }
            let Some(backend_ref) = &room.backend_ref else {
                continue;
            };
            report.checked += 1;

            let Some(guard) = inner.locks.try_lock(room.id) else {
                report.busy.push(room.id);
                continue;
            };
            let Some(current) = inner.registry.get(room.id) else {
                // Removed while the list was in flight; `try_lock` may
                // have recreated its entry.
                drop(guard);
                inner.locks.forget(room.id);
                continue;
            };
            if current.last_transition_at != room.last_transition_at {
                continue;
            }

            match by_ref.get(backend_ref) {
                None => {
                    tracing::warn!(room_id = %room.id, %backend_ref, "backend instance missing");
                    self.mark_failed(room.id, INSTANCE_MISSING);
                    report.missing.push(room.id);
                }
                Some(instance) if !instance.running && room.status == RoomStatus::Running => {
                    tracing::warn!(room_id = %room.id, %backend_ref, "backend instance exited");
                    self.mark_failed(room.id, INSTANCE_EXITED);
                    report.exited.push(room.id);
                }
                Some(_) => {}
            }
        }

        // Fresh read: refs recorded while the list was in flight count
        // as claimed.
        let rooms = inner.registry.list();
        let claimed: HashSet<&BackendRef> =
            rooms.iter().filter_map(|r| r.backend_ref.as_ref()).collect();
        let creating: HashSet<RoomId> = rooms
            .iter()
            .filter(|r| r.status == RoomStatus::Creating)
            .map(|r| r.id)
            .collect();

        for instance in &instances {
            if instance.labels.get(labels::MANAGED).map(String::as_str) != Some("true")
                || claimed.contains(&instance.backend_ref)
            {
                continue;
            }
            let owner = instance
                .labels
                .get(labels::ROOM_ID)
                .and_then(|id| id.parse::<RoomId>().ok());
            if owner.is_some_and(|id| creating.contains(&id)) {
                continue;
            }
            self.handle_orphan(instance, &mut report).await;
        }

        if report.has_findings() {
            tracing::info!(
                checked = report.checked,
                missing = report.missing.len(),
                exited = report.exited.len(),
                orphans = report.orphans.len(),
                adopted = report.adopted.len(),
                removed_orphans = report.removed_orphans.len(),
                "reconcile pass completed"
            );
        } else {
            tracing::debug!(checked = report.checked, "reconcile pass completed, no drift");
        }
        Ok(report)
    }

    async fn handle_orphan(&self, instance: &InstanceSummary, report: &mut ReconcileReport) {
        let backend_ref = &instance.backend_ref;
        match self.inner.config.orphan_policy {
            OrphanPolicy::Flag => {
                tracing::warn!(%backend_ref, "orphaned instance found");
                report.orphans.push(backend_ref.clone());
            }
            OrphanPolicy::Remove => {
                match self
                    .inner
                    .config
                    .retry
                    .run("remove", || self.inner.backend.remove(backend_ref))
                    .await
                {
                    Ok(()) => {
                        tracing::info!(%backend_ref, "orphaned instance removed");
                        report.removed_orphans.push(backend_ref.clone());
                    }
                    Err(e) => {
                        tracing::warn!(%backend_ref, error = %e, "could not remove orphaned instance");
                        report.orphans.push(backend_ref.clone());
                    }
                }
            }
            OrphanPolicy::Adopt => match self.adopt(instance).await {
                Ok(id) => {
                    tracing::info!(room_id = %id, %backend_ref, "orphaned instance adopted");
                    report.adopted.push(id);
                }
                Err(e) => {
                    tracing::warn!(%backend_ref, error = %e, "cannot adopt orphaned instance, flagging");
                    report.orphans.push(backend_ref.clone());
                }
            },
        }
    }

    /// Rebuilds a room record from an instance's labels.
    async fn adopt(&self, instance: &InstanceSummary) -> Result<RoomId, RoomError> {
        let label = |key: &str| {
            instance.labels.get(key).ok_or_else(|| {
                RoomError::Invalid(format!(
                    "instance {} has no {key} label",
                    instance.backend_ref
                ))
            })
        };
        let id: RoomId = label(labels::ROOM_ID)?.parse()?;
        let name = label(labels::ROOM_NAME)?.clone();
        validate_room_name(&name)?;
        let template = label(labels::TEMPLATE)?.clone();
        let ports = label(labels::PORTS)?
            .split(',')
            .map(|p| p.trim().parse::<u16>())
            .collect::<Result<BTreeSet<u16>, _>>()
            .map_err(|e| RoomError::Invalid(format!("bad ports label: {e}")))?;

        let status = self
            .inner
            .config
            .retry
            .run("inspect", || self.inner.backend.inspect(&instance.backend_ref))
            .await?;

        let mut room = Room::new(id, name, template);
        room.backend_ref = Some(instance.backend_ref.clone());
        room.allocated_ports = ports.clone();
        match status {
            InstanceStatus {
                running: true,
                endpoint: Some(endpoint),
            } => room.transition(RoomStatus::Running, Some(endpoint))?,
            // Observed state, not a lifecycle step: there is no edge
            // from `Creating` to `Stopped`.
            _ => room.status = RoomStatus::Stopped,
        }

        let reservation = self.inner.allocator.claim(&ports)?;
        if let Err(e) = self.inner.registry.insert(room, Some(reservation.clone())) {
            self.release_ports(id, &reservation);
            return Err(e);
        }
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Background worker running [`RoomManager::reconcile`] on a fixed
/// interval until shut down.
pub struct Reconciler {
    manager: RoomManager,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Uses the manager's `reconcile_interval`.
    pub fn new(manager: RoomManager) -> Self {
        let interval = manager.config().reconcile_interval;
        Self {
            manager,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Handle that stops [`run`](Self::run) when notified.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Runs passes until shutdown. The first pass runs immediately.
    pub async fn run(&self) {
        let period = self.interval.max(Duration::from_millis(1));
        tracing::info!(interval_ms = period.as_millis() as u64, "reconciler started");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    tracing::info!("reconciler received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.manager.reconcile().await {
                        tracing::error!(error = %e, "reconcile pass failed");
                    }
                }
            }
        }
        tracing::info!("reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use roomforge_backend::{BackendError, MockBackend, RetryPolicy};
    use roomforge_protocol::CreateRoomRequest;

    use super::*;
    use crate::{ManagerConfig, TemplateCatalog};

    const TEMPLATES: &str = r#"[
        { "name": "browser", "image": "example/browser:1", "ports": [ { "container_port": 8080 } ] }
    ]"#;

    fn setup(retry: RetryPolicy) -> (RoomManager, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let config = ManagerConfig {
            port_range: 41000..=41003,
            readiness_timeout: Duration::from_millis(500),
            readiness_poll_interval: Duration::from_millis(5),
            retry,
            ..ManagerConfig::default()
        };
        let catalog = TemplateCatalog::from_json(TEMPLATES).unwrap();
        (RoomManager::new(config, backend.clone(), catalog), backend)
    }

    #[tokio::test]
    async fn test_room_removed_during_list_leaves_no_lock_entry() {
        let (mgr, backend) = setup(RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(100),
        });
        let room = mgr
            .create_room(CreateRoomRequest::new("alice", "browser"))
            .await
            .unwrap();

        // The first list times out, so the pass sits in backoff holding
        // a snapshot that still contains the room.
        backend.fail_next_list(BackendError::Timeout("slow daemon".into()));
        let pass = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.reconcile().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        mgr.remove_room(room.id).await.unwrap();
        assert_eq!(mgr.inner.locks.len(), 0);

        let report = pass.await.unwrap().unwrap();
        assert_eq!(backend.calls().list, 2);
        assert!(report.missing.is_empty());
        assert!(mgr.list_rooms().is_empty());
        assert_eq!(mgr.inner.locks.len(), 0);
    }

    #[test]
    fn test_busy_rooms_are_not_findings() {
        let report = ReconcileReport {
            checked: 3,
            busy: vec![RoomId::new()],
            ..ReconcileReport::default()
        };
        assert!(!report.has_findings());
    }
}
