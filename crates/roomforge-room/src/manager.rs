//! Room manager: drives the room lifecycle over the registry, the port
//! allocator, the template catalog and the backend.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use roomforge_backend::{Backend, BackendError, InstanceSpec, InstanceStatus, PortBinding, labels};
use roomforge_protocol::{
    BackendRef, CreateRoomRequest, Endpoint, ResourceLimits, Room, RoomId, RoomStatus, Template,
    validate_room_name,
};
use tokio::sync::watch;

use crate::allocator::{PortAllocator, PortReservation};
use crate::locks::{LockTable, RoomGuard};
use crate::registry::{Registry, RouteTable};
use crate::{ManagerConfig, RoomError, TemplateCatalog};

pub(crate) struct Inner {
    pub(crate) config: ManagerConfig,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) catalog: TemplateCatalog,
    pub(crate) allocator: PortAllocator,
    pub(crate) registry: Registry,
    pub(crate) locks: LockTable,
    pub(crate) reconciling: AtomicBool,
}

/// Orchestrates room lifecycles.
///
/// Cheap to clone; clones share the same registry. Operations on the
/// same room id are serialized, operations on different rooms run
/// concurrently. Backend calls never run under the registry or
/// allocator locks.
#[derive(Clone)]
pub struct RoomManager {
    pub(crate) inner: Arc<Inner>,
}

impl RoomManager {
    pub fn new(config: ManagerConfig, backend: Arc<dyn Backend>, catalog: TemplateCatalog) -> Self {
        let allocator = PortAllocator::new(config.port_range.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                catalog,
                allocator,
                registry: Registry::new(),
                locks: LockTable::default(),
                reconciling: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Name of the backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    // ---- Lifecycle ----

    /// Creates a room and waits until it is running.
    ///
    /// Fails without registering anything for a bad request, an unknown
    /// template or a taken name. If ports run out the room is removed
    /// again. A backend failure or readiness timeout rolls back the
    /// instance and the ports and leaves the room in `Error`.
    pub async fn create_room(&self, request: CreateRoomRequest) -> Result<Room, RoomError> {
        let CreateRoomRequest {
            name,
            template: template_name,
            overrides,
        } = request;
        validate_room_name(&name)?;
        let template = self
            .inner
            .catalog
            .get(&template_name)
            .ok_or(RoomError::TemplateNotFound(template_name))?;
        let env = resolve_env(&template, &overrides.env)?;
        let resources = template.resources.merged(&overrides.resources);
        if resources.cpus.is_some_and(|c| c <= 0.0) {
            return Err(RoomError::Invalid("cpus must be positive".into()));
        }

        let id = RoomId::new();
        let guard = self.inner.locks.lock(id).await;
        let mut room = Room::new(id, &name, &template.name);
        room.env = env.clone();
        if let Err(e) = self.inner.registry.insert(room, None) {
            drop(guard);
            self.inner.locks.forget(id);
            return Err(e);
        }

        let reservation = match self.inner.allocator.reserve(template.port_count()) {
            Ok(reservation) => reservation,
            Err(e) => {
                tracing::warn!(room_id = %id, name = %name, error = %e, "no ports for room");
                self.inner.registry.remove(id);
                drop(guard);
                self.inner.locks.forget(id);
                return Err(e.into());
            }
        };
        let ports = reservation.ports().clone();
        self.inner.registry.update(id, |e| {
            e.room.allocated_ports = ports.clone();
            e.reservation = Some(reservation);
        });
        tracing::info!(room_id = %id, name = %name, template = %template.name, ?ports, "room creating");

        let spec = self.instance_spec(id, &name, &template, env, resources, &ports);
        let backend_ref = match self.provision(id, &spec).await {
            Ok(backend_ref) => backend_ref,
            Err(e) => {
                if matches!(e, BackendError::Timeout(_)) {
                    if let Err(sweep) = self.remove_leftovers(id).await {
                        tracing::warn!(room_id = %id, error = %sweep, "could not sweep timed-out create");
                    }
                }
                return Err(self.rollback_create(id, None, e.into()).await);
            }
        };
        self.inner
            .registry
            .update(id, |e| e.room.backend_ref = Some(backend_ref.clone()));

        let retry = &self.inner.config.retry;
        if let Err(e) = retry
            .run("start", || self.inner.backend.start(&backend_ref))
            .await
        {
            return Err(self.rollback_create(id, Some(backend_ref), e.into()).await);
        }
        match self.wait_ready(&backend_ref).await {
            Ok(endpoint) => self.transition(id, RoomStatus::Running, Some(endpoint)),
            Err(e) => Err(self.rollback_create(id, Some(backend_ref), e).await),
        }
    }

    /// Stops a running room. Stopping a stopped room returns it unchanged.
    pub async fn stop_room(&self, id: RoomId) -> Result<Room, RoomError> {
        let _guard = self.lock_room(id).await?;
        self.stop_locked(id).await
    }

    /// Starts a stopped room. Starting a running room returns it unchanged.
    pub async fn start_room(&self, id: RoomId) -> Result<Room, RoomError> {
        let _guard = self.lock_room(id).await?;
        self.start_locked(id).await
    }

    /// Stops (if running) and starts a room under one lock acquisition.
    pub async fn restart_room(&self, id: RoomId) -> Result<Room, RoomError> {
        let _guard = self.lock_room(id).await?;
        self.stop_locked(id).await?;
        self.start_locked(id).await
    }

    /// Removes a room, stopping it first if it runs.
    ///
    /// The registry entry is deleted only after the instance is gone and
    /// the ports are released. If the engine refuses, the room moves to
    /// `Error`, keeps its resources, and the call may be retried.
    pub async fn remove_room(&self, id: RoomId) -> Result<(), RoomError> {
        let guard = self.lock_room(id).await?;
        let room = self.room(id)?;
        match room.status {
            RoomStatus::Running => {
                self.stop_locked(id).await?;
            }
            status if status.is_removable() => {}
            other => {
                return Err(RoomError::InvalidState(format!(
                    "cannot remove room {id} in state {other}"
                )));
            }
        }

        let room = self.transition(id, RoomStatus::Removing, None)?;
        if let Some(backend_ref) = &room.backend_ref {
            if let Err(e) = self
                .inner
                .config
                .retry
                .run("remove", || self.inner.backend.remove(backend_ref))
                .await
            {
                return Err(self.fail_room(id, e.into()));
            }
        }

        let reservation = self
            .inner
            .registry
            .update(id, |e| {
                e.room.backend_ref = None;
                e.room.allocated_ports.clear();
                e.reservation.take()
            })
            .flatten();
        if let Some(reservation) = reservation {
            self.release_ports(id, &reservation);
        }
        self.inner.registry.remove(id);
        drop(guard);
        self.inner.locks.forget(id);
        tracing::info!(room_id = %id, name = %room.name, "room removed");
        Ok(())
    }

    // ---- Queries ----

    pub fn get_room(&self, id: RoomId) -> Result<Room, RoomError> {
        self.room(id)
    }

    /// All rooms, oldest first.
    pub fn list_rooms(&self) -> Vec<Room> {
        self.inner.registry.list()
    }

    /// Live routing view, updated on every registry write.
    pub fn routes(&self) -> watch::Receiver<Arc<RouteTable>> {
        self.inner.registry.subscribe()
    }

    /// Templates rooms can be created from, ordered by name.
    pub fn templates(&self) -> Vec<Arc<Template>> {
        self.inner.catalog.list()
    }

    pub fn template(&self, name: &str) -> Option<Arc<Template>> {
        self.inner.catalog.get(name)
    }

    /// Host ports still free for new rooms.
    pub fn available_ports(&self) -> usize {
        self.inner.allocator.available()
    }

    /// Returns `true` if `port` is held by some room.
    pub fn is_port_reserved(&self, port: u16) -> bool {
        self.inner.allocator.is_reserved(port)
    }

    // ---- Internals ----

    fn room(&self, id: RoomId) -> Result<Room, RoomError> {
        self.inner.registry.get(id).ok_or_else(|| not_found(id))
    }

    /// Takes the room's lock, failing fast for unknown ids so the lock
    /// table never grows for rooms that do not exist.
    async fn lock_room(&self, id: RoomId) -> Result<RoomGuard, RoomError> {
        if !self.inner.registry.contains(id) {
            return Err(not_found(id));
        }
        let guard = self.inner.locks.lock(id).await;
        if !self.inner.registry.contains(id) {
            drop(guard);
            self.inner.locks.forget(id);
            return Err(not_found(id));
        }
        Ok(guard)
    }

    pub(crate) fn transition(
        &self,
        id: RoomId,
        target: RoomStatus,
        endpoint: Option<Endpoint>,
    ) -> Result<Room, RoomError> {
        let updated = self.inner.registry.update(id, |e| -> Result<Room, RoomError> {
            e.room.transition(target, endpoint)?;
            Ok(e.room.clone())
        });
        let room = updated.ok_or_else(|| not_found(id))??;
        tracing::info!(room_id = %id, name = %room.name, status = %target, "room transitioned");
        Ok(room)
    }

    /// Moves a room to `Error` with `reason`.
    pub(crate) fn mark_failed(&self, id: RoomId, reason: &str) {
        let result = self.inner.registry.update(id, |e| e.room.fail(reason));
        match result {
            Some(Ok(())) => {
                tracing::warn!(room_id = %id, reason, "room failed");
            }
            Some(Err(e)) => {
                tracing::warn!(room_id = %id, error = %e, "could not mark room failed");
            }
            None => {}
        }
    }

    fn fail_room(&self, id: RoomId, err: RoomError) -> RoomError {
        self.mark_failed(id, &err.to_string());
        err
    }

    pub(crate) fn release_ports(&self, id: RoomId, reservation: &PortReservation) {
        if let Err(e) = self.inner.allocator.release(reservation) {
            tracing::error!(room_id = %id, error = %e, "port release failed");
        }
    }

    /// Undoes a partial create and leaves the room in `Error`.
    ///
    /// If the instance cannot be removed, the room keeps its backend ref
    /// and ports so a later `remove_room` can finish the job.
    async fn rollback_create(
        &self,
        id: RoomId,
        backend_ref: Option<BackendRef>,
        err: RoomError,
    ) -> RoomError {
        tracing::warn!(room_id = %id, error = %err, "room creation failed, rolling back");
        let cleaned = match &backend_ref {
            None => true,
            Some(backend_ref) => match self
                .inner
                .config
                .retry
                .run("remove", || self.inner.backend.remove(backend_ref))
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(
                        room_id = %id,
                        %backend_ref,
                        error = %e,
                        "rollback could not remove instance, room keeps its resources"
                    );
                    false
                }
            },
        };
        if cleaned {
            let reservation = self
                .inner
                .registry
                .update(id, |e| {
                    e.room.backend_ref = None;
                    e.room.allocated_ports.clear();
                    e.reservation.take()
                })
                .flatten();
            if let Some(reservation) = reservation {
                self.release_ports(id, &reservation);
            }
        }
        self.fail_room(id, err)
    }

    /// Creates the instance, retrying transient failures.
    ///
    /// A timed-out create may still have provisioned the instance, so
    /// before the next attempt any instance labelled with this room's id
    /// is removed.
    async fn provision(&self, id: RoomId, spec: &InstanceSpec) -> Result<BackendRef, BackendError> {
        let timed_out = &AtomicBool::new(false);
        self.inner
            .config
            .retry
            .run("create", || async move {
                if timed_out.load(Ordering::Acquire) {
                    self.remove_leftovers(id).await?;
                    timed_out.store(false, Ordering::Release);
                }
                let result = self.inner.backend.create_instance(spec).await;
                if matches!(result, Err(BackendError::Timeout(_))) {
                    timed_out.store(true, Ordering::Release);
                }
                result
            })
            .await
    }

    async fn remove_leftovers(&self, id: RoomId) -> Result<(), BackendError> {
        let owner = id.to_string();
        for instance in self.inner.backend.list().await? {
            if instance.labels.get(labels::ROOM_ID) == Some(&owner) {
                tracing::info!(
                    room_id = %id,
                    backend_ref = %instance.backend_ref,
                    "removing instance left by a timed-out create"
                );
                self.inner.backend.remove(&instance.backend_ref).await?;
            }
        }
        Ok(())
    }

    /// Polls `inspect` until the instance runs and reports an endpoint.
    async fn wait_ready(&self, backend_ref: &BackendRef) -> Result<Endpoint, RoomError> {
        let config = &self.inner.config;
        let poll = async {
            loop {
                match config
                    .retry
                    .run("inspect", || self.inner.backend.inspect(backend_ref))
                    .await
                {
                    Ok(InstanceStatus {
                        running: true,
                        endpoint: Some(endpoint),
                    }) => return Ok(endpoint),
                    Ok(_) => {}
                    Err(e) => return Err(RoomError::from(e)),
                }
                tokio::time::sleep(config.readiness_poll_interval).await;
            }
        };
        tokio::time::timeout(config.readiness_timeout, poll)
            .await
            .map_err(|_| {
                RoomError::Timeout(format!(
                    "instance {backend_ref} not ready within {:?}",
                    config.readiness_timeout
                ))
            })?
    }

    async fn stop_locked(&self, id: RoomId) -> Result<Room, RoomError> {
        let room = self.room(id)?;
        match room.status {
            RoomStatus::Stopped => return Ok(room),
            RoomStatus::Running => {}
            other if other.is_transient() => {
                return Err(RoomError::InvalidState(format!(
                    "room {id} is busy ({other})"
                )));
            }
            other => {
                return Err(RoomError::InvalidState(format!(
                    "cannot stop room {id} in state {other}"
                )));
            }
        }

        self.transition(id, RoomStatus::Stopping, None)?;
        if let Some(backend_ref) = &room.backend_ref {
            if let Err(e) = self
                .inner
                .config
                .retry
                .run("stop", || self.inner.backend.stop(backend_ref))
                .await
            {
                return Err(self.fail_room(id, e.into()));
            }
        }
        self.transition(id, RoomStatus::Stopped, None)
    }

    async fn start_locked(&self, id: RoomId) -> Result<Room, RoomError> {
        let room = self.room(id)?;
        match room.status {
            RoomStatus::Running => return Ok(room),
            RoomStatus::Stopped => {}
            other => {
                return Err(RoomError::InvalidState(format!(
                    "cannot start room {id} in state {other}"
                )));
            }
        }
        let Some(backend_ref) = room.backend_ref else {
            return Err(RoomError::InvalidState(format!(
                "room {id} has no backend instance"
            )));
        };

        if let Err(e) = self
            .inner
            .config
            .retry
            .run("start", || self.inner.backend.start(&backend_ref))
            .await
        {
            return Err(self.fail_room(id, e.into()));
        }
        match self.wait_ready(&backend_ref).await {
            Ok(endpoint) => self.transition(id, RoomStatus::Running, Some(endpoint)),
            Err(e) => Err(self.fail_room(id, e)),
        }
    }

    fn instance_spec(
        &self,
        id: RoomId,
        name: &str,
        template: &Template,
        env: BTreeMap<String, String>,
        resources: ResourceLimits,
        ports: &BTreeSet<u16>,
    ) -> InstanceSpec {
        let bindings = ports
            .iter()
            .zip(&template.ports)
            .map(|(&host_port, exposed)| PortBinding {
                host_port,
                container_port: exposed.container_port,
                protocol: exposed.protocol,
            })
            .collect();
        let port_list = ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let labels = BTreeMap::from([
            (labels::MANAGED.to_string(), "true".to_string()),
            (labels::ROOM_ID.to_string(), id.to_string()),
            (labels::ROOM_NAME.to_string(), name.to_string()),
            (labels::TEMPLATE.to_string(), template.name.clone()),
            (labels::PORTS.to_string(), port_list),
        ]);
        InstanceSpec {
            name: format!("{}{name}", self.inner.config.instance_prefix),
            image: template.image.clone(),
            env,
            resources,
            ports: bindings,
            labels,
        }
    }
}

fn not_found(id: RoomId) -> RoomError {
    RoomError::NotFound(id.to_string())
}

/// Merges template defaults with caller overrides.
///
/// Only variables the template declares may be overridden; required
/// variables must end up with a value.
fn resolve_env(
    template: &Template,
    overrides: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, RoomError> {
    if let Some(unknown) = overrides.keys().find(|k| template.env_var(k).is_none()) {
        return Err(RoomError::Invalid(format!(
            "template {} does not accept environment variable {unknown}",
            template.name
        )));
    }
    let mut env = BTreeMap::new();
    for var in &template.env {
        match overrides.get(&var.name).or(var.default.as_ref()) {
            Some(value) => {
                env.insert(var.name.clone(), value.clone());
            }
            None if var.required => {
                return Err(RoomError::Invalid(format!(
                    "missing required environment variable {}",
                    var.name
                )));
            }
            None => {}
        }
    }
    Ok(env)
}
