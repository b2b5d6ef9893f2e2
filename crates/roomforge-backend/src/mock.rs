//! In-memory backend for tests.
//!
//! Simulates instances without touching a real engine. Failures can be
//! queued per operation, instances can be made to vanish or crash
//! behind the manager's back, and every call is counted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use roomforge_protocol::{BackendRef, Endpoint};

use crate::{Backend, BackendError, InstanceSpec, InstanceStatus, InstanceSummary};

/// Per-operation call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub create: u32,
    pub start: u32,
    pub stop: u32,
    pub remove: u32,
    pub inspect: u32,
    pub list: u32,
}

#[derive(Debug, Clone)]
struct MockInstance {
    spec: InstanceSpec,
    running: bool,
}

#[derive(Debug, Default)]
struct MockState {
    instances: HashMap<BackendRef, MockInstance>,
    next_id: u64,
    create_failures: VecDeque<BackendError>,
    lost_create_replies: VecDeque<BackendError>,
    start_failures: VecDeque<BackendError>,
    stop_failures: VecDeque<BackendError>,
    remove_failures: VecDeque<BackendError>,
    list_failures: VecDeque<BackendError>,
    never_ready: bool,
    latency: Duration,
    calls: MockCalls,
}

/// In-memory [`Backend`] with failure injection.
pub struct MockBackend {
    endpoint_host: String,
    state: Mutex<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Creates an empty mock whose endpoints point at `127.0.0.1`.
    pub fn new() -> Self {
        Self::with_endpoint_host("127.0.0.1")
    }

    /// Creates an empty mock reporting endpoints on `host`.
    pub fn with_endpoint_host(host: impl Into<String>) -> Self {
        Self {
            endpoint_host: host.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues an error for the next `create_instance` call.
    pub fn fail_next_create(&self, err: BackendError) {
        self.state().create_failures.push_back(err);
    }

    /// Makes the next `create_instance` provision the instance and then
    /// report `err`, as an engine that timed out after doing the work.
    pub fn lose_next_create_reply(&self, err: BackendError) {
        self.state().lost_create_replies.push_back(err);
    }

    /// Queues an error for the next `start` call.
    pub fn fail_next_start(&self, err: BackendError) {
        self.state().start_failures.push_back(err);
    }

    /// Queues an error for the next `stop` call.
    pub fn fail_next_stop(&self, err: BackendError) {
        self.state().stop_failures.push_back(err);
    }

    /// Queues an error for the next `remove` call.
    pub fn fail_next_remove(&self, err: BackendError) {
        self.state().remove_failures.push_back(err);
    }

    /// Queues an error for the next `list` call.
    pub fn fail_next_list(&self, err: BackendError) {
        self.state().list_failures.push_back(err);
    }

    /// When set, `start` succeeds but instances never report running.
    pub fn set_never_ready(&self, never_ready: bool) {
        self.state().never_ready = never_ready;
    }

    /// Adds a delay to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Deletes an instance out-of-band, as an operator would.
    pub fn vanish(&self, backend_ref: &BackendRef) -> bool {
        self.state().instances.remove(backend_ref).is_some()
    }

    /// Marks an instance as exited without removing it.
    pub fn crash(&self, backend_ref: &BackendRef) -> bool {
        match self.state().instances.get_mut(backend_ref) {
            Some(instance) => {
                instance.running = false;
                true
            }
            None => false,
        }
    }

    /// Inserts an instance the manager did not create (e.g. one that
    /// survived a manager restart).
    pub fn insert_external(&self, spec: InstanceSpec, running: bool) -> BackendRef {
        let mut state = self.state();
        let backend_ref = next_ref(&mut state);
        state
            .instances
            .insert(backend_ref.clone(), MockInstance { spec, running });
        backend_ref
    }

    /// Number of instances currently held.
    pub fn instance_count(&self) -> usize {
        self.state().instances.len()
    }

    /// Returns `true` if the instance exists.
    pub fn contains(&self, backend_ref: &BackendRef) -> bool {
        self.state().instances.contains_key(backend_ref)
    }

    /// Returns `true` if the instance exists and runs.
    pub fn is_running(&self, backend_ref: &BackendRef) -> bool {
        self.state()
            .instances
            .get(backend_ref)
            .is_some_and(|i| i.running)
    }

    /// Returns the `InstanceSpec` an instance was created with.
    pub fn spec_of(&self, backend_ref: &BackendRef) -> Option<InstanceSpec> {
        self.state().instances.get(backend_ref).map(|i| i.spec.clone())
    }

    /// Returns a copy of the call counters.
    pub fn calls(&self) -> MockCalls {
        self.state().calls
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn endpoint_for(&self, spec: &InstanceSpec) -> Option<Endpoint> {
        spec.ports
            .first()
            .map(|b| Endpoint::new(self.endpoint_host.clone(), b.host_port))
    }
}

fn next_ref(state: &mut MockState) -> BackendRef {
    state.next_id += 1;
    BackendRef::new(format!("mock-{}", state.next_id))
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<BackendRef, BackendError> {
        self.delay().await;
        let mut state = self.state();
        state.calls.create += 1;
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }
        if state.instances.values().any(|i| i.spec.name == spec.name) {
            return Err(BackendError::Conflict(format!(
                "instance name {} already in use",
                spec.name
            )));
        }
        let backend_ref = next_ref(&mut state);
        state.instances.insert(
            backend_ref.clone(),
            MockInstance {
                spec: spec.clone(),
                running: false,
            },
        );
        if let Some(err) = state.lost_create_replies.pop_front() {
            return Err(err);
        }
        Ok(backend_ref)
    }

    async fn start(&self, backend_ref: &BackendRef) -> Result<(), BackendError> {
        self.delay().await;
        let mut state = self.state();
        state.calls.start += 1;
        if let Some(err) = state.start_failures.pop_front() {
            return Err(err);
        }
        let never_ready = state.never_ready;
        let instance = state
            .instances
            .get_mut(backend_ref)
            .ok_or_else(|| BackendError::NotFound(backend_ref.to_string()))?;
        instance.running = !never_ready;
        Ok(())
    }

    async fn stop(&self, backend_ref: &BackendRef) -> Result<(), BackendError> {
        self.delay().await;
        let mut state = self.state();
        state.calls.stop += 1;
        if let Some(err) = state.stop_failures.pop_front() {
            return Err(err);
        }
        let instance = state
            .instances
            .get_mut(backend_ref)
            .ok_or_else(|| BackendError::NotFound(backend_ref.to_string()))?;
        instance.running = false;
        Ok(())
    }

    async fn remove(&self, backend_ref: &BackendRef) -> Result<(), BackendError> {
        self.delay().await;
        let mut state = self.state();
        state.calls.remove += 1;
        if let Some(err) = state.remove_failures.pop_front() {
            return Err(err);
        }
        state.instances.remove(backend_ref);
        Ok(())
    }

    async fn inspect(&self, backend_ref: &BackendRef) -> Result<InstanceStatus, BackendError> {
        self.delay().await;
        let mut state = self.state();
        state.calls.inspect += 1;
        let instance = state
            .instances
            .get(backend_ref)
            .ok_or_else(|| BackendError::NotFound(backend_ref.to_string()))?;
        let endpoint = if instance.running {
            self.endpoint_for(&instance.spec)
        } else {
            None
        };
        Ok(InstanceStatus {
            running: instance.running,
            endpoint,
        })
    }

    async fn list(&self) -> Result<Vec<InstanceSummary>, BackendError> {
        self.delay().await;
        let mut state = self.state();
        state.calls.list += 1;
        if let Some(err) = state.list_failures.pop_front() {
            return Err(err);
        }
        let mut out: Vec<InstanceSummary> = state
            .instances
            .iter()
            .map(|(backend_ref, i)| InstanceSummary {
                backend_ref: backend_ref.clone(),
                running: i.running,
                labels: i.spec.labels.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.backend_ref.cmp(&b.backend_ref));
        Ok(out)
    }
}
