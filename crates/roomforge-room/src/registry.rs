//! Room registry and the route table derived from it.
//!
//! The registry is the single source of truth for which rooms exist.
//! Every write republishes a [`RouteTable`] through a `watch` channel,
//! so readers such as the gateway always see the latest state without
//! touching the registry lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use roomforge_protocol::{Endpoint, Room, RoomId, RoomStatus};
use tokio::sync::watch;

use crate::allocator::PortReservation;
use crate::RoomError;

// ---------------------------------------------------------------------------
// RouteTable
// ---------------------------------------------------------------------------

/// Where traffic for one room goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The room is running at this endpoint.
    Ready(Endpoint),
    /// The room exists but cannot take traffic right now.
    Unavailable(RoomStatus),
}

/// Result of a route lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub room_id: RoomId,
    pub route: Route,
}

/// Immutable routing view of the registry.
///
/// Rooms in `Removing` are left out entirely.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    by_id: HashMap<RoomId, Route>,
    by_name: HashMap<String, RoomId>,
}

impl RouteTable {
    fn build<'a>(rooms: impl Iterator<Item = &'a Room>) -> Self {
        let mut table = Self::default();
        for room in rooms {
            let route = match (room.status, &room.endpoint) {
                (RoomStatus::Removing, _) => continue,
                (RoomStatus::Running, Some(endpoint)) => Route::Ready(endpoint.clone()),
                (status, _) => Route::Unavailable(status),
            };
            table.by_id.insert(room.id, route);
            table.by_name.insert(room.name.clone(), room.id);
        }
        table
    }

    /// Resolves a room id or room name.
    pub fn lookup(&self, key: &str) -> Option<RouteTarget> {
        let room_id = match key.parse::<RoomId>() {
            Ok(id) if self.by_id.contains_key(&id) => id,
            _ => *self.by_name.get(key)?,
        };
        self.by_id.get(&room_id).map(|route| RouteTarget {
            room_id,
            route: route.clone(),
        })
    }

    /// Number of routable rooms (running or not).
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Number of rooms that can take traffic.
    pub fn ready_count(&self) -> usize {
        self.by_id
            .values()
            .filter(|r| matches!(r, Route::Ready(_)))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A room record plus the port reservation it owns.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) room: Room,
    pub(crate) reservation: Option<PortReservation>,
}

#[derive(Debug, Default)]
struct RegistryState {
    rooms: HashMap<RoomId, Entry>,
    names: HashMap<String, RoomId>,
}

#[derive(Debug)]
pub(crate) struct Registry {
    state: Mutex<RegistryState>,
    routes: watch::Sender<Arc<RouteTable>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        let (routes, _) = watch::channel(Arc::new(RouteTable::default()));
        Self {
            state: Mutex::new(RegistryState::default()),
            routes,
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &RegistryState) {
        let table = RouteTable::build(state.rooms.values().map(|e| &e.room));
        self.routes.send_replace(Arc::new(table));
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<RouteTable>> {
        self.routes.subscribe()
    }

    /// Inserts a new room, enforcing name uniqueness.
    pub(crate) fn insert(
        &self,
        room: Room,
        reservation: Option<PortReservation>,
    ) -> Result<(), RoomError> {
        let mut state = self.state();
        if state.names.contains_key(&room.name) {
            return Err(RoomError::Conflict(format!(
                "room name {} is already in use",
                room.name
            )));
        }
        if state.rooms.contains_key(&room.id) {
            return Err(RoomError::Conflict(format!("room id {} already exists", room.id)));
        }
        state.names.insert(room.name.clone(), room.id);
        state.rooms.insert(room.id, Entry { room, reservation });
        self.publish(&state);
        Ok(())
    }

    pub(crate) fn get(&self, id: RoomId) -> Option<Room> {
        self.state().rooms.get(&id).map(|e| e.room.clone())
    }

    pub(crate) fn contains(&self, id: RoomId) -> bool {
        self.state().rooms.contains_key(&id)
    }

    /// All rooms ordered by creation time, ties broken by id.
    pub(crate) fn list(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.state().rooms.values().map(|e| e.room.clone()).collect();
        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rooms
    }

    /// Mutates one entry in place and republishes routes.
    ///
    /// Returns `None` if the room does not exist.
    pub(crate) fn update<R>(&self, id: RoomId, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        let mut state = self.state();
        let result = f(state.rooms.get_mut(&id)?);
        self.publish(&state);
        Some(result)
    }

    /// Deletes a room and frees its name.
    pub(crate) fn remove(&self, id: RoomId) -> Option<Entry> {
        let mut state = self.state();
        let entry = state.rooms.remove(&id)?;
        state.names.remove(&entry.room.name);
        self.publish(&state);
        Some(entry)
    }
}
