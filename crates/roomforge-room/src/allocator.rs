//! Host port allocator.
//!
//! Owns the global port namespace. Ports are handed out in
//! [`PortReservation`]s; a reservation is released as a whole, exactly
//! once.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Errors from the port allocator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("requested {requested} ports but only {available} are free")]
    Exhausted { requested: usize, available: usize },

    /// A claimed port is reserved already or lies outside the range.
    #[error("port {0} is not available")]
    Conflict(u16),

    #[error("reservation {0} was already released")]
    AlreadyReleased(u64),
}

/// A set of ports held together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortReservation {
    id: u64,
    ports: BTreeSet<u16>,
}

impl PortReservation {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Reserved ports in ascending order.
    pub fn ports(&self) -> &BTreeSet<u16> {
        &self.ports
    }
}

#[derive(Debug, Default)]
struct AllocState {
    /// Reserved port -> reservation id.
    taken: BTreeMap<u16, u64>,
    /// Reservations not yet released.
    live: HashSet<u64>,
    next_id: u64,
}

/// Hands out non-overlapping host ports from an inclusive range.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    state: Mutex<AllocState>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            state: Mutex::new(AllocState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, AllocState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn capacity(&self) -> usize {
        if self.range.is_empty() {
            0
        } else {
            usize::from(*self.range.end() - *self.range.start()) + 1
        }
    }

    /// Reserves the `count` lowest free ports.
    pub fn reserve(&self, count: usize) -> Result<PortReservation, AllocError> {
        let mut state = self.state();
        let free: Vec<u16> = self
            .range
            .clone()
            .filter(|p| !state.taken.contains_key(p))
            .take(count)
            .collect();
        if free.len() < count {
            let available = self.capacity() - state.taken.len();
            return Err(AllocError::Exhausted {
                requested: count,
                available,
            });
        }
        Ok(commit(&mut state, free.into_iter().collect()))
    }

    /// Reserves exactly `ports`, all or nothing.
    pub fn claim(&self, ports: &BTreeSet<u16>) -> Result<PortReservation, AllocError> {
        let mut state = self.state();
        if let Some(&port) = ports
            .iter()
            .find(|p| !self.range.contains(p) || state.taken.contains_key(p))
        {
            return Err(AllocError::Conflict(port));
        }
        Ok(commit(&mut state, ports.clone()))
    }

    /// Returns the reservation's ports to the pool.
    ///
    /// Releasing the same reservation twice is rejected and logged; it
    /// means two owners believed they held the same ports.
    pub fn release(&self, reservation: &PortReservation) -> Result<(), AllocError> {
        let mut state = self.state();
        if !state.live.remove(&reservation.id) {
            tracing::error!(
                reservation = reservation.id,
                ports = ?reservation.ports,
                "port reservation released twice"
            );
            return Err(AllocError::AlreadyReleased(reservation.id));
        }
        for port in &reservation.ports {
            state.taken.remove(port);
        }
        Ok(())
    }

    /// Number of free ports.
    pub fn available(&self) -> usize {
        self.capacity() - self.state().taken.len()
    }

    /// Returns `true` if `port` is currently reserved.
    pub fn is_reserved(&self, port: u16) -> bool {
        self.state().taken.contains_key(&port)
    }
}

fn commit(state: &mut AllocState, ports: BTreeSet<u16>) -> PortReservation {
    state.next_id += 1;
    let id = state.next_id;
    for &port in &ports {
        state.taken.insert(port, id);
    }
    state.live.insert(id);
    PortReservation { id, ports }
}
