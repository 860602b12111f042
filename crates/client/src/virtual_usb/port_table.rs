//! Virtual root hub port table
//!
//! Fixed number of ports, numbered from 1. A port is claimed before any
//! network I/O, bound to its session once the session exists, and released
//! when the session ends. The table only keeps weak references to sessions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

enum Slot<T> {
    Free,
    /// Claimed, session not bound yet
    Reserved,
    Bound(Weak<T>),
}

/// Port slots of the virtual controller
pub struct PortTable<T> {
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T> PortTable<T> {
    /// Table with `capacity` ports, numbered `1..=capacity`
    pub fn new(capacity: u16) -> Self {
        let slots = (0..capacity).map(|_| Slot::Free).collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn index(port: u16) -> Option<usize> {
        (port as usize).checked_sub(1)
    }

    pub fn capacity(&self) -> u16 {
        self.lock().len() as u16
    }

    pub fn free_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|s| matches!(s, Slot::Free))
            .count()
    }

    /// Claim the lowest free port
    ///
    /// The port is released again when the guard drops, unless it was
    /// [kept](PortGuard::keep).
    pub fn claim(self: &Arc<Self>) -> Option<PortGuard<T>> {
        let mut slots = self.lock();
        let index = slots.iter().position(|s| matches!(s, Slot::Free))?;
        slots[index] = Slot::Reserved;
        let port = index as u16 + 1;
        debug!("Claimed port {}", port);

        Some(PortGuard {
            table: Arc::clone(self),
            port,
            armed: true,
        })
    }

    /// Free a port; false if it was not claimed
    pub fn release(&self, port: u16) -> bool {
        let mut slots = self.lock();
        match Self::index(port).and_then(|i| slots.get_mut(i)) {
            Some(slot) if !matches!(slot, Slot::Free) => {
                *slot = Slot::Free;
                debug!("Released port {}", port);
                true
            }
            _ => false,
        }
    }

    /// Attach a session to a claimed port; false if the port is not claimed
    pub fn bind(&self, port: u16, session: &Arc<T>) -> bool {
        let mut slots = self.lock();
        match Self::index(port).and_then(|i| slots.get_mut(i)) {
            Some(slot) if !matches!(slot, Slot::Free) => {
                *slot = Slot::Bound(Arc::downgrade(session));
                true
            }
            _ => false,
        }
    }

    /// Session bound to `port`, if it is still alive
    pub fn lookup(&self, port: u16) -> Option<Arc<T>> {
        let slots = self.lock();
        match Self::index(port).and_then(|i| slots.get(i)) {
            Some(Slot::Bound(session)) => session.upgrade(),
            _ => None,
        }
    }

    /// Snapshot of bound ports and their sessions, ordered by port
    pub fn enumerate(&self) -> impl Iterator<Item = (u16, Arc<T>)> + use<T> {
        let snapshot: Vec<_> = self
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Bound(session) => session.upgrade().map(|s| (i as u16 + 1, s)),
                _ => None,
            })
            .collect();
        snapshot.into_iter()
    }
}

/// A claimed port that is released on drop
pub struct PortGuard<T> {
    table: Arc<PortTable<T>>,
    port: u16,
    armed: bool,
}

impl<T> PortGuard<T> {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Keep the port claimed past the guard; the caller must release it
    pub fn keep(mut self) -> u16 {
        self.armed = false;
        self.port
    }
}

impl<T> Drop for PortGuard<T> {
    fn drop(&mut self) {
        if self.armed {
            self.table.release(self.port);
        }
    }
}

impl<T> std::fmt::Debug for PortGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortGuard")
            .field("port", &self.port)
            .field("armed", &self.armed)
            .finish()
    }
}
