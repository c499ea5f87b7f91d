//! Process-wide registry of ephemeral ports handed to live sessions.
//!
//! The registry only prevents two concurrent sessions from being assigned the
//! same port number; it does not claim the port at the OS level.  The session
//! that receives a [`PortReservation`] must bind promptly.
//!
//! A reservation releases its port when dropped, so every exit path of a
//! session (success, timeout, protocol violation, panic unwinding) returns
//! the port to the pool.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use thiserror::Error;

/// Ports are drawn uniformly from this range.
pub const PORT_RANGE: Range<u16> = 10_000..20_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("all ports in {}..{} are reserved", PORT_RANGE.start, PORT_RANGE.end)]
    Exhausted,
}

/// Shared, lock-guarded set of reserved ports.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    inner: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `ports` permanently marked as in use (e.g. the listener port).
    pub fn with_reserved(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ports.into_iter().collect())),
        }
    }

    /// Pick a free port from [`PORT_RANGE`] and mark it reserved.
    ///
    /// Choosing and inserting happen under one lock acquisition.
    pub fn reserve(&self) -> Result<PortReservation, PortError> {
        let mut set = self.lock();
        let taken = set.iter().filter(|&&p| PORT_RANGE.contains(&p)).count();
        if taken >= PORT_RANGE.len() {
            return Err(PortError::Exhausted);
        }

        let mut rng = rand::rng();
        let port = loop {
            let candidate = rng.random_range(PORT_RANGE);
            if set.insert(candidate) {
                break candidate;
            }
        };
        drop(set);

        log::debug!("[ports] reserved {port}");
        Ok(PortReservation {
            port,
            allocator: self.clone(),
        })
    }

    /// Remove `port` from the registry.  Releasing an unreserved port is a no-op.
    pub fn release(&self, port: u16) {
        if self.lock().remove(&port) {
            log::debug!("[ports] released {port}");
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// Number of ports currently reserved, including permanent entries.
    pub fn in_use(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u16>> {
        // The set is always left consistent, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A reserved port, released back to its [`PortAllocator`] on drop.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    allocator: PortAllocator,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_port_is_in_range_and_tracked() {
        let ports = PortAllocator::new();
        let r = ports.reserve().unwrap();
        assert!(PORT_RANGE.contains(&r.port()));
        assert!(ports.is_reserved(r.port()));
        assert_eq!(ports.in_use(), 1);
    }

    #[test]
    fn drop_releases_port() {
        let ports = PortAllocator::new();
        let port = {
            let r = ports.reserve().unwrap();
            r.port()
        };
        assert!(!ports.is_reserved(port));
        assert_eq!(ports.in_use(), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let ports = PortAllocator::with_reserved([12235]);
        ports.release(15000);
        ports.release(12235);
        ports.release(12235);
        assert_eq!(ports.in_use(), 0);
    }

    #[test]
    fn permanent_entries_are_never_handed_out() {
        // Everything but one port is taken up front.
        let free = 17_777;
        let ports = PortAllocator::with_reserved(PORT_RANGE.filter(|&p| p != free));
        let r = ports.reserve().unwrap();
        assert_eq!(r.port(), free);
        assert_eq!(ports.reserve().unwrap_err(), PortError::Exhausted);
    }

    #[test]
    fn concurrent_reservations_are_distinct() {
        let ports = PortAllocator::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = ports.clone();
                std::thread::spawn(move || {
                    (0..50).map(|_| ports.reserve().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let all: Vec<PortReservation> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<u16> = all.iter().map(PortReservation::port).collect();
        assert_eq!(unique.len(), 400);
        assert_eq!(ports.in_use(), 400);

        drop(all);
        assert_eq!(ports.in_use(), 0);
    }
}
