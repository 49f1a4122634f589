//! Port allocation - Hands out unique telemetry ports from a fixed range

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, trace};

use super::error::AllocatorError;

/// Allocator over an inclusive port range
///
/// Every call takes the same lock, so two concurrent creates can never be
/// handed the same port.
pub struct PortAllocator {
    start: u16,
    end: u16,
    used: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        Self {
            start,
            end,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    fn used(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        // The set is never left half-updated, so a poisoned lock is still usable
        self.used.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the lowest free port
    pub fn allocate(&self) -> Result<u16, AllocatorError> {
        let mut used = self.used();
        let port = (self.start..=self.end)
            .find(|p| !used.contains(p))
            .ok_or(AllocatorError::Exhausted {
                start: self.start,
                end: self.end,
            })?;
        used.insert(port);
        debug!("Allocated port {}", port);
        Ok(port)
    }

    /// Return a port to the pool; unknown or already-free ports are ignored
    pub fn release(&self, port: u16) {
        if self.used().remove(&port) {
            debug!("Released port {}", port);
        } else {
            trace!("Release of port {} ignored, not held", port);
        }
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.used().contains(&port)
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Number of ports in the range
    pub fn capacity(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.used().len()
    }

    /// Offset of a port within the range
    pub fn slot(&self, port: u16) -> u16 {
        port.saturating_sub(self.start)
    }
}
