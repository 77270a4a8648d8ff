//! Port / Resource Allocator (spec §4.7). Hierarchy level 1 — the lowest
//! lock level, never acquired while holding any other lock in this crate.

use crate::locking::{self, LockLevel};
use parking_lot::Mutex;
use std::collections::HashSet;
use vision_common::{Result, VisionError};

struct Inner {
    port_range: std::ops::RangeInclusive<u16>,
    allocated_ports: HashSet<u16>,
    ctx_budget: u32,
    ctx_in_use: u32,
}

/// Allocates unique MJPEG listener ports from a configured range and
/// accounts the accelerator-context budget (`K_ctx` private inference
/// contexts system-wide); once exhausted, callers fall back to the shared
/// single-context sequential-inference path.
pub struct ResourceAllocator {
    inner: Mutex<Inner>,
}

impl ResourceAllocator {
    pub fn new(port_range: std::ops::RangeInclusive<u16>, ctx_budget: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                port_range,
                allocated_ports: HashSet::new(),
                ctx_budget,
                ctx_in_use: 0,
            }),
        }
    }

    pub fn allocate_port(&self) -> Result<u16> {
        let _guard = locking::enter(LockLevel::PortAllocator);
        let mut inner = self.inner.lock();
        let range = inner.port_range.clone();
        for port in range {
            if !inner.allocated_ports.contains(&port) {
                inner.allocated_ports.insert(port);
                return Ok(port);
            }
        }
        Err(VisionError::Resource("no free MJPEG port in configured range".into()))
    }

    /// Reserve a specific port (e.g. one declared on a `StreamSource`).
    /// Fails if already taken.
    pub fn reserve_port(&self, port: u16) -> Result<()> {
        let _guard = locking::enter(LockLevel::PortAllocator);
        let mut inner = self.inner.lock();
        if inner.allocated_ports.contains(&port) {
            return Err(VisionError::Resource(format!("port {port} already in use")));
        }
        inner.allocated_ports.insert(port);
        Ok(())
    }

    pub fn release_port(&self, port: u16) {
        let _guard = locking::enter(LockLevel::PortAllocator);
        self.inner.lock().allocated_ports.remove(&port);
    }

    /// True if a private accelerator context is available; on success the
    /// budget is debited and the caller must call [`release_context`] when
    /// the worker tears down.
    pub fn try_acquire_context(&self) -> bool {
        let _guard = locking::enter(LockLevel::PortAllocator);
        let mut inner = self.inner.lock();
        if inner.ctx_in_use < inner.ctx_budget {
            inner.ctx_in_use += 1;
            true
        } else {
            false
        }
    }

    pub fn release_context(&self) {
        let _guard = locking::enter(LockLevel::PortAllocator);
        let mut inner = self.inner.lock();
        inner.ctx_in_use = inner.ctx_in_use.saturating_sub(1);
    }

    pub fn contexts_in_use(&self) -> u32 {
        self.inner.lock().ctx_in_use
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_do_not_collide() {
        let alloc = ResourceAllocator::new(8100..=8102, 1);
        let a = alloc.allocate_port().unwrap();
        let b = alloc.allocate_port().unwrap();
        let c = alloc.allocate_port().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(alloc.allocate_port().is_err());

        alloc.release_port(a);
        let d = alloc.allocate_port().unwrap();
        assert_eq!(d, a);
    }

    #[test]
    fn context_budget_is_enforced() {
        let alloc = ResourceAllocator::new(9000..=9000, 2);
        assert!(alloc.try_acquire_context());
        assert!(alloc.try_acquire_context());
        assert!(!alloc.try_acquire_context());
        alloc.release_context();
        assert!(alloc.try_acquire_context());
    }
}
