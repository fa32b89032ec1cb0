//! Host runtime services.
//!
//! The plugin never talks to the operating system directly. Everything it
//! needs from the host (DMA buffers, registry properties, the power-management
//! tree) goes through the traits in this module, which the embedding
//! environment implements.

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use crate::pm::{PmProxy, PowerState};

/// Non-owning identity of a driver service object (an `IOService*`).
///
/// The plugin never dereferences this itself; it is only handed back to the
/// driver functions and the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(usize);

impl ServiceId {
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn from_ptr(ptr: *mut c_void) -> Self {
        Self(ptr as usize)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A DMA-capable buffer (`IOBufferMemoryDescriptor`).
pub trait DmaBuffer: Send {
    /// Descriptor handle passed to driver functions.
    fn descriptor(&self) -> *mut c_void;

    fn as_slice(&self) -> &[u8];

    fn as_mut_slice(&mut self) -> &mut [u8];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a power-managed child object registered with the host.
///
/// Dropping the handle releases the host object.
pub trait PmProxyHandle: Send {
    /// Report device activity to the proxy's idle timer.
    fn activity_tickle(&self);

    /// Remove the proxy from the controller's interested-driver list.
    fn deregister_interest(&self, controller: ServiceId);

    /// Stop power management for the proxy (`PMstop`).
    fn stop(&self);
}

pub trait Platform: Send + Sync {
    fn alloc_buffer(&self, len: usize) -> Option<Box<dyn DmaBuffer>>;

    fn property_u64(&self, service: ServiceId, key: &str) -> Option<u64>;

    fn parent(&self, service: ServiceId) -> Option<ServiceId>;

    /// Join `proxy` to the controller's power tree, register its power-state
    /// table and make it an interested driver of the controller.
    fn attach_pm_proxy(
        &self,
        controller: ServiceId,
        states: &[PowerState],
        proxy: Arc<PmProxy>,
    ) -> Option<Box<dyn PmProxyHandle>>;
}

/// Look up a numeric property on `service` or the closest ancestor carrying it.
pub fn find_property(
    platform: &dyn Platform,
    service: ServiceId,
    key: &str,
    max_depth: usize,
) -> Option<u64> {
    let mut current = Some(service);
    for _ in 0..max_depth {
        let svc = current?;
        if let Some(value) = platform.property_u64(svc, key) {
            return Some(value);
        }
        current = platform.parent(svc);
    }
    None
}
