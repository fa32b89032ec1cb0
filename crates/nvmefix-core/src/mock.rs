//! Test doubles for the host and the driver
//!
//! `MockPlatform` counts live buffers and proxies so tests can check that
//! teardown releases everything; `MockDriver` behaves like a controller that
//! stores the features it is given.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::memory::layout::apst;
use crate::nvme::{FeatureId, NvmeDriver};
use crate::platform::{DmaBuffer, Platform, PmProxyHandle, ServiceId};
use crate::pm::{PmProxy, PowerState};

pub struct MockBuffer {
    data: Vec<u8>,
    ptr: *mut u8,
    live: Option<Arc<AtomicUsize>>,
}

// SAFETY: `ptr` points into `data`, which moves with the buffer.
unsafe impl Send for MockBuffer {}

impl MockBuffer {
    pub fn new(len: usize) -> Self {
        let mut data = vec![0u8; len];
        let ptr = data.as_mut_ptr();
        Self {
            data,
            ptr,
            live: None,
        }
    }

    fn counted(len: usize, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        let mut buffer = Self::new(len);
        buffer.live = Some(live);
        buffer
    }
}

impl DmaBuffer for MockBuffer {
    /// The descriptor is the data pointer itself.
    fn descriptor(&self) -> *mut c_void {
        self.ptr as *mut c_void
    }

    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for MockBuffer {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct MockProxy {
    events: Arc<Mutex<Vec<String>>>,
    live: Arc<AtomicUsize>,
}

impl PmProxyHandle for MockProxy {
    fn activity_tickle(&self) {
        self.events.lock().unwrap().push("tickle".to_string());
    }

    fn deregister_interest(&self, controller: ServiceId) {
        self.events
            .lock()
            .unwrap()
            .push(format!("deregister {}", controller));
    }

    fn stop(&self) {
        self.events.lock().unwrap().push("stop".to_string());
    }
}

impl Drop for MockProxy {
    fn drop(&mut self) {
        self.events.lock().unwrap().push("release".to_string());
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockPlatform {
    properties: Mutex<HashMap<(ServiceId, String), u64>>,
    parents: Mutex<HashMap<ServiceId, ServiceId>>,
    allocations: Mutex<Vec<usize>>,
    live_buffers: Arc<AtomicUsize>,
    live_proxies: Arc<AtomicUsize>,
    events: Arc<Mutex<Vec<String>>>,
    attached: Mutex<Vec<(ServiceId, usize, Arc<PmProxy>)>>,
    refuse_buffers: AtomicBool,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_parent(&self, child: ServiceId, parent: ServiceId) {
        self.parents.lock().unwrap().insert(child, parent);
    }

    pub fn set_property(&self, service: ServiceId, key: &str, value: u64) {
        self.properties
            .lock()
            .unwrap()
            .insert((service, key.to_string()), value);
    }

    pub fn refuse_buffers(&self, refuse: bool) {
        self.refuse_buffers.store(refuse, Ordering::SeqCst);
    }

    /// A proxy handle not bound to any controller.
    pub fn proxy_handle(&self) -> Box<dyn PmProxyHandle> {
        self.live_proxies.fetch_add(1, Ordering::SeqCst);
        Box::new(MockProxy {
            events: self.events.clone(),
            live: self.live_proxies.clone(),
        })
    }

    pub fn proxy_events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::SeqCst)
    }

    pub fn live_proxies(&self) -> usize {
        self.live_proxies.load(Ordering::SeqCst)
    }

    /// Number of buffers of `len` bytes handed out so far
    pub fn allocations(&self, len: usize) -> usize {
        self.allocations
            .lock()
            .unwrap()
            .iter()
            .filter(|&&l| l == len)
            .count()
    }

    /// Controllers a proxy was attached to, with their table sizes
    pub fn attached(&self) -> Vec<(ServiceId, usize)> {
        self.attached
            .lock()
            .unwrap()
            .iter()
            .map(|(controller, states, _)| (*controller, *states))
            .collect()
    }

    pub fn attached_proxy(&self, controller: ServiceId) -> Option<Arc<PmProxy>> {
        self.attached
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _, _)| *c == controller)
            .map(|(_, _, proxy)| proxy.clone())
    }
}

impl Platform for MockPlatform {
    fn alloc_buffer(&self, len: usize) -> Option<Box<dyn DmaBuffer>> {
        if self.refuse_buffers.load(Ordering::SeqCst) {
            return None;
        }
        self.allocations.lock().unwrap().push(len);
        Some(Box::new(MockBuffer::counted(
            len,
            self.live_buffers.clone(),
        )))
    }

    fn property_u64(&self, service: ServiceId, key: &str) -> Option<u64> {
        self.properties
            .lock()
            .unwrap()
            .get(&(service, key.to_string()))
            .copied()
    }

    fn parent(&self, service: ServiceId) -> Option<ServiceId> {
        self.parents.lock().unwrap().get(&service).copied()
    }

    fn attach_pm_proxy(
        &self,
        controller: ServiceId,
        states: &[PowerState],
        proxy: Arc<PmProxy>,
    ) -> Option<Box<dyn PmProxyHandle>> {
        self.attached
            .lock()
            .unwrap()
            .push((controller, states.len(), proxy));
        Some(self.proxy_handle())
    }
}

/// Controller that remembers the features it is given.
#[derive(Default)]
pub struct MockDriver {
    identify: Mutex<Vec<u8>>,
    identify_failures: AtomicUsize,
    identify_calls: AtomicUsize,
    get_calls: AtomicUsize,
    fail_set: AtomicBool,
    ignore_apst: AtomicBool,
    features: Mutex<HashMap<FeatureId, u32>>,
    apst_table: Mutex<Option<Vec<u8>>>,
    set_calls: Mutex<Vec<(FeatureId, u32)>>,
    msi_clears: AtomicUsize,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_identify(&self, page: Vec<u8>) {
        *self.identify.lock().unwrap() = page;
    }

    /// Fail the next `count` identify commands.
    pub fn fail_identify(&self, count: usize) {
        self.identify_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_set(&self, fail: bool) {
        self.fail_set.store(fail, Ordering::SeqCst);
    }

    /// Accept APST tables but keep reporting APST as disabled.
    pub fn ignore_apst(&self, ignore: bool) {
        self.ignore_apst.store(ignore, Ordering::SeqCst);
    }

    /// Last APST Set Features: dword 11 and the table
    pub fn apst_set(&self) -> Option<(u32, Vec<u8>)> {
        self.set_calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(fid, _)| *fid == FeatureId::AutonomousPowerStateTransition)
            .map(|&(_, dword11)| dword11)
            .zip(self.apst_table.lock().unwrap().clone())
    }

    pub fn set_calls(&self) -> Vec<(FeatureId, u32)> {
        self.set_calls.lock().unwrap().clone()
    }

    pub fn identify_count(&self) -> usize {
        self.identify_calls.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn msi_clears(&self) -> usize {
        self.msi_clears.load(Ordering::SeqCst)
    }

    fn failure(controller: ServiceId, stage: &'static str) -> Error {
        Error::NvmeStatus {
            controller,
            stage,
            status: 0x6,
        }
    }
}

impl NvmeDriver for MockDriver {
    fn identify(&self, controller: ServiceId, buffer: &mut dyn DmaBuffer) -> Result<()> {
        self.identify_calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.identify_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.identify_failures.store(pending - 1, Ordering::SeqCst);
            return Err(Self::failure(controller, "identify"));
        }
        let page = self.identify.lock().unwrap();
        let len = page.len().min(buffer.len());
        buffer.as_mut_slice()[..len].copy_from_slice(&page[..len]);
        Ok(())
    }

    fn get_features(
        &self,
        _controller: ServiceId,
        fid: FeatureId,
        buffer: Option<&mut dyn DmaBuffer>,
    ) -> Result<u32> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if let (Some(buffer), FeatureId::AutonomousPowerStateTransition) = (buffer, fid) {
            if let Some(table) = self.apst_table.lock().unwrap().as_ref() {
                let len = table.len().min(buffer.len());
                buffer.as_mut_slice()[..len].copy_from_slice(&table[..len]);
            }
        }
        Ok(self.features.lock().unwrap().get(&fid).copied().unwrap_or(0))
    }

    fn set_features(
        &self,
        controller: ServiceId,
        fid: FeatureId,
        dword11: u32,
        buffer: Option<&mut dyn DmaBuffer>,
    ) -> Result<u32> {
        if self.fail_set.load(Ordering::SeqCst) {
            return Err(Self::failure(controller, "set features"));
        }
        self.set_calls.lock().unwrap().push((fid, dword11));
        if fid == FeatureId::AutonomousPowerStateTransition {
            if let Some(buffer) = buffer {
                let len = buffer.len().min(apst::SIZE);
                *self.apst_table.lock().unwrap() = Some(buffer.as_slice()[..len].to_vec());
            }
            if self.ignore_apst.load(Ordering::SeqCst) {
                return Ok(0);
            }
        }
        self.features.lock().unwrap().insert(fid, dword11);
        Ok(dword11)
    }

    fn clear_msi_workaround(&self, _controller: ServiceId) -> bool {
        self.msi_clears.fetch_add(1, Ordering::SeqCst);
        true
    }
}
