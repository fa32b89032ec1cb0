//! Test patcher backed by a symbol map
//!
//! `route_function` does not rewrite code: it records the request and hands
//! back the target as its own trampoline. `swap_pointer` uses the real
//! default implementation, so vtables must live in test-owned memory.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::KernelPatcher;

pub struct MockPatcher {
    base: AtomicU64,
    symbols: Mutex<HashMap<String, u64>>,
    solves: Mutex<HashMap<String, usize>>,
    routes: Mutex<Vec<(u64, u64)>>,
    refuse_routes: AtomicBool,
}

impl MockPatcher {
    pub fn new() -> Self {
        Self {
            base: AtomicU64::new(0xffff_ff7f_8000_0000),
            symbols: Mutex::new(HashMap::new()),
            solves: Mutex::new(HashMap::new()),
            routes: Mutex::new(Vec::new()),
            refuse_routes: AtomicBool::new(false),
        }
    }

    pub fn set_image_base(&self, base: u64) {
        self.base.store(base, Ordering::SeqCst);
    }

    pub fn add_symbol(&self, name: &str, address: u64) {
        self.symbols
            .lock()
            .unwrap()
            .insert(name.to_string(), address);
    }

    pub fn refuse_routes(&self, refuse: bool) {
        self.refuse_routes.store(refuse, Ordering::SeqCst);
    }

    pub fn solve_count(&self, name: &str) -> usize {
        self.solves.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn routes(&self) -> Vec<(u64, u64)> {
        self.routes.lock().unwrap().clone()
    }
}

impl KernelPatcher for MockPatcher {
    fn image_base(&self) -> u64 {
        self.base.load(Ordering::SeqCst)
    }

    fn solve_symbol(&self, name: &str) -> Option<u64> {
        *self
            .solves
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default() += 1;
        self.symbols.lock().unwrap().get(name).copied()
    }

    fn route_function(&self, target: u64, replacement: u64) -> Option<u64> {
        if self.refuse_routes.load(Ordering::SeqCst) {
            return None;
        }
        self.routes.lock().unwrap().push((target, replacement));
        Some(target)
    }
}
