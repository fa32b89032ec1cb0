use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use super::KernelPatcher;

/// Function pointer types that can be rebuilt from a resolved address.
pub trait FnPtr: Copy + Send + Sync + 'static {
    /// # Safety
    ///
    /// `addr` must be the entry point of a function with exactly this
    /// signature and calling convention.
    unsafe fn from_addr(addr: u64) -> Self;

    fn addr(self) -> u64;
}

macro_rules! impl_fn_ptr {
    ($($arg:ident),*) => {
        impl<R: 'static, $($arg: 'static),*> FnPtr for extern "C" fn($($arg),*) -> R {
            unsafe fn from_addr(addr: u64) -> Self {
                let raw = addr as usize;
                // SAFETY: function pointers are pointer-sized; the signature is
                // the caller's promise.
                unsafe { std::mem::transmute_copy::<usize, Self>(&raw) }
            }

            fn addr(self) -> u64 {
                self as usize as u64
            }
        }
    };
}

impl_fn_ptr!();
impl_fn_ptr!(A);
impl_fn_ptr!(A, B);
impl_fn_ptr!(A, B, C);
impl_fn_ptr!(A, B, C, D);

/// A symbol of the target image, resolved at most once.
#[derive(Debug)]
pub struct SymbolRef {
    name: Option<&'static str>,
    /// 0 until resolved, then fixed for the process lifetime
    address: AtomicU64,
    /// Replacement installed over this symbol, 0 if none, `PENDING` while
    /// a route is being installed
    interception: AtomicU64,
}

const PENDING: u64 = 1;

impl SymbolRef {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Some(name),
            address: AtomicU64::new(0),
            interception: AtomicU64::new(0),
        }
    }

    /// A symbol with no exported name, only reachable through a vtable.
    pub const fn anonymous() -> Self {
        Self {
            name: None,
            address: AtomicU64::new(0),
            interception: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name.unwrap_or("(unknown)")
    }

    pub fn address(&self) -> Option<u64> {
        match self.address.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub fn interception(&self) -> Option<u64> {
        match self.interception.load(Ordering::Acquire) {
            0 | PENDING => None,
            addr => Some(addr),
        }
    }

    /// Reserve the symbol for a new interception. `false` means one is
    /// already installed. A caller finding another install in progress waits
    /// for its outcome and claims the symbol if that install failed.
    fn claim_interception(&self) -> bool {
        loop {
            match self
                .interception
                .compare_exchange(0, PENDING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(PENDING) => std::hint::spin_loop(),
                Err(_) => return false,
            }
        }
    }

    /// Publish the outcome of a claimed interception.
    fn settle_interception(&self, replacement: Option<u64>) {
        self.interception
            .store(replacement.unwrap_or(0), Ordering::Release);
    }

    /// Record the address unless one is already cached; returns the cached one.
    fn publish(&self, addr: u64) -> u64 {
        match self
            .address
            .compare_exchange(0, addr, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => addr,
            Err(existing) => existing,
        }
    }

    /// Resolve the symbol, querying the image only on the first success.
    pub fn solve(&self, patcher: &dyn KernelPatcher) -> Option<u64> {
        if let Some(addr) = self.address() {
            return Some(addr);
        }
        let name = self.name?;
        if patcher.image_base() == 0 {
            return None;
        }
        let addr = patcher.solve_symbol(name).filter(|&addr| addr != 0)?;
        Some(self.publish(addr))
    }
}

/// Typed entry point into the target image.
///
/// Calling through [`Func::get`] reaches the unpatched function, also
/// after the symbol has been intercepted.
#[derive(Debug)]
pub struct Func<F: FnPtr> {
    symbol: SymbolRef,
    /// Address invoked by `get`: the symbol itself, or the trampoline/old
    /// vtable entry once intercepted
    callable: AtomicU64,
    _marker: PhantomData<F>,
}

impl<F: FnPtr> Func<F> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            symbol: SymbolRef::new(name),
            callable: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    pub const fn anonymous() -> Self {
        Self {
            symbol: SymbolRef::anonymous(),
            callable: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.symbol.name()
    }

    pub fn symbol(&self) -> &SymbolRef {
        &self.symbol
    }

    /// Address of the symbol in the image, if resolved.
    pub fn address(&self) -> Option<u64> {
        self.symbol.address()
    }

    pub fn is_resolved(&self) -> bool {
        self.callable.load(Ordering::Acquire) != 0
    }

    pub fn is_routed(&self) -> bool {
        self.symbol.interception().is_some()
    }

    /// Address reached by `get`, i.e. the unpatched function.
    pub fn original(&self) -> Option<u64> {
        match self.callable.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub fn solve(&self, patcher: &dyn KernelPatcher) -> bool {
        match self.symbol.solve(patcher) {
            Some(addr) => {
                let _ =
                    self.callable
                        .compare_exchange(0, addr, Ordering::AcqRel, Ordering::Acquire);
                true
            }
            None => {
                debug!("Failed to solve {}", self.name());
                false
            }
        }
    }

    /// Redirect all calls of the symbol to `replacement`.
    ///
    /// Routing an already routed function is a no-op success that keeps the
    /// first original, also when callers race.
    pub fn route(&self, patcher: &dyn KernelPatcher, replacement: F) -> bool {
        if !self.symbol.claim_interception() {
            return true;
        }
        let routed = self.install_route(patcher, replacement);
        self.symbol
            .settle_interception(routed.then(|| replacement.addr()));
        routed
    }

    fn install_route(&self, patcher: &dyn KernelPatcher, replacement: F) -> bool {
        if !self.solve(patcher) {
            return false;
        }
        let Some(target) = self.address() else {
            return false;
        };

        match patcher.route_function(target, replacement.addr()) {
            Some(original) if original != 0 => {
                self.callable.store(original, Ordering::Release);
                debug!("Routed {} ({:#x})", self.name(), target);
                true
            }
            _ => {
                warn!("Failed to route {} ({:#x})", self.name(), target);
                false
            }
        }
    }

    /// Replace the pointer at `slot_offset` bytes into the vtable `vtable`
    /// with `replacement`; the previous entry becomes the callable original.
    pub fn route_virtual(
        &self,
        patcher: &dyn KernelPatcher,
        vtable: &str,
        slot_offset: usize,
        replacement: F,
    ) -> bool {
        if !self.symbol.claim_interception() {
            return true;
        }
        let routed = self.install_virtual(patcher, vtable, slot_offset, replacement);
        self.symbol
            .settle_interception(routed.then(|| replacement.addr()));
        routed
    }

    fn install_virtual(
        &self,
        patcher: &dyn KernelPatcher,
        vtable: &str,
        slot_offset: usize,
        replacement: F,
    ) -> bool {
        if patcher.image_base() == 0 {
            return false;
        }
        let Some(vt) = patcher.solve_symbol(vtable).filter(|&vt| vt != 0) else {
            debug!("Failed to solve vtable {}", vtable);
            return false;
        };

        let slot = vt + slot_offset as u64;
        // SAFETY: `vtable` names a vtable of the image and `slot_offset` is
        // a slot inside it.
        let previous = unsafe { patcher.swap_pointer(slot, replacement.addr()) };
        match previous {
            Some(previous) if previous != 0 => {
                let original = self.symbol.publish(previous);
                self.callable.store(original, Ordering::Release);
                debug!(
                    "Routed {} through {}+{:#x}",
                    self.name(),
                    vtable,
                    slot_offset
                );
                true
            }
            Some(_) => {
                // Empty slot: put it back, there is nothing to delegate to
                // SAFETY: same slot as above.
                unsafe { patcher.swap_pointer(slot, 0) };
                warn!("Vtable slot {}+{:#x} is empty", vtable, slot_offset);
                false
            }
            None => false,
        }
    }

    /// The callable entry point.
    ///
    /// # Panics
    ///
    /// Panics if the function was never resolved: code paths depending on an
    /// unresolved function must not be reachable.
    pub fn get(&self) -> F {
        let addr = self.callable.load(Ordering::Acquire);
        assert!(addr != 0, "{} not solved", self.name());
        // SAFETY: `addr` came from the symbol table or vtable entry for this
        // symbol, whose signature is `F`.
        unsafe { F::from_addr(addr) }
    }
}
