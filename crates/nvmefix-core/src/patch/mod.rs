//! Symbol resolution and call interception in the loaded driver image
//!
//! The patching framework itself (symbol tables, code rewriting) belongs to the
//! host and is reached through [`KernelPatcher`]. This module layers the
//! resolve-once cache and typed entry points on top of it.

mod func;

#[cfg(test)]
pub mod mock;

use std::sync::atomic::{AtomicU64, Ordering};

pub use func::{FnPtr, Func, SymbolRef};

#[cfg(test)]
pub use mock::MockPatcher;

pub trait KernelPatcher: Send + Sync {
    /// Load address of the target image, 0 while it is not loaded.
    fn image_base(&self) -> u64;

    /// Look up a mangled symbol in the target image or the kernel it links
    /// against.
    fn solve_symbol(&self, name: &str) -> Option<u64>;

    /// Redirect every call of `target` to `replacement`.
    ///
    /// Returns a callable trampoline that reaches the original code.
    fn route_function(&self, target: u64, replacement: u64) -> Option<u64>;

    /// Atomically replace the pointer stored at `slot`, returning the old value.
    ///
    /// # Safety
    ///
    /// `slot` must be an 8-byte aligned, writable pointer slot (a vtable entry)
    /// that stays mapped for the lifetime of the process.
    unsafe fn swap_pointer(&self, slot: u64, value: u64) -> Option<u64> {
        if slot == 0 {
            return None;
        }
        // SAFETY: upheld by the caller.
        let cell = unsafe { AtomicU64::from_ptr(slot as *mut u64) };
        Some(cell.swap(value, Ordering::AcqRel))
    }

    /// Read the pointer stored at `slot`.
    ///
    /// # Safety
    ///
    /// `slot` must be an 8-byte aligned, readable pointer slot.
    unsafe fn read_pointer(&self, slot: u64) -> Option<u64> {
        if slot == 0 {
            return None;
        }
        // SAFETY: upheld by the caller.
        let cell = unsafe { AtomicU64::from_ptr(slot as *mut u64) };
        Some(cell.load(Ordering::Acquire))
    }
}

/// Offset-to-top and type info precede the first virtual function
pub const VTABLE_HEADER: usize = 16;
/// Upper bound on the slots inspected by [`find_vtable_slot`]
pub const MAX_VTABLE_SLOTS: usize = 1024;

/// Byte offset of the slot in `vtable` that holds `target`.
///
/// Slots are inspected from the first virtual function on; a null slot ends
/// the table.
pub fn find_vtable_slot(patcher: &dyn KernelPatcher, vtable: &str, target: u64) -> Option<usize> {
    if patcher.image_base() == 0 || target == 0 {
        return None;
    }
    let base = patcher.solve_symbol(vtable).filter(|&vt| vt != 0)?;
    for index in 0..MAX_VTABLE_SLOTS {
        let offset = VTABLE_HEADER + index * 8;
        // SAFETY: `vtable` names a vtable of the image and the walk stops at
        // its null terminator.
        match unsafe { patcher.read_pointer(base + offset as u64) }? {
            0 => return None,
            entry if entry == target => return Some(offset),
            _ => {}
        }
    }
    None
}
