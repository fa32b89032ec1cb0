//! Private data-member offsets inside opaque driver objects
//!
//! The driver exposes no accessors for some of the request and controller
//! fields the plugin must touch. Their byte offsets are recovered once per
//! image, by an [`OffsetStrategy`], and then used for every controller.

mod collection;
mod pattern;
mod scanner;

use std::ffi::c_void;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

pub use collection::*;
pub use pattern::*;
pub use scanner::*;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    IntoStaticStr,
    Display,
)]
pub enum MemberId {
    #[strum(serialize = "AppleNVMeRequest::result")]
    RequestResult,
    #[strum(serialize = "AppleNVMeRequest::controller")]
    RequestController,
    #[strum(serialize = "AppleNVMeRequest::command")]
    RequestCommand,
    #[strum(serialize = "AppleNVMeRequest::prpDescriptor")]
    RequestPrpDescriptor,
    #[strum(serialize = "IONVMeController::ANS2MSIWorkaround")]
    ControllerMsiWorkaround,
}

impl MemberId {
    /// Members without which no admin command can be issued
    pub const REQUIRED: [MemberId; 3] = [
        MemberId::RequestResult,
        MemberId::RequestCommand,
        MemberId::RequestPrpDescriptor,
    ];
}

/// A way of finding member offsets in the loaded image.
pub trait OffsetStrategy {
    fn name(&self) -> &'static str;

    /// Mangled name of the function this strategy inspects for `member`.
    fn accessor(&self, _member: MemberId) -> Option<&str> {
        None
    }

    /// Byte offset of `member`, given the resolved address of its accessor.
    fn discover(&self, member: MemberId, accessor: Option<u64>) -> Option<u64>;
}

/// Typed field of an opaque object at a lazily discovered offset.
#[derive(Debug)]
pub struct MemberRef<T> {
    id: MemberId,
    /// 0 until discovered
    offset: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> MemberRef<T> {
    pub const fn new(id: MemberId) -> Self {
        Self {
            id,
            offset: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn offset(&self) -> Option<u64> {
        match self.offset.load(Ordering::Acquire) {
            0 => None,
            offset => Some(offset),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.offset().is_some()
    }

    /// Discover the offset unless it is already known. Only the first
    /// successful discovery is kept.
    pub fn resolve(&self, strategy: &dyn OffsetStrategy, accessor: Option<u64>) -> bool {
        if self.is_resolved() {
            return true;
        }
        match strategy.discover(self.id, accessor) {
            Some(offset) if offset != 0 => {
                let _ = self.offset.compare_exchange(
                    0,
                    offset,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                true
            }
            _ => false,
        }
    }

    /// Pointer to the member inside `obj`.
    ///
    /// # Panics
    ///
    /// Panics if the offset is unresolved or `obj` is null.
    ///
    /// # Safety
    ///
    /// `obj` must point to a live object of the type this member belongs to.
    pub unsafe fn ptr(&self, obj: *mut c_void) -> *mut T {
        let offset = self.offset.load(Ordering::Acquire);
        assert!(offset != 0, "{} not resolved", self.id);
        assert!(!obj.is_null(), "{} accessed through null object", self.id);
        // SAFETY: the offset lies inside the object per the caller's contract.
        unsafe { obj.cast::<u8>().add(offset as usize).cast::<T>() }
    }

    /// # Safety
    ///
    /// See [`MemberRef::ptr`].
    pub unsafe fn read(&self, obj: *mut c_void) -> T
    where
        T: Copy,
    {
        // SAFETY: forwarded to the caller.
        unsafe { self.ptr(obj).read_unaligned() }
    }

    /// # Safety
    ///
    /// See [`MemberRef::ptr`].
    pub unsafe fn write(&self, obj: *mut c_void, value: T) {
        // SAFETY: forwarded to the caller.
        unsafe { self.ptr(obj).write_unaligned(value) }
    }
}
