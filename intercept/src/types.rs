use core::ptr::NonNull;
use core::sync::atomic::AtomicPtr;

use thiserror::Error;
pub use vthook_protocol::ConfigError;

pub use vthook_protocol::{
    ClassHookSpec, HookKind, InheritanceDepth, SlotIndex, DEPTH_LEVELS, MAX_INHERITANCE_DEPTH,
};

/// Leading word of every hookable object: its dispatch-table pointer.
///
/// Host objects embed this as their first `#[repr(C)]` field so the table
/// pointer sits at offset zero, as in a single-inheritance C++ object.
#[repr(C)]
#[derive(Debug)]
pub struct RawObject {
    pub table: AtomicPtr<usize>,
}

impl RawObject {
    pub const fn new(table: *mut usize) -> Self {
        Self {
            table: AtomicPtr::new(table),
        }
    }
}

/// Identity of a live host object.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(NonNull<RawObject>);

impl ObjectRef {
    /// # Safety
    /// `ptr` must point to a live object starting with a [`RawObject`] header and
    /// stay valid until the host reports the object as terminated.
    pub unsafe fn from_raw(ptr: *mut RawObject) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut RawObject {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

// An ObjectRef is an address handed out by the host runtime, which owns the
// object and guarantees it outlives the hook state referring to it.
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

/// Identity of a class metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassRef(usize);

impl ClassRef {
    pub fn from_ptr<T>(meta: *const T) -> Self {
        Self(meta as usize)
    }

    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> usize {
        self.0
    }
}

/// Address of a dispatch table. [`VtablePtr::NULL`] is a sentinel value used
/// as a key component, not an absent table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VtablePtr(usize);

impl VtablePtr {
    pub const NULL: Self = Self(0);

    pub fn from_ptr(table: *const usize) -> Self {
        Self(table as usize)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn as_ptr(self) -> *mut usize {
        self.0 as *mut usize
    }
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("a hook engine is already active in this process")]
    EngineActive,

    #[error("hook engine has already been started")]
    AlreadyStarted,

    #[error("{kind} hook for '{class_name}' at depth {depth} is already registered")]
    DuplicateRegistration {
        class_name: String,
        kind: HookKind,
        depth: InheritanceDepth,
    },

    #[error("no hook template for {0}")]
    UnknownHook(ClassHookSpec),

    #[error("member function is not virtual ({abi} ABI)")]
    NonVirtualMember { abi: &'static str },

    #[error("member function belongs to a multiply inherited class ({abi} ABI)")]
    MultipleInheritance { abi: &'static str },

    #[error("slot {slot} is outside the {table_len}-entry dispatch table")]
    SlotOutOfRange { slot: SlotIndex, table_len: usize },

    #[error("slot {0} is replaced twice")]
    DuplicateSlot(SlotIndex),

    #[error("per-object hook for '{class_name}' must use depth 0, got {depth}")]
    PerObjectDepth {
        class_name: String,
        depth: InheritanceDepth,
    },

    #[error("lifecycle subscription for '{class_name}' failed: {reason}")]
    SubscriptionFailed { class_name: String, reason: String },

    #[error("allocation failed while building a dispatch table")]
    AllocationFailed,

    #[error("failed to change dispatch table protection (errno {errno})")]
    ProtectionFailed { errno: i32 },

    #[error("shared dispatch table is still referenced by {0} objects")]
    EntryInUse(usize),

    #[error("table pointer of object 0x{0:x} changed while it was being hooked")]
    TableRaced(usize),

    #[error("table 0x{table:x} is already patched by a shared hook at depth {depth}")]
    TablePatched { table: usize, depth: InheritanceDepth },

    #[error("unsupported on this platform")]
    Unsupported,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, HookError>;
