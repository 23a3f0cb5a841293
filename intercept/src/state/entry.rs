use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::runtime::TableProtection;
use crate::state::key::{VtableKey, VtableObjectKey};
use crate::types::{ClassRef, HookError, InheritanceDepth, ObjectRef, SlotIndex, VtablePtr};

/// One replaced table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookedSlot {
    pub index: SlotIndex,
    /// Address found in the slot before the hook was applied.
    pub original: usize,
    pub replacement: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Object,
    VtableObject,
    Vtable,
}

/// A reference-counted handle to hook state. Cloning takes a reference.
#[derive(Debug, Clone)]
pub enum HookEntry {
    Object(Arc<ObjectEntry>),
    VtableObject(Arc<VtableObjectEntry>),
    Vtable(Arc<VtableEntry>),
}

impl HookEntry {
    pub fn kind(&self) -> EntryKind {
        match self {
            HookEntry::Object(_) => EntryKind::Object,
            HookEntry::VtableObject(_) => EntryKind::VtableObject,
            HookEntry::Vtable(_) => EntryKind::Vtable,
        }
    }

    /// Slot records; a VtableObject entry sees those of its Vtable owner.
    pub fn slots(&self) -> &[HookedSlot] {
        match self {
            HookEntry::Object(entry) => entry.slots(),
            HookEntry::VtableObject(entry) => entry.vtable().slots(),
            HookEntry::Vtable(entry) => entry.slots(),
        }
    }

    pub fn same_entry(&self, other: &HookEntry) -> bool {
        match (self, other) {
            (HookEntry::Object(a), HookEntry::Object(b)) => Arc::ptr_eq(a, b),
            (HookEntry::VtableObject(a), HookEntry::VtableObject(b)) => Arc::ptr_eq(a, b),
            (HookEntry::Vtable(a), HookEntry::Vtable(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Table copy owned by one object.
#[derive(Debug)]
pub struct PrivateTable(Box<[AtomicUsize]>);

impl PrivateTable {
    /// Copy `len` entries of `table`.
    ///
    /// # Safety
    /// `table` must point to at least `len` readable words.
    pub(crate) unsafe fn copy_from(table: VtablePtr, len: usize) -> Result<Self, HookError> {
        let mut entries: Vec<AtomicUsize> = Vec::new();
        entries
            .try_reserve_exact(len)
            .map_err(|_| HookError::AllocationFailed)?;
        for offset in 0..len {
            entries.push(AtomicUsize::new(crate::code::abi::read_entry(table, offset)));
        }
        Ok(Self(entries.into_boxed_slice()))
    }

    pub fn ptr(&self) -> VtablePtr {
        VtablePtr::from_ptr(self.0.as_ptr() as *const usize)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, offset: usize) -> Option<usize> {
        self.0.get(offset).map(|entry| entry.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, slot: SlotIndex, address: usize) {
        if let Some(entry) = self.0.get(slot.offset()) {
            entry.store(address, Ordering::Release);
        }
    }
}

/// Per-object hook: the object points at a private, patched table copy.
#[derive(Debug)]
pub struct ObjectEntry {
    object: ObjectRef,
    slots: Arc<[HookedSlot]>,
    original_table: VtablePtr,
    private: PrivateTable,
}

impl ObjectEntry {
    pub(crate) fn new(
        object: ObjectRef,
        slots: Arc<[HookedSlot]>,
        original_table: VtablePtr,
        private: PrivateTable,
    ) -> Self {
        Self {
            object,
            slots,
            original_table,
            private,
        }
    }

    pub fn object(&self) -> ObjectRef {
        self.object
    }

    pub fn slots(&self) -> &[HookedSlot] {
        &self.slots
    }

    /// Table the object used before it was hooked.
    pub fn original_table(&self) -> VtablePtr {
        self.original_table
    }

    pub fn private_table(&self) -> VtablePtr {
        self.private.ptr()
    }

    pub fn table_len(&self) -> usize {
        self.private.len()
    }

    /// Pre-hook address of `slot`. Slots the hook leaves alone still hold
    /// their original value in the private copy.
    pub fn original(&self, slot: SlotIndex) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| s.index == slot)
            .map(|s| s.original)
            .or_else(|| self.private.get(slot.offset()))
    }
}

/// An object participating in a shared class-table patch.
#[derive(Debug)]
pub struct VtableObjectEntry {
    key: VtableObjectKey,
    vtable: Arc<VtableEntry>,
    original_table: VtablePtr,
}

impl VtableObjectEntry {
    pub(crate) fn new(key: VtableObjectKey, vtable: Arc<VtableEntry>, original_table: VtablePtr) -> Self {
        Self {
            key,
            vtable,
            original_table,
        }
    }

    pub fn key(&self) -> VtableObjectKey {
        self.key
    }

    pub fn object(&self) -> ObjectRef {
        self.key.object
    }

    pub fn vtable(&self) -> &Arc<VtableEntry> {
        &self.vtable
    }

    pub fn original_table(&self) -> VtablePtr {
        self.original_table
    }
}

/// A class table patched in place, shared by every instance of the class.
///
/// `ref_count` tracks the live [`VtableObjectEntry`] records pointing here and
/// is only changed under the state table's exclusive lock.
#[derive(Debug)]
pub struct VtableEntry {
    key: VtableKey,
    slots: Arc<[HookedSlot]>,
    snapshot: Box<[usize]>,
    protection: TableProtection,
    ref_count: AtomicUsize,
}

impl VtableEntry {
    pub(crate) fn new(
        key: VtableKey,
        slots: Arc<[HookedSlot]>,
        snapshot: Box<[usize]>,
        protection: TableProtection,
    ) -> Self {
        debug_assert!(!key.is_canonical());
        Self {
            key,
            slots,
            snapshot,
            protection,
            ref_count: AtomicUsize::new(0),
        }
    }

    /// Key under the live table address.
    pub fn key(&self) -> VtableKey {
        self.key
    }

    pub fn canonical_key(&self) -> VtableKey {
        self.key.to_canonical()
    }

    pub fn class(&self) -> ClassRef {
        self.key.class
    }

    pub fn depth(&self) -> InheritanceDepth {
        self.key.depth
    }

    pub fn table(&self) -> VtablePtr {
        self.key.table
    }

    /// Effective table length, widened to the real leaf class table.
    pub fn table_len(&self) -> usize {
        self.snapshot.len()
    }

    pub fn slots(&self) -> &[HookedSlot] {
        &self.slots
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn protection(&self) -> TableProtection {
        self.protection
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Pre-hook address of `slot` from the snapshot taken before patching.
    pub fn original(&self, slot: SlotIndex) -> Option<usize> {
        self.snapshot.get(slot.offset()).copied()
    }

    pub(crate) fn add_reference(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn release_reference(&self) -> usize {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "shared table entry released too often");
        previous.saturating_sub(1)
    }
}

impl Drop for VtableEntry {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert_eq!(
                self.ref_count(),
                0,
                "shared table entry finalized while still referenced"
            );
        }
    }
}
