//! Applies and removes dispatch-table hooks.
//!
//! Two strategies are supported. A shared hook patches the class table in
//! place once and counts the objects using it. A per-object hook gives one
//! object a private patched copy of its table and repoints that object only.

use std::sync::Arc;

use crate::code::abi::{load_table, read_entry};
use crate::code::patcher::{patch_table, repoint_object};
use crate::runtime::{ObjectRuntime, TableProtection};
use crate::state::entry::PrivateTable;
use crate::state::{
    ExclusiveGuard, HookEntry, HookKey, HookStateTable, HookedSlot, ObjectEntry, VtableEntry,
    VtableKey, VtableObjectEntry, VtableObjectKey,
};
use crate::types::{ClassRef, HookError, HookKind, InheritanceDepth, ObjectRef, SlotIndex, VtablePtr};

pub mod descriptor;

pub use descriptor::{HookDescriptor, HookDescriptorBuilder, LifecycleListener, SlotReplacement};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// A table was patched for this object.
    Installed,
    /// The object joined an already patched class table.
    Shared { ref_count: usize },
    /// The object already carries a hook of this kind.
    AlreadyHooked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub object_hook_removed: bool,
    pub shared_detached: usize,
    pub tables_restored: usize,
}

impl ReleaseOutcome {
    pub fn is_noop(&self) -> bool {
        !self.object_hook_removed && self.shared_detached == 0
    }
}

pub struct HookInstaller {
    runtime: Arc<dyn ObjectRuntime>,
    table: HookStateTable,
}

impl HookInstaller {
    pub fn new(runtime: Arc<dyn ObjectRuntime>, capacity: usize) -> Self {
        Self {
            runtime,
            table: HookStateTable::with_capacity(capacity),
        }
    }

    pub fn state(&self) -> &HookStateTable {
        &self.table
    }

    /// Patch the class table of `object` for `descriptor`, or join the patch
    /// another instance of the class already made.
    pub fn install_shared_hook(
        &self,
        object: ObjectRef,
        descriptor: &HookDescriptor,
    ) -> Result<InstallOutcome, HookError> {
        debug_assert_eq!(descriptor.kind(), HookKind::SharedVtable);
        let class = self.runtime.class_of(object);
        let depth = descriptor.depth();
        let table_len = descriptor.table_len().max(self.runtime.table_len(class));
        let protection = self.runtime.table_protection(class);

        let mut guard = self.table.lock_exclusive();

        let link_key = VtableObjectKey { object, class, depth };
        if guard.contains(&link_key.into()) {
            return Ok(InstallOutcome::AlreadyHooked);
        }

        // A per-object hook may have repointed the object already; the shared
        // patch always targets the class table.
        let class_table = guard
            .object_entry(object)
            .map(|entry| entry.original_table())
            .unwrap_or_else(|| load_table(object));

        if let Some(vtable) = guard.vtable_entry(VtableKey::canonical(class, depth)) {
            guard.reserve(1)?;
            let ref_count = vtable.add_reference();
            let link = VtableObjectEntry::new(link_key, Arc::clone(&vtable), class_table);
            guard.add(link_key.into(), HookEntry::VtableObject(Arc::new(link)), false);
            log::debug!(
                "shared hook {}@{}: object 0x{:x} joined table 0x{:x} (refs {})",
                descriptor.class_name(),
                depth,
                object.addr(),
                vtable.table().addr(),
                ref_count
            );
            return Ok(InstallOutcome::Shared { ref_count });
        }

        // One in-place patch per live table: a second depth would snapshot the
        // first patch's replacements as originals.
        if let Some(patched_at) = InheritanceDepth::all()
            .filter(|d| *d != depth)
            .find(|d| guard.contains(&VtableKey::with_table(class, *d, class_table).into()))
        {
            log::warn!(
                "shared hook {}@{}: table 0x{:x} of class '{}' is already patched at depth {}",
                descriptor.class_name(),
                depth,
                class_table.addr(),
                self.runtime.class_name(class),
                patched_at
            );
            return Err(HookError::TablePatched {
                table: class_table.addr(),
                depth: patched_at,
            });
        }

        let snapshot = snapshot_table(class_table, table_len)?;
        let slots = hooked_slots(descriptor, |slot| snapshot.get(slot.offset()).copied())?;
        guard.reserve(3)?;

        // SAFETY: the class table of a live object has at least `table_len`
        // entries as reported by the host.
        unsafe {
            patch_table(class_table, table_len, protection, |w| {
                for s in slots.iter() {
                    w.write(s.index, s.replacement);
                }
            })?;
        }

        let live_key = VtableKey::with_table(class, depth, class_table);
        let vtable = Arc::new(VtableEntry::new(live_key, slots, snapshot, protection));
        vtable.add_reference();
        guard.add(live_key.into(), HookEntry::Vtable(Arc::clone(&vtable)), false);
        guard.add(
            live_key.to_canonical().into(),
            HookEntry::Vtable(Arc::clone(&vtable)),
            false,
        );
        let link = VtableObjectEntry::new(link_key, vtable, class_table);
        guard.add(link_key.into(), HookEntry::VtableObject(Arc::new(link)), false);

        log::debug!(
            "shared hook {}@{}: patched table 0x{:x} ({} slots) for class '{}'",
            descriptor.class_name(),
            depth,
            class_table.addr(),
            descriptor.replacements().len(),
            self.runtime.class_name(class)
        );
        Ok(InstallOutcome::Installed)
    }

    /// Give `object` a private, patched copy of its table.
    pub fn install_per_object_hook(
        &self,
        object: ObjectRef,
        descriptor: &HookDescriptor,
    ) -> Result<InstallOutcome, HookError> {
        debug_assert_eq!(descriptor.kind(), HookKind::PerObject);
        let class = self.runtime.class_of(object);
        let table_len = descriptor.table_len().max(self.runtime.table_len(class));

        let mut guard = self.table.lock_exclusive();
        if guard.contains(&HookKey::Object(object)) {
            return Ok(InstallOutcome::AlreadyHooked);
        }

        let current = load_table(object);
        // SAFETY: see install_shared_hook.
        let private = unsafe { PrivateTable::copy_from(current, table_len)? };
        let slots = hooked_slots(descriptor, |slot| private.get(slot.offset()))?;
        guard.reserve(1)?;

        // SAFETY: the private table was just allocated with `table_len` entries.
        unsafe {
            patch_table(private.ptr(), private.len(), TableProtection::Writable, |w| {
                for s in slots.iter() {
                    w.write(s.index, s.replacement);
                }
            })?;
        }

        let private_ptr = private.ptr();
        let entry = Arc::new(ObjectEntry::new(object, slots, current, private));
        if !repoint_object(object, current, private_ptr) {
            log::error!(
                "per-object hook {}: table of object 0x{:x} changed underneath",
                descriptor.class_name(),
                object.addr()
            );
            return Err(HookError::TableRaced(object.addr()));
        }
        guard.add(HookKey::Object(object), HookEntry::Object(entry), false);

        log::debug!(
            "per-object hook {}: object 0x{:x} table 0x{:x} -> 0x{:x}",
            descriptor.class_name(),
            object.addr(),
            current.addr(),
            private_ptr.addr()
        );
        Ok(InstallOutcome::Installed)
    }

    /// Undo the memory effect of `entry`. The entry must already be out of
    /// the table; a shared entry must have no remaining references.
    pub fn uninstall(&self, _guard: &ExclusiveGuard<'_>, entry: &HookEntry) -> Result<(), HookError> {
        match entry {
            HookEntry::Vtable(vtable) => {
                let refs = vtable.ref_count();
                if refs != 0 {
                    debug_assert!(false, "uninstalling shared table still used by {refs} objects");
                    return Err(HookError::EntryInUse(refs));
                }
                // SAFETY: the table was patched with this length and protection.
                unsafe {
                    patch_table(vtable.table(), vtable.table_len(), vtable.protection(), |w| {
                        for s in vtable.slots() {
                            w.write(s.index, s.original);
                        }
                    })?;
                }
                log::debug!(
                    "restored shared table 0x{:x} (depth {})",
                    vtable.table().addr(),
                    vtable.depth()
                );
            }
            HookEntry::Object(object) => {
                let target = object.object();
                if !repoint_object(target, object.private_table(), object.original_table()) {
                    log::warn!(
                        "object 0x{:x} no longer uses its private table; left as is",
                        target.addr()
                    );
                } else {
                    log::debug!(
                        "object 0x{:x} back on table 0x{:x}",
                        target.addr(),
                        object.original_table().addr()
                    );
                }
            }
            HookEntry::VtableObject(_) => {}
        }
        Ok(())
    }

    /// Drop every hook state record of `object`. Releasing an object that
    /// holds no hooks is a no-op.
    pub fn release_object(&self, object: ObjectRef) -> ReleaseOutcome {
        let class = self.runtime.class_of(object);
        let mut outcome = ReleaseOutcome::default();
        let mut guard = self.table.lock_exclusive();

        if let Some(entry) = guard.remove(&HookKey::Object(object)) {
            if let Err(err) = self.uninstall(&guard, &entry) {
                log::warn!("failed to remove hook of object 0x{:x}: {err}", object.addr());
            }
            outcome.object_hook_removed = true;
        }

        for depth in InheritanceDepth::all() {
            let key = VtableObjectKey { object, class, depth };
            let Some(HookEntry::VtableObject(link)) = guard.remove(&key.into()) else {
                continue;
            };
            outcome.shared_detached += 1;

            let vtable = link.vtable();
            let remaining = vtable.release_reference();
            log::debug!(
                "object 0x{:x} left shared table 0x{:x} (refs {})",
                object.addr(),
                vtable.table().addr(),
                remaining
            );
            if remaining == 0 && self.retire_vtable(&mut guard, vtable) {
                outcome.tables_restored += 1;
            }
        }
        outcome
    }

    fn retire_vtable(&self, guard: &mut ExclusiveGuard<'_>, vtable: &Arc<VtableEntry>) -> bool {
        guard.remove(&vtable.canonical_key().into());
        let Some(entry) = guard.remove(&vtable.key().into()) else {
            debug_assert!(false, "shared table entry missing from state table");
            log::error!("shared table 0x{:x} has no state entry", vtable.table().addr());
            return false;
        };
        match self.uninstall(guard, &entry) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("failed to restore shared table 0x{:x}: {err}", vtable.table().addr());
                false
            }
        }
    }

    /// Pre-hook address of `slot` as seen by the `kind` hook on `object`.
    pub fn original_function(&self, object: ObjectRef, kind: HookKind, slot: SlotIndex) -> Option<usize> {
        match kind {
            HookKind::PerObject => self
                .table
                .lock_shared()
                .object_entry(object)
                .and_then(|entry| entry.original(slot)),
            HookKind::SharedVtable => {
                let class = self.runtime.class_of(object);
                let guard = self.table.lock_shared();
                InheritanceDepth::all().find_map(|depth| {
                    guard
                        .vtable_object_entry(VtableObjectKey { object, class, depth })
                        .and_then(|link| link.vtable().original(slot))
                })
            }
        }
    }

    pub fn shared_entry(&self, class: ClassRef, depth: InheritanceDepth) -> Option<Arc<VtableEntry>> {
        self.table
            .lock_shared()
            .vtable_entry(VtableKey::canonical(class, depth))
    }

    pub fn object_entry(&self, object: ObjectRef) -> Option<Arc<ObjectEntry>> {
        self.table.lock_shared().object_entry(object)
    }

    /// Number of class tables currently patched in place.
    pub fn shared_tables(&self) -> usize {
        self.table
            .lock_shared()
            .iter()
            .filter(|(key, _)| matches!(key, HookKey::Vtable(k) if !k.is_canonical()))
            .count()
    }

    /// Number of objects running on a private table.
    pub fn hooked_objects(&self) -> usize {
        self.table
            .lock_shared()
            .iter()
            .filter(|(key, _)| matches!(key, HookKey::Object(_)))
            .count()
    }

    /// Remove every hook. Objects go back to their class tables first, then
    /// the class tables are restored.
    pub fn uninstall_all(&self) -> usize {
        let mut guard = self.table.lock_exclusive();
        let entries = guard.drain();
        let mut removed = 0;

        for (_, entry) in &entries {
            if let HookEntry::VtableObject(link) = entry {
                link.vtable().release_reference();
            }
        }
        for (_, entry) in entries.iter().filter(|(_, e)| matches!(e, HookEntry::Object(_))) {
            if self.uninstall(&guard, entry).is_ok() {
                removed += 1;
            }
        }
        for (key, entry) in &entries {
            if matches!(key, HookKey::Vtable(k) if !k.is_canonical()) {
                match self.uninstall(&guard, entry) {
                    Ok(()) => removed += 1,
                    Err(err) => log::warn!("failed to restore shared table: {err}"),
                }
            }
        }

        if removed > 0 {
            log::info!("removed {removed} hooks");
        }
        removed
    }
}

impl std::fmt::Debug for HookInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookInstaller").field("table", &self.table).finish_non_exhaustive()
    }
}

fn snapshot_table(table: VtablePtr, len: usize) -> Result<Box<[usize]>, HookError> {
    let mut snapshot = Vec::new();
    snapshot
        .try_reserve_exact(len)
        .map_err(|_| HookError::AllocationFailed)?;
    for offset in 0..len {
        // SAFETY: callers pass the length of a live table.
        snapshot.push(unsafe { read_entry(table, offset) });
    }
    Ok(snapshot.into_boxed_slice())
}

fn hooked_slots(
    descriptor: &HookDescriptor,
    original: impl Fn(SlotIndex) -> Option<usize>,
) -> Result<Arc<[HookedSlot]>, HookError> {
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(descriptor.replacements().len())
        .map_err(|_| HookError::AllocationFailed)?;
    for r in descriptor.replacements() {
        let original = original(r.index).ok_or(HookError::SlotOutOfRange {
            slot: r.index,
            table_len: descriptor.table_len(),
        })?;
        slots.push(HookedSlot {
            index: r.index,
            original,
            replacement: r.replacement,
        });
    }
    Ok(slots.into())
}
