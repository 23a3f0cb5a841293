use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[cfg(debug_assertions)]
use std::sync::Mutex;
#[cfg(debug_assertions)]
use std::thread::ThreadId;

use crate::code::preempt::assert_blockable;
use crate::state::entry::{HookEntry, ObjectEntry, VtableEntry, VtableObjectEntry};
use crate::state::key::{HookKey, VtableKey, VtableObjectKey};
use crate::types::{HookError, ObjectRef};
use std::sync::Arc;

type EntryMap = HashMap<HookKey, HookEntry>;

/// Keyed store of hook records behind a readers/writer lock.
///
/// Lookups hand out cloned [`HookEntry`] handles, so a record stays alive for
/// as long as a caller holds it even after it is removed from the table.
pub struct HookStateTable {
    map: RwLock<EntryMap>,
    #[cfg(debug_assertions)]
    exclusive_owner: Mutex<Option<ThreadId>>,
}

impl HookStateTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            map: RwLock::new(HashMap::with_capacity(capacity)),
            #[cfg(debug_assertions)]
            exclusive_owner: Mutex::new(None),
        }
    }

    #[cfg(debug_assertions)]
    fn check_not_owner(&self) {
        let owner = *self.exclusive_owner.lock().unwrap_or_else(|e| e.into_inner());
        if owner == Some(std::thread::current().id()) {
            panic!("re-entrant acquisition of the hook state lock");
        }
    }

    pub fn lock_shared(&self) -> SharedGuard<'_> {
        assert_blockable("HookStateTable::lock_shared");
        #[cfg(debug_assertions)]
        self.check_not_owner();
        SharedGuard {
            map: self.map.read().unwrap_or_else(|e| e.into_inner()),
        }
    }

    pub fn lock_exclusive(&self) -> ExclusiveGuard<'_> {
        assert_blockable("HookStateTable::lock_exclusive");
        #[cfg(debug_assertions)]
        self.check_not_owner();
        let map = self.map.write().unwrap_or_else(|e| e.into_inner());
        #[cfg(debug_assertions)]
        {
            *self.exclusive_owner.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(std::thread::current().id());
        }
        ExclusiveGuard {
            map,
            #[cfg(debug_assertions)]
            owner: &self.exclusive_owner,
        }
    }

    /// Insert `entry` under `key`, replacing any existing entry. Returns
    /// `false` only when `error_if_present` is set and the key is taken.
    pub fn add(&self, key: HookKey, entry: HookEntry, error_if_present: bool) -> bool {
        self.lock_exclusive().add(key, entry, error_if_present)
    }

    pub fn remove(&self, key: &HookKey) -> Option<HookEntry> {
        self.lock_exclusive().remove(key)
    }

    pub fn lookup(&self, key: &HookKey) -> Option<HookEntry> {
        self.lock_shared().lookup(key)
    }

    pub fn len(&self) -> usize {
        self.lock_shared().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HookStateTable {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl std::fmt::Debug for HookStateTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookStateTable").finish_non_exhaustive()
    }
}

/// Read access to the state table.
pub struct SharedGuard<'a> {
    map: RwLockReadGuard<'a, EntryMap>,
}

impl SharedGuard<'_> {
    /// Clone of the entry under `key`, taking a reference on it.
    pub fn lookup(&self, key: &HookKey) -> Option<HookEntry> {
        self.map.get(key).cloned()
    }

    pub fn get(&self, key: &HookKey) -> Option<&HookEntry> {
        self.map.get(key)
    }

    pub fn object_entry(&self, object: ObjectRef) -> Option<Arc<ObjectEntry>> {
        object_entry(&self.map, object)
    }

    pub fn vtable_entry(&self, key: VtableKey) -> Option<Arc<VtableEntry>> {
        vtable_entry(&self.map, key)
    }

    pub fn vtable_object_entry(&self, key: VtableObjectKey) -> Option<Arc<VtableObjectEntry>> {
        vtable_object_entry(&self.map, key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HookKey, &HookEntry)> {
        self.map.iter()
    }
}

/// Write access to the state table. Only one thread holds it at a time.
pub struct ExclusiveGuard<'a> {
    map: RwLockWriteGuard<'a, EntryMap>,
    #[cfg(debug_assertions)]
    owner: &'a Mutex<Option<ThreadId>>,
}

impl ExclusiveGuard<'_> {
    pub fn add(&mut self, key: HookKey, entry: HookEntry, error_if_present: bool) -> bool {
        if error_if_present && self.map.contains_key(&key) {
            return false;
        }
        self.map.insert(key, entry);
        true
    }

    pub fn remove(&mut self, key: &HookKey) -> Option<HookEntry> {
        self.map.remove(key)
    }

    pub fn lookup(&self, key: &HookKey) -> Option<HookEntry> {
        self.map.get(key).cloned()
    }

    pub fn get(&self, key: &HookKey) -> Option<&HookEntry> {
        self.map.get(key)
    }

    pub fn contains(&self, key: &HookKey) -> bool {
        self.map.contains_key(key)
    }

    /// Make room for `additional` inserts up front so a later insert cannot
    /// fail after a table has already been patched.
    pub fn reserve(&mut self, additional: usize) -> Result<(), HookError> {
        self.map
            .try_reserve(additional)
            .map_err(|_| HookError::AllocationFailed)
    }

    pub fn object_entry(&self, object: ObjectRef) -> Option<Arc<ObjectEntry>> {
        object_entry(&self.map, object)
    }

    pub fn vtable_entry(&self, key: VtableKey) -> Option<Arc<VtableEntry>> {
        vtable_entry(&self.map, key)
    }

    pub fn vtable_object_entry(&self, key: VtableObjectKey) -> Option<Arc<VtableObjectEntry>> {
        vtable_object_entry(&self.map, key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn drain(&mut self) -> Vec<(HookKey, HookEntry)> {
        self.map.drain().collect()
    }
}

#[cfg(debug_assertions)]
impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        *self.owner.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

fn object_entry(map: &EntryMap, object: ObjectRef) -> Option<Arc<ObjectEntry>> {
    match map.get(&HookKey::Object(object)) {
        Some(HookEntry::Object(entry)) => Some(Arc::clone(entry)),
        _ => None,
    }
}

fn vtable_entry(map: &EntryMap, key: VtableKey) -> Option<Arc<VtableEntry>> {
    match map.get(&HookKey::Vtable(key)) {
        Some(HookEntry::Vtable(entry)) => Some(Arc::clone(entry)),
        _ => None,
    }
}

fn vtable_object_entry(map: &EntryMap, key: VtableObjectKey) -> Option<Arc<VtableObjectEntry>> {
    match map.get(&HookKey::VtableObject(key)) {
        Some(HookEntry::VtableObject(entry)) => Some(Arc::clone(entry)),
        _ => None,
    }
}
