use crate::types::{ClassRef, InheritanceDepth, ObjectRef, VtablePtr};

/// A class table patched in place for a hook registered at `depth`.
///
/// The same entry is stored under the real table address and under
/// [`VtablePtr::NULL`]; the latter finds the entry from (class, depth) alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VtableKey {
    pub class: ClassRef,
    pub depth: InheritanceDepth,
    pub table: VtablePtr,
}

impl VtableKey {
    pub fn canonical(class: ClassRef, depth: InheritanceDepth) -> Self {
        Self {
            class,
            depth,
            table: VtablePtr::NULL,
        }
    }

    pub fn with_table(class: ClassRef, depth: InheritanceDepth, table: VtablePtr) -> Self {
        Self { class, depth, table }
    }

    pub fn is_canonical(&self) -> bool {
        self.table.is_null()
    }

    pub fn to_canonical(self) -> Self {
        Self::canonical(self.class, self.depth)
    }
}

/// An object taking part in a shared class-table patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VtableObjectKey {
    pub object: ObjectRef,
    pub class: ClassRef,
    pub depth: InheritanceDepth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookKey {
    /// Per-object hook: the object got a private table.
    Object(ObjectRef),
    Vtable(VtableKey),
    VtableObject(VtableObjectKey),
}

impl From<ObjectRef> for HookKey {
    fn from(object: ObjectRef) -> Self {
        HookKey::Object(object)
    }
}

impl From<VtableKey> for HookKey {
    fn from(key: VtableKey) -> Self {
        HookKey::Vtable(key)
    }
}

impl From<VtableObjectKey> for HookKey {
    fn from(key: VtableObjectKey) -> Self {
        HookKey::VtableObject(key)
    }
}
