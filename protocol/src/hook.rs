//! Hook kinds, inheritance depths and dispatch-table slot indices.

use std::fmt;
use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Deepest ancestor a shared hook can be registered for, counted from the leaf class.
pub const MAX_INHERITANCE_DEPTH: u8 = 10;

/// Number of distinct depths (`0..=MAX_INHERITANCE_DEPTH`).
pub const DEPTH_LEVELS: usize = MAX_INHERITANCE_DEPTH as usize + 1;

/// How a hook is applied to the objects of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    /// The object's table pointer is replaced by a private copy; only that
    /// instance is affected.
    PerObject,
    /// Slots of the class table are replaced in place; every instance sharing
    /// the table is affected.
    SharedVtable,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::PerObject => "per_object",
            HookKind::SharedVtable => "shared_vtable",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distance from an object's most-derived class (depth 0) toward its root.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub struct InheritanceDepth(u8);

impl InheritanceDepth {
    /// The leaf class itself.
    pub const LEAF: Self = Self(0);
    pub const MAX: Self = Self(MAX_INHERITANCE_DEPTH);

    pub const fn new(depth: u8) -> Option<Self> {
        if depth <= MAX_INHERITANCE_DEPTH {
            Some(Self(depth))
        } else {
            None
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// Position of this depth in a per-depth table.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// One step toward the root, or `None` past the maximum.
    pub const fn deeper(self) -> Option<Self> {
        Self::new(self.0 + 1)
    }

    /// Every depth from the leaf to the maximum.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..=MAX_INHERITANCE_DEPTH).map(Self)
    }
}

impl TryFrom<u8> for InheritanceDepth {
    type Error = ConfigError;

    fn try_from(depth: u8) -> Result<Self, Self::Error> {
        Self::new(depth).ok_or(ConfigError::DepthOutOfRange(depth))
    }
}

impl From<InheritanceDepth> for u8 {
    fn from(depth: InheritanceDepth) -> Self {
        depth.0
    }
}

impl fmt::Display for InheritanceDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 1-based position of a method in a dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct SlotIndex(NonZeroU32);

impl SlotIndex {
    pub const fn new(index: u32) -> Option<Self> {
        match NonZeroU32::new(index) {
            Some(index) => Some(Self(index)),
            None => None,
        }
    }

    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// Zero-based offset of the slot within the table.
    pub const fn offset(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

impl TryFrom<u32> for SlotIndex {
    type Error = ConfigError;

    fn try_from(index: u32) -> Result<Self, Self::Error> {
        Self::new(index).ok_or(ConfigError::SlotIndexZero)
    }
}

impl From<SlotIndex> for u32 {
    fn from(slot: SlotIndex) -> Self {
        slot.get()
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A class selected for hooking: which class, how, and at what depth.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassHookSpec {
    pub class_name: String,
    pub kind: HookKind,
    #[serde(default)]
    pub depth: InheritanceDepth,
}

impl ClassHookSpec {
    pub fn new(class_name: impl Into<String>, kind: HookKind, depth: InheritanceDepth) -> Self {
        Self {
            class_name: class_name.into(),
            kind,
            depth,
        }
    }
}

impl fmt::Display for ClassHookSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.class_name, self.depth, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_walk_stops_at_maximum() {
        let mut depth = InheritanceDepth::LEAF;
        let mut steps = 0;
        while let Some(next) = depth.deeper() {
            depth = next;
            steps += 1;
        }
        assert_eq!(depth, InheritanceDepth::MAX);
        assert_eq!(steps, MAX_INHERITANCE_DEPTH as usize);
        assert_eq!(InheritanceDepth::all().count(), DEPTH_LEVELS);
    }

    #[test]
    fn depth_rejects_values_past_maximum() {
        assert!(InheritanceDepth::new(MAX_INHERITANCE_DEPTH + 1).is_none());
        assert!(matches!(
            InheritanceDepth::try_from(42u8),
            Err(ConfigError::DepthOutOfRange(42))
        ));
    }

    #[test]
    fn slot_index_is_one_based() {
        assert!(SlotIndex::new(0).is_none());
        let slot = SlotIndex::new(3).unwrap();
        assert_eq!(slot.offset(), 2);
        assert_eq!(slot.to_string(), "3");
    }
}
