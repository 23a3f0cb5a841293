//! Hook state: what is hooked, the saved originals, and who shares what.

pub mod entry;
pub mod key;
pub mod table;

pub use entry::{EntryKind, HookEntry, HookedSlot, ObjectEntry, VtableEntry, VtableObjectEntry};
pub use key::{HookKey, VtableKey, VtableObjectKey};
pub use table::{ExclusiveGuard, HookStateTable, SharedGuard};
