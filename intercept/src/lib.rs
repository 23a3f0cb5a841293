//! vthook-intercept: dispatch-table hooking for objects of a host runtime.

pub mod code;
pub mod engine;
pub mod interceptor;
pub mod runtime;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

#[cfg(test)]
mod tests;

// Re-exports for convenience (flattened imports)
pub use code::abi::{compute_slot_index, ItaniumAbi, ItaniumMemberFn, LegacyKextAbi, LegacyMemberFn, VtableAbi};
pub use engine::{Engine, HookCatalog, HookOutcome, WalkReport};
pub use interceptor::{
    HookDescriptor, HookDescriptorBuilder, HookInstaller, InstallOutcome, LifecycleListener,
    ReleaseOutcome, SlotReplacement,
};
pub use runtime::{LifecycleEvent, NotificationHandler, ObjectRuntime, RuntimeError, SubscriptionId, TableProtection};
pub use types::{ClassRef, HookError, ObjectRef, RawObject, VtablePtr};
pub use vthook_protocol::{ClassHookSpec, EngineConfig, HookKind, InheritanceDepth, SlotIndex};

/// Process-global lock for tests that create the engine or patch dispatch tables.
///
/// Only one engine may exist per process, so every test that builds one must
/// hold this lock.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
