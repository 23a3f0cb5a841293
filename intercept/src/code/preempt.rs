//! Thread-local "disable preemption" nesting.
//!
//! Table slot writes run inside a [`PreemptionGuard`]. Anything that may block
//! (the state table lock, registry operations) asserts that no guard is held on
//! the current thread.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static DISABLE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether the current thread is allowed to block.
pub fn preemption_enabled() -> bool {
    DISABLE_DEPTH.with(|depth| depth.get() == 0)
}

/// Debug-build check that `operation` runs in a context that may block.
#[inline]
#[track_caller]
pub fn assert_blockable(operation: &str) {
    debug_assert!(
        preemption_enabled(),
        "{operation} called while preemption is disabled"
    );
}

/// RAII guard marking the current thread non-preemptible. Nesting-safe: the
/// thread becomes preemptible again when the outermost guard drops.
pub struct PreemptionGuard {
    // Tied to the thread whose counter it raised.
    _not_send: PhantomData<*const ()>,
}

impl PreemptionGuard {
    pub fn disable() -> Self {
        DISABLE_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for PreemptionGuard {
    fn drop(&mut self) {
        DISABLE_DEPTH.with(|depth| {
            debug_assert!(depth.get() > 0);
            depth.set(depth.get().saturating_sub(1));
        });
    }
}
