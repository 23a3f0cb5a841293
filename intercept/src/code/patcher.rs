//! Low-level dispatch-table writes.
//!
//! Every write happens inside a [`PreemptionGuard`]. Tables the host keeps in
//! read-only pages are made writable with `mprotect` for the duration of the
//! write and put back to read-only afterwards.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::code::abi;
use crate::code::preempt::PreemptionGuard;
use crate::runtime::TableProtection;
use crate::types::{HookError, ObjectRef, SlotIndex, VtablePtr};

#[inline]
fn debug_enabled() -> bool {
    std::env::var_os("VTHOOK_DEBUG").is_some()
}

/// Write access to the slots of one table, handed to the `apply` closure of
/// [`patch_table`].
pub struct SlotWriter {
    base: *mut usize,
    len: usize,
}

impl SlotWriter {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write(&self, slot: SlotIndex, address: usize) {
        let offset = slot.offset();
        debug_assert!(
            offset < self.len,
            "slot {slot} outside {}-entry table",
            self.len
        );
        if offset >= self.len {
            return;
        }
        // SAFETY: offset is in bounds of the table `patch_table` was given.
        unsafe {
            let entry = &*(self.base.add(offset) as *const AtomicUsize);
            entry.store(address, Ordering::Release);
        }
        if debug_enabled() {
            log::debug!(
                "patcher: table=0x{:x} slot {} <- 0x{:x}",
                self.base as usize,
                slot,
                address
            );
        }
    }
}

#[cfg(unix)]
mod unix {
    use super::*;

    #[inline]
    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    pub unsafe fn with_writable(addr: *mut u8, size: usize, apply: impl FnOnce()) -> Result<(), HookError> {
        let page_sz = page_size();
        let page_start = (addr as usize) & !(page_sz - 1);
        let page_end = ((addr as usize) + size + page_sz - 1) & !(page_sz - 1);
        let map_size = page_end - page_start;

        if libc::mprotect(
            page_start as *mut libc::c_void,
            map_size,
            libc::PROT_READ | libc::PROT_WRITE,
        ) != 0
        {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(HookError::ProtectionFailed { errno });
        }

        apply();

        if libc::mprotect(page_start as *mut libc::c_void, map_size, libc::PROT_READ) != 0 {
            log::warn!(
                "patcher: table pages at 0x{:x} left writable (errno {})",
                page_start,
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
            );
        }
        Ok(())
    }
}

/// Patch entries of the `len`-entry table at `table`.
///
/// # Safety
/// `table` must point to `len` words of table memory with the given
/// protection. `apply` may only write through the [`SlotWriter`].
pub unsafe fn patch_table(
    table: VtablePtr,
    len: usize,
    protection: TableProtection,
    apply: impl FnOnce(&SlotWriter),
) -> Result<(), HookError> {
    if len == 0 || table.is_null() {
        return Ok(());
    }

    let writer = SlotWriter {
        base: table.as_ptr(),
        len,
    };
    let _guard = PreemptionGuard::disable();

    match protection {
        TableProtection::Writable => {
            apply(&writer);
            Ok(())
        }
        TableProtection::ReadOnly => {
            #[cfg(unix)]
            {
                unix::with_writable(
                    table.as_ptr() as *mut u8,
                    len * core::mem::size_of::<usize>(),
                    || apply(&writer),
                )
            }
            #[cfg(not(unix))]
            {
                let _ = apply;
                Err(HookError::Unsupported)
            }
        }
    }
}

/// Point `object` at `new` if it still uses `expected`.
pub fn repoint_object(object: ObjectRef, expected: VtablePtr, new: VtablePtr) -> bool {
    let _guard = PreemptionGuard::disable();
    let swapped = abi::swap_table(object, expected, new);
    if debug_enabled() {
        log::debug!(
            "patcher: object 0x{:x} table 0x{:x} -> 0x{:x} ({})",
            object.addr(),
            expected.addr(),
            new.addr(),
            if swapped { "ok" } else { "changed underneath" }
        );
    }
    swapped
}
