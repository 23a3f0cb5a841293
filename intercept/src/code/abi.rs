//! ABI knowledge: how member-function pointers encode a virtual slot, and
//! where an object keeps its dispatch-table pointer.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::types::{HookError, ObjectRef, SlotIndex, VtablePtr};

const WORD: usize = core::mem::size_of::<usize>();

/// Decodes member-function pointers of one C++ ABI into dispatch-table slots.
pub trait VtableAbi {
    type MemberFn: Copy;

    const NAME: &'static str;

    /// 1-based slot of a virtual member. Non-virtual members and members of
    /// multiply inherited classes are rejected.
    fn slot_index(&self, member: Self::MemberFn) -> Result<SlotIndex, HookError>;
}

/// Itanium C++ ABI pointer-to-member-function (x86_64 layout).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItaniumMemberFn {
    /// Function address, or `1 + vtable byte offset` for virtual members.
    pub ptr: usize,
    /// `this` adjustment; non-zero only under multiple inheritance.
    pub adj: isize,
}

impl ItaniumMemberFn {
    /// Encoding the compiler emits for the virtual member in `slot`.
    pub const fn virtual_slot(slot: SlotIndex) -> Self {
        Self {
            ptr: slot.offset() * WORD + 1,
            adj: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ItaniumAbi;

impl VtableAbi for ItaniumAbi {
    type MemberFn = ItaniumMemberFn;

    const NAME: &'static str = "itanium";

    fn slot_index(&self, member: ItaniumMemberFn) -> Result<SlotIndex, HookError> {
        if member.ptr & 1 == 0 {
            return Err(HookError::NonVirtualMember { abi: Self::NAME });
        }
        if member.adj != 0 {
            return Err(HookError::MultipleInheritance { abi: Self::NAME });
        }
        let offset = member.ptr - 1;
        if offset % WORD != 0 {
            return Err(HookError::NonVirtualMember { abi: Self::NAME });
        }
        u32::try_from(offset / WORD + 1)
            .ok()
            .and_then(SlotIndex::new)
            .ok_or(HookError::NonVirtualMember { abi: Self::NAME })
    }
}

/// gcc 2.95 (`-fapple-kext`) pointer-to-member-function.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyMemberFn {
    pub this_offset: u16,
    /// 1-based slot for virtual members, negative otherwise.
    pub vtable_index: i16,
    /// Function address or vtable offset, unused for decoding.
    pub target: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyKextAbi;

impl VtableAbi for LegacyKextAbi {
    type MemberFn = LegacyMemberFn;

    const NAME: &'static str = "legacy-kext";

    fn slot_index(&self, member: LegacyMemberFn) -> Result<SlotIndex, HookError> {
        if member.this_offset != 0 {
            return Err(HookError::MultipleInheritance { abi: Self::NAME });
        }
        u32::try_from(member.vtable_index)
            .ok()
            .and_then(SlotIndex::new)
            .ok_or(HookError::NonVirtualMember { abi: Self::NAME })
    }
}

/// Decode `member` with `abi`, logging the failure as a configuration error.
pub fn compute_slot_index<A: VtableAbi>(abi: &A, member: A::MemberFn) -> Result<SlotIndex, HookError> {
    abi.slot_index(member).inspect_err(|err| {
        log::error!("cannot hook member function: {err}");
    })
}

/// Current dispatch table of `object`.
pub(crate) fn load_table(object: ObjectRef) -> VtablePtr {
    // SAFETY: ObjectRef guarantees a live object with a RawObject header.
    let header = unsafe { &*object.as_ptr() };
    VtablePtr::from_ptr(header.table.load(Ordering::Acquire))
}

/// Repoint `object` from `expected` to `new`. Fails if someone else changed
/// the table pointer in between.
pub(crate) fn swap_table(object: ObjectRef, expected: VtablePtr, new: VtablePtr) -> bool {
    // SAFETY: ObjectRef guarantees a live object with a RawObject header.
    let header = unsafe { &*object.as_ptr() };
    header
        .table
        .compare_exchange(
            expected.as_ptr(),
            new.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
}

/// Read the entry at `offset` of `table`.
///
/// # Safety
/// `table` must point to at least `offset + 1` readable words.
pub(crate) unsafe fn read_entry(table: VtablePtr, offset: usize) -> usize {
    let slot = &*(table.as_ptr().add(offset) as *const AtomicUsize);
    slot.load(Ordering::Acquire)
}
