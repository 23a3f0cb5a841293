//! Behavioral tests for the hooking engine against the simulated host in
//! `test_utils`.


use std::sync::Arc;

use crate::interceptor::HookDescriptor;
use crate::test_utils::{Method, TestRuntime};
use crate::types::{ClassRef, HookKind, InheritanceDepth, ObjectRef, SlotIndex};

pub(crate) extern "C" fn add_one(_: ObjectRef, x: i64) -> i64 {
    x + 1
}

pub(crate) extern "C" fn add_two(_: ObjectRef, x: i64) -> i64 {
    x + 2
}

pub(crate) extern "C" fn add_three(_: ObjectRef, x: i64) -> i64 {
    x + 3
}

pub(crate) extern "C" fn add_four(_: ObjectRef, x: i64) -> i64 {
    x + 4
}

pub(crate) extern "C" fn times_ten(_: ObjectRef, x: i64) -> i64 {
    x * 10
}

pub(crate) extern "C" fn negate(_: ObjectRef, x: i64) -> i64 {
    -x
}

pub(crate) extern "C" fn square(_: ObjectRef, x: i64) -> i64 {
    x * x
}

pub(crate) const BASE_METHODS: [Method; 4] = [add_one, add_two, add_three, add_four];

pub(crate) fn slot(n: u32) -> SlotIndex {
    SlotIndex::new(n).unwrap()
}

pub(crate) fn depth(n: u8) -> InheritanceDepth {
    InheritanceDepth::new(n).unwrap()
}

/// Root class whose slot N returns `x + N`.
pub(crate) fn base_class(rt: &TestRuntime, name: &str) -> ClassRef {
    rt.define_class(name, None, &[], &BASE_METHODS)
}

pub(crate) fn shared_hook(class_name: &str, at: u8, slot_index: u32, replacement: Method) -> HookDescriptor {
    HookDescriptor::builder(class_name, HookKind::SharedVtable, BASE_METHODS.len())
        .depth(depth(at))
        .replace_slot(slot(slot_index), replacement as usize)
        .build()
        .unwrap()
}

pub(crate) fn per_object_hook(class_name: &str, slot_index: u32, replacement: Method) -> HookDescriptor {
    HookDescriptor::builder(class_name, HookKind::PerObject, BASE_METHODS.len())
        .replace_slot(slot(slot_index), replacement as usize)
        .build()
        .unwrap()
}

pub(crate) fn runtime() -> Arc<TestRuntime> {
    TestRuntime::new()
}
