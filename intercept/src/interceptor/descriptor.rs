use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::code::abi::{compute_slot_index, VtableAbi};
use crate::types::{
    ClassHookSpec, ConfigError, HookError, HookKind, InheritanceDepth, ObjectRef, SlotIndex,
};

/// Host-facing lifecycle callback. The return value is handed back to the host
/// as "proceed with the default action".
pub type LifecycleCallback = Arc<dyn Fn(ObjectRef) -> bool + Send + Sync>;

/// Optional per-registration callbacks run by the lifecycle adapters.
#[derive(Clone, Default)]
pub struct LifecycleListener {
    pub on_first_publish: Option<LifecycleCallback>,
    pub on_terminate: Option<LifecycleCallback>,
}

impl LifecycleListener {
    /// `false` means the object should not be hooked.
    pub fn first_published(&self, object: ObjectRef) -> bool {
        self.on_first_publish.as_ref().map_or(true, |cb| cb(object))
    }

    pub fn terminating(&self, object: ObjectRef) -> bool {
        self.on_terminate.as_ref().map_or(true, |cb| cb(object))
    }
}

impl fmt::Debug for LifecycleListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleListener")
            .field("on_first_publish", &self.on_first_publish.is_some())
            .field("on_terminate", &self.on_terminate.is_some())
            .finish()
    }
}

/// Address written into one slot while a hook is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotReplacement {
    pub index: SlotIndex,
    pub replacement: usize,
}

/// Immutable description of one hooked class.
#[derive(Debug, Clone)]
pub struct HookDescriptor {
    class_name: Arc<str>,
    kind: HookKind,
    depth: InheritanceDepth,
    table_len: usize,
    replacements: Arc<[SlotReplacement]>,
    listener: LifecycleListener,
}

impl HookDescriptor {
    /// Start describing a hook on `class_name`, whose dispatch table has
    /// `table_len` entries.
    pub fn builder(
        class_name: impl Into<Arc<str>>,
        kind: HookKind,
        table_len: usize,
    ) -> HookDescriptorBuilder {
        HookDescriptorBuilder {
            class_name: class_name.into(),
            kind,
            depth: InheritanceDepth::LEAF,
            table_len,
            replacements: Vec::new(),
            listener: LifecycleListener::default(),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn class_name_arc(&self) -> Arc<str> {
        Arc::clone(&self.class_name)
    }

    pub fn kind(&self) -> HookKind {
        self.kind
    }

    pub fn depth(&self) -> InheritanceDepth {
        self.depth
    }

    pub fn table_len(&self) -> usize {
        self.table_len
    }

    pub fn replacements(&self) -> &[SlotReplacement] {
        &self.replacements
    }

    pub fn listener(&self) -> &LifecycleListener {
        &self.listener
    }

    pub fn spec(&self) -> ClassHookSpec {
        ClassHookSpec::new(self.class_name.to_string(), self.kind, self.depth)
    }

    /// Same hook registered at another depth. Used to instantiate one class
    /// template for each configured depth.
    pub fn at_depth(&self, depth: InheritanceDepth) -> Result<HookDescriptor, HookError> {
        check_depth(&self.class_name, self.kind, depth)?;
        Ok(HookDescriptor {
            depth,
            ..self.clone()
        })
    }
}

fn check_depth(class_name: &str, kind: HookKind, depth: InheritanceDepth) -> Result<(), HookError> {
    if kind == HookKind::PerObject && depth != InheritanceDepth::LEAF {
        return Err(HookError::PerObjectDepth {
            class_name: class_name.to_string(),
            depth,
        });
    }
    Ok(())
}

#[derive(Debug)]
pub struct HookDescriptorBuilder {
    class_name: Arc<str>,
    kind: HookKind,
    depth: InheritanceDepth,
    table_len: usize,
    replacements: Vec<SlotReplacement>,
    listener: LifecycleListener,
}

impl HookDescriptorBuilder {
    pub fn depth(mut self, depth: InheritanceDepth) -> Self {
        self.depth = depth;
        self
    }

    pub fn replace_slot(mut self, index: SlotIndex, replacement: usize) -> Self {
        self.replacements.push(SlotReplacement { index, replacement });
        self
    }

    /// Replace the slot `member` dispatches through, decoded with `abi`.
    pub fn replace_member<A: VtableAbi>(
        self,
        abi: &A,
        member: A::MemberFn,
        replacement: usize,
    ) -> Result<Self, HookError> {
        let index = compute_slot_index(abi, member)?;
        Ok(self.replace_slot(index, replacement))
    }

    pub fn on_first_publish(mut self, callback: impl Fn(ObjectRef) -> bool + Send + Sync + 'static) -> Self {
        self.listener.on_first_publish = Some(Arc::new(callback));
        self
    }

    pub fn on_terminate(mut self, callback: impl Fn(ObjectRef) -> bool + Send + Sync + 'static) -> Self {
        self.listener.on_terminate = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Result<HookDescriptor, HookError> {
        if self.class_name.is_empty() {
            return Err(ConfigError::EmptyClassName.into());
        }
        check_depth(&self.class_name, self.kind, self.depth)?;

        let mut seen = HashSet::with_capacity(self.replacements.len());
        for r in &self.replacements {
            if r.index.offset() >= self.table_len {
                return Err(HookError::SlotOutOfRange {
                    slot: r.index,
                    table_len: self.table_len,
                });
            }
            if !seen.insert(r.index) {
                return Err(HookError::DuplicateSlot(r.index));
            }
        }

        Ok(HookDescriptor {
            class_name: self.class_name,
            kind: self.kind,
            depth: self.depth,
            table_len: self.table_len,
            replacements: self.replacements.into(),
            listener: self.listener,
        })
    }
}
