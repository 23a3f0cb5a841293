//! Capabilities the hooking engine consumes from the host object runtime.
//!
//! The host owns object creation, destruction and reference counting. The
//! engine only reads class metadata, subscribes to lifecycle notifications and
//! walks the live object tree once at startup.

use std::sync::Arc;

use thiserror::Error;

use crate::types::{ClassRef, ObjectRef};

/// Lifecycle notifications a subscription can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The object has been created and published for the first time.
    FirstPublished,
    /// The object is about to be destroyed; its memory is still valid.
    AboutToTerminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Called by the host with the object an event fired for. The return value
/// tells the host whether its default action should proceed.
pub type NotificationHandler = Arc<dyn Fn(ObjectRef) -> bool + Send + Sync>;

/// Memory protection of a class dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableProtection {
    #[default]
    Writable,
    /// The table lives in read-only pages; patching must lift the protection
    /// for the duration of the write.
    ReadOnly,
}

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct RuntimeError(pub String);

pub trait ObjectRuntime: Send + Sync {
    /// Exact (most-derived) class of `object`.
    fn class_of(&self, object: ObjectRef) -> ClassRef;

    fn class_name(&self, class: ClassRef) -> Arc<str>;

    /// `None` at the root of the hierarchy.
    fn superclass(&self, class: ClassRef) -> Option<ClassRef>;

    fn class_named(&self, name: &str) -> Option<ClassRef>;

    /// Number of entries in the dispatch table of `class`.
    fn table_len(&self, class: ClassRef) -> usize;

    fn table_protection(&self, _class: ClassRef) -> TableProtection {
        TableProtection::Writable
    }

    /// Whether `object` can be viewed as an instance of the class named `class_name`.
    fn is_instance_of(&self, object: ObjectRef, class_name: &str) -> bool {
        let mut class = Some(self.class_of(object));
        while let Some(current) = class {
            if &*self.class_name(current) == class_name {
                return true;
            }
            class = self.superclass(current);
        }
        false
    }

    fn retain(&self, object: ObjectRef);

    fn release(&self, object: ObjectRef);

    /// Objects already being torn down are skipped by the startup walk.
    fn is_terminating(&self, _object: ObjectRef) -> bool {
        false
    }

    /// Subscribe to `event` for objects that are instances of `class_name`.
    /// Hosts may invoke the handler for matching objects before returning.
    fn subscribe(
        &self,
        event: LifecycleEvent,
        class_name: &str,
        handler: NotificationHandler,
    ) -> Result<SubscriptionId, RuntimeError>;

    fn unsubscribe(&self, id: SubscriptionId);

    /// Every currently live object. The sequence is finite and a new call
    /// starts a fresh traversal.
    fn live_objects(&self) -> Box<dyn Iterator<Item = ObjectRef> + '_>;
}
