//! Adapters between host lifecycle notifications and the engine.

use std::sync::{Arc, Weak};

use crate::engine::EngineInner;
use crate::interceptor::HookDescriptor;
use crate::runtime::{LifecycleEvent, NotificationHandler};
use crate::types::ObjectRef;

/// Handler the host calls for `event` on instances of the descriptor's class.
/// Holds the engine weakly; notifications arriving after shutdown only run
/// the registration's callbacks.
pub(super) fn handler(
    event: LifecycleEvent,
    engine: Weak<EngineInner>,
    descriptor: Arc<HookDescriptor>,
) -> NotificationHandler {
    match event {
        LifecycleEvent::FirstPublished => {
            Arc::new(move |object: ObjectRef| on_first_publish(&engine, &descriptor, object))
        }
        LifecycleEvent::AboutToTerminate => {
            Arc::new(move |object: ObjectRef| on_terminate(&engine, &descriptor, object))
        }
    }
}

/// Every matching registration's handler fires for the same object; only
/// the primary one acts, so each callback runs once and a single decline
/// keeps the object unhooked.
fn on_first_publish(engine: &Weak<EngineInner>, descriptor: &Arc<HookDescriptor>, object: ObjectRef) -> bool {
    let Some(engine) = engine.upgrade() else {
        return descriptor.listener().first_published(object);
    };

    let matches = engine.matching(object);
    match matches.primary() {
        None => return descriptor.listener().first_published(object),
        Some(primary) if !Arc::ptr_eq(primary, descriptor) => return true,
        Some(_) => {}
    }

    if !matches.first_published(object) {
        log::debug!(
            "first-publish callback for '{}' declined object 0x{:x}",
            descriptor.class_name(),
            object.addr()
        );
        return false;
    }
    // Failures are logged by the engine; the object simply stays unhooked.
    let _ = engine.apply(object, &matches);
    true
}

fn on_terminate(engine: &Weak<EngineInner>, descriptor: &HookDescriptor, object: ObjectRef) -> bool {
    let proceed = descriptor.listener().terminating(object);
    if let Some(engine) = engine.upgrade() {
        let released = engine.installer.release_object(object);
        if !released.is_noop() {
            log::debug!(
                "object 0x{:x} terminating: {} shared hooks detached, {} tables restored",
                object.addr(),
                released.shared_detached,
                released.tables_restored
            );
        }
    }
    proceed
}
