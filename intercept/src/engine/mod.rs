//! Registry of hooked classes and the per-object dispatch decision.
//!
//! Shared hooks are kept in one dictionary per inheritance depth, per-object
//! hooks in a single dictionary for leaf classes. `Engine::start` registers a
//! set of descriptors and hooks every live object; after that the host's
//! lifecycle notifications keep new and dying objects in sync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use vthook_protocol::EngineConfig;

use crate::code::preempt::assert_blockable;
use crate::interceptor::{HookDescriptor, HookInstaller, InstallOutcome, ReleaseOutcome};
use crate::runtime::{LifecycleEvent, ObjectRuntime, SubscriptionId};
use crate::types::{
    ClassHookSpec, HookError, HookKind, InheritanceDepth, ObjectRef, SlotIndex, DEPTH_LEVELS,
};

mod lifecycle;

static ENGINE_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Turns configured (class, kind, depth) tuples into descriptors.
pub trait HookCatalog {
    /// Descriptor template for `spec.class_name` and `spec.kind`. The engine
    /// re-targets it to `spec.depth`.
    fn descriptor(&self, spec: &ClassHookSpec) -> Option<HookDescriptor>;
}

/// Counts from the startup walk over live objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkReport {
    pub visited: usize,
    pub hooked: usize,
    /// Objects already being torn down.
    pub skipped: usize,
    pub failed: usize,
}

/// What `hook_object` did for each hook kind; `None` when no registration
/// matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookOutcome {
    pub shared: Option<InstallOutcome>,
    pub per_object: Option<InstallOutcome>,
}

impl HookOutcome {
    pub fn is_hooked(&self) -> bool {
        [self.shared, self.per_object]
            .into_iter()
            .flatten()
            .any(|o| o != InstallOutcome::AlreadyHooked)
    }
}

/// Registrations that apply to one object.
#[derive(Default)]
pub(crate) struct Matches {
    pub(crate) shared: Option<Arc<HookDescriptor>>,
    pub(crate) per_object: Option<Arc<HookDescriptor>>,
}

impl Matches {
    /// Run the first-seen callback of every matching registration; hooking
    /// proceeds only if none declines.
    pub(crate) fn first_published(&self, object: ObjectRef) -> bool {
        [&self.shared, &self.per_object]
            .into_iter()
            .flatten()
            .fold(true, |proceed, d| d.listener().first_published(object) && proceed)
    }

    /// The registration whose handler decides for the object: the leaf's
    /// per-object hook if any, else the nearest shared one.
    pub(crate) fn primary(&self) -> Option<&Arc<HookDescriptor>> {
        self.per_object.as_ref().or(self.shared.as_ref())
    }
}

struct Registration {
    descriptor: Arc<HookDescriptor>,
    subscriptions: Vec<SubscriptionId>,
}

struct Registry {
    shared: Vec<HashMap<Arc<str>, Registration>>,
    per_object: HashMap<Arc<str>, Registration>,
}

impl Registry {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: (0..DEPTH_LEVELS).map(|_| HashMap::with_capacity(capacity)).collect(),
            per_object: HashMap::with_capacity(capacity),
        }
    }

    fn dictionary(&self, kind: HookKind, depth: InheritanceDepth) -> &HashMap<Arc<str>, Registration> {
        match kind {
            HookKind::SharedVtable => &self.shared[depth.index()],
            HookKind::PerObject => &self.per_object,
        }
    }

    fn dictionary_mut(
        &mut self,
        kind: HookKind,
        depth: InheritanceDepth,
    ) -> &mut HashMap<Arc<str>, Registration> {
        match kind {
            HookKind::SharedVtable => &mut self.shared[depth.index()],
            HookKind::PerObject => &mut self.per_object,
        }
    }

    fn lookup(&self, kind: HookKind, depth: InheritanceDepth, class_name: &str) -> Option<Arc<HookDescriptor>> {
        self.dictionary(kind, depth)
            .get(class_name)
            .map(|r| Arc::clone(&r.descriptor))
    }

    fn registrations(&self) -> impl Iterator<Item = &Registration> {
        self.shared.iter().flat_map(|d| d.values()).chain(self.per_object.values())
    }

    fn take_subscriptions(&mut self) -> Vec<SubscriptionId> {
        self.shared
            .iter_mut()
            .flat_map(|d| d.values_mut())
            .chain(self.per_object.values_mut())
            .flat_map(|r| std::mem::take(&mut r.subscriptions))
            .collect()
    }
}

pub(crate) struct EngineInner {
    runtime: Arc<dyn ObjectRuntime>,
    installer: HookInstaller,
    registry: RwLock<Registry>,
    started: AtomicBool,
}

/// Handle to the hooking engine. Clones share one engine; the engine shuts
/// down when the last handle is dropped.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create the process's engine. Fails while another engine is alive.
    pub fn new(runtime: Arc<dyn ObjectRuntime>, config: &EngineConfig) -> Result<Self, HookError> {
        config.validate()?;
        if ENGINE_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HookError::EngineActive);
        }

        let inner = EngineInner {
            installer: HookInstaller::new(Arc::clone(&runtime), config.table_capacity),
            runtime,
            registry: RwLock::new(Registry::with_capacity(config.registry_capacity)),
            started: AtomicBool::new(false),
        };
        log::debug!(
            "hook engine created (table capacity {}, registry capacity {})",
            config.table_capacity,
            config.registry_capacity
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn with_defaults(runtime: Arc<dyn ObjectRuntime>) -> Result<Self, HookError> {
        Self::new(runtime, &EngineConfig::default())
    }

    pub fn installer(&self) -> &HookInstaller {
        &self.inner.installer
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Add a registration and subscribe to lifecycle notifications for its
    /// class. Nothing is retained if any step fails.
    pub fn register(&self, descriptor: HookDescriptor) -> Result<(), HookError> {
        self.inner.register(descriptor)
    }

    /// Apply every registration matching `object`.
    pub fn hook_object(&self, object: ObjectRef) -> Result<HookOutcome, HookError> {
        self.inner.hook_object(object)
    }

    /// Detach `object` from every hook. A shared class table is restored once
    /// its last object is gone.
    pub fn unhook_object(&self, object: ObjectRef) -> ReleaseOutcome {
        assert_blockable("Engine::unhook_object");
        self.inner.installer.release_object(object)
    }

    pub fn original_function(&self, object: ObjectRef, kind: HookKind, slot: SlotIndex) -> Option<usize> {
        assert_blockable("Engine::original_function");
        self.inner.installer.original_function(object, kind, slot)
    }

    /// Register `descriptors`, then hook every object that is already alive.
    pub fn start(
        &self,
        descriptors: impl IntoIterator<Item = HookDescriptor>,
    ) -> Result<WalkReport, HookError> {
        assert_blockable("Engine::start");
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HookError::AlreadyStarted);
        }

        for descriptor in descriptors {
            self.inner.register(descriptor)?;
        }
        let report = self.inner.walk();
        log::info!(
            "hook engine started: {} objects visited, {} hooked, {} skipped, {} failed",
            report.visited,
            report.hooked,
            report.skipped,
            report.failed
        );
        Ok(report)
    }

    /// Build descriptors for the hooks listed in `config` and start.
    pub fn start_with_config(
        &self,
        config: &EngineConfig,
        catalog: &dyn HookCatalog,
    ) -> Result<WalkReport, HookError> {
        config.validate()?;
        let mut descriptors = Vec::with_capacity(config.hooks.len());
        for spec in &config.hooks {
            let template = catalog
                .descriptor(spec)
                .filter(|d| d.kind() == spec.kind && d.class_name() == spec.class_name)
                .ok_or_else(|| HookError::UnknownHook(spec.clone()))?;
            descriptors.push(template.at_depth(spec.depth)?);
        }
        self.start(descriptors)
    }

    /// Current registrations ordered by kind, depth, then class name.
    pub fn snapshot(&self) -> Vec<ClassHookSpec> {
        let registry = self.inner.read_registry();
        let mut specs: Vec<ClassHookSpec> = registry
            .registrations()
            .map(|r| r.descriptor.spec())
            .collect();
        specs.sort_by(|a, b| {
            (a.kind, a.depth, &a.class_name).cmp(&(b.kind, b.depth, &b.class_name))
        });
        specs
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("started", &self.is_started())
            .field("installer", &self.inner.installer)
            .finish_non_exhaustive()
    }
}

impl EngineInner {
    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    fn register(self: &Arc<Self>, descriptor: HookDescriptor) -> Result<(), HookError> {
        assert_blockable("Engine::register");
        let descriptor = Arc::new(descriptor);
        let (kind, depth) = (descriptor.kind(), descriptor.depth());
        let class_name = descriptor.class_name_arc();

        {
            let mut registry = self.write_registry();
            let dictionary = registry.dictionary_mut(kind, depth);
            if dictionary.contains_key(&class_name) {
                return Err(HookError::DuplicateRegistration {
                    class_name: class_name.to_string(),
                    kind,
                    depth,
                });
            }
            dictionary.insert(
                Arc::clone(&class_name),
                Registration {
                    descriptor: Arc::clone(&descriptor),
                    subscriptions: Vec::new(),
                },
            );
        }

        // Hosts may deliver notifications from inside `subscribe`, so the
        // registry lock is not held here.
        let mut subscriptions = Vec::with_capacity(2);
        for event in [LifecycleEvent::FirstPublished, LifecycleEvent::AboutToTerminate] {
            let handler = lifecycle::handler(event, Arc::downgrade(self), Arc::clone(&descriptor));
            match self.runtime.subscribe(event, &class_name, handler) {
                Ok(id) => subscriptions.push(id),
                Err(err) => {
                    log::warn!("cannot subscribe to {event:?} for '{class_name}': {err}");
                    for id in subscriptions {
                        self.runtime.unsubscribe(id);
                    }
                    let mut registry = self.write_registry();
                    let dictionary = registry.dictionary_mut(kind, depth);
                    if dictionary
                        .get(&class_name)
                        .is_some_and(|r| Arc::ptr_eq(&r.descriptor, &descriptor))
                    {
                        dictionary.remove(&class_name);
                    }
                    return Err(HookError::SubscriptionFailed {
                        class_name: class_name.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let mut registry = self.write_registry();
        match registry.dictionary_mut(kind, depth).get_mut(&class_name) {
            Some(registration) => registration.subscriptions = subscriptions,
            None => {
                drop(registry);
                for id in subscriptions {
                    self.runtime.unsubscribe(id);
                }
            }
        }
        log::debug!(
            "registered {kind} hook for '{class_name}' at depth {depth} ({} slots)",
            descriptor.replacements().len()
        );
        Ok(())
    }

    /// Nearest shared registration: walk from the leaf class toward the root,
    /// one depth per superclass.
    fn nearest_shared(&self, object: ObjectRef) -> Option<Arc<HookDescriptor>> {
        let mut class = Some(self.runtime.class_of(object));
        let mut depth = InheritanceDepth::LEAF;
        while let Some(current) = class {
            let name = self.runtime.class_name(current);
            let found = self
                .read_registry()
                .lookup(HookKind::SharedVtable, depth, &name);
            if let Some(descriptor) = found {
                if self.runtime.is_instance_of(object, descriptor.class_name()) {
                    return Some(descriptor);
                }
                log::error!(
                    "object 0x{:x} matched shared hook '{}' but is not an instance of it",
                    object.addr(),
                    descriptor.class_name()
                );
            }
            depth = depth.deeper()?;
            class = self.runtime.superclass(current);
        }
        None
    }

    /// Registrations `hook_object` applies to `object`.
    pub(crate) fn matching(&self, object: ObjectRef) -> Matches {
        let shared = self.nearest_shared(object);

        let leaf = self.runtime.class_of(object);
        let leaf_name = self.runtime.class_name(leaf);
        let per_object = self
            .read_registry()
            .lookup(HookKind::PerObject, InheritanceDepth::LEAF, &leaf_name)
            .filter(|descriptor| {
                let exact = self.runtime.class_named(descriptor.class_name()) == Some(leaf);
                if !exact {
                    log::warn!(
                        "per-object hook '{}' skipped: class lookup does not match object 0x{:x}",
                        descriptor.class_name(),
                        object.addr()
                    );
                }
                exact
            });

        Matches { shared, per_object }
    }

    pub(crate) fn hook_object(&self, object: ObjectRef) -> Result<HookOutcome, HookError> {
        assert_blockable("Engine::hook_object");
        let matches = self.matching(object);
        self.apply(object, &matches)
    }

    /// Install the hooks in `matches`. Both kinds are attempted; the first
    /// error is returned.
    pub(crate) fn apply(&self, object: ObjectRef, matches: &Matches) -> Result<HookOutcome, HookError> {
        let mut outcome = HookOutcome::default();
        let mut first_error = None;

        if let Some(descriptor) = &matches.shared {
            match self.inner_install(object, descriptor) {
                Ok(o) => outcome.shared = Some(o),
                Err(err) => first_error = Some(err),
            }
        }
        if let Some(descriptor) = &matches.per_object {
            match self.inner_install(object, descriptor) {
                Ok(o) => outcome.per_object = Some(o),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    fn inner_install(&self, object: ObjectRef, descriptor: &HookDescriptor) -> Result<InstallOutcome, HookError> {
        let result = match descriptor.kind() {
            HookKind::SharedVtable => self.installer.install_shared_hook(object, descriptor),
            HookKind::PerObject => self.installer.install_per_object_hook(object, descriptor),
        };
        result.inspect_err(|err| {
            log::warn!(
                "{} hook '{}' not applied to object 0x{:x}: {err}",
                descriptor.kind(),
                descriptor.class_name(),
                object.addr()
            );
        })
    }

    fn walk(&self) -> WalkReport {
        let mut report = WalkReport::default();
        for object in self.runtime.live_objects() {
            report.visited += 1;
            if self.runtime.is_terminating(object) {
                report.skipped += 1;
                continue;
            }

            self.runtime.retain(object);
            match self.hook_object(object) {
                Ok(outcome) if outcome.is_hooked() => report.hooked += 1,
                Ok(_) => {}
                Err(_) => report.failed += 1,
            }
            self.runtime.release(object);
        }
        report
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let subscriptions = self.write_registry().take_subscriptions();
        for id in subscriptions {
            self.runtime.unsubscribe(id);
        }
        self.installer.uninstall_all();
        ENGINE_ACTIVE.store(false, Ordering::Release);
        log::debug!("hook engine shut down");
    }
}
