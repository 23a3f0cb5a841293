//! Shared test utilities: an in-process object runtime with real `extern "C"`
//! dispatch tables, so hooks are observed by calling through the table.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, RwLock};

use crate::code::abi::{load_table, read_entry};
use crate::engine::Engine;
use crate::runtime::{
    LifecycleEvent, NotificationHandler, ObjectRuntime, RuntimeError, SubscriptionId, TableProtection,
};
use crate::types::{ClassRef, ObjectRef, RawObject, VtablePtr};

pub type Method = extern "C" fn(ObjectRef, i64) -> i64;

static LOGGER_INIT: Once = Once::new();

/// Route engine logging to the test output (`RUST_LOG=debug`).
pub fn init_logging() {
    LOGGER_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// A table in its own read-only page, unmapped on drop.
pub struct ReadOnlyTable {
    base: *mut usize,
    len: usize,
    map_len: usize,
}

impl ReadOnlyTable {
    pub fn new(entries: &[usize]) -> Self {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let bytes = entries.len().max(1) * core::mem::size_of::<usize>();
        let map_len = bytes.div_ceil(page) * page;
        unsafe {
            let base = libc::mmap(
                core::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(base, libc::MAP_FAILED, "mmap");
            let base = base as *mut usize;
            core::ptr::copy_nonoverlapping(entries.as_ptr(), base, entries.len());
            assert_eq!(libc::mprotect(base as *mut libc::c_void, map_len, libc::PROT_READ), 0);
            Self {
                base,
                len: entries.len(),
                map_len,
            }
        }
    }

    /// A table backed by a file opened read-only and mapped shared; the
    /// kernel refuses to make it writable.
    pub fn sealed(entries: &[usize]) -> Self {
        use std::os::unix::io::AsRawFd;
        static NEXT_FILE: AtomicUsize = AtomicUsize::new(0);

        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        let bytes = entries.len().max(1) * core::mem::size_of::<usize>();
        let map_len = bytes.div_ceil(page) * page;
        let mut contents: Vec<u8> = entries.iter().flat_map(|e| e.to_ne_bytes()).collect();
        contents.resize(map_len, 0);

        let path = std::env::temp_dir().join(format!(
            "vthook-sealed-{}-{}",
            std::process::id(),
            NEXT_FILE.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, &contents).unwrap();
        let file = std::fs::File::open(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        unsafe {
            let base = libc::mmap(
                core::ptr::null_mut(),
                map_len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            );
            assert_ne!(base, libc::MAP_FAILED, "mmap");
            Self {
                base: base as *mut usize,
                len: entries.len(),
                map_len,
            }
        }
    }

    pub fn ptr(&self) -> VtablePtr {
        VtablePtr::from_ptr(self.base)
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ReadOnlyTable {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.map_len);
        }
    }
}

unsafe impl Send for ReadOnlyTable {}
unsafe impl Sync for ReadOnlyTable {}

enum ClassTable {
    Heap(Box<[AtomicUsize]>),
    ReadOnly(ReadOnlyTable),
}

impl ClassTable {
    fn ptr(&self) -> VtablePtr {
        match self {
            ClassTable::Heap(t) => VtablePtr::from_ptr(t.as_ptr() as *const usize),
            ClassTable::ReadOnly(t) => t.ptr(),
        }
    }

    fn len(&self) -> usize {
        match self {
            ClassTable::Heap(t) => t.len(),
            ClassTable::ReadOnly(t) => t.len(),
        }
    }
}

struct ClassInfo {
    name: Arc<str>,
    parent: Option<ClassRef>,
    table: ClassTable,
}

/// Object layout of the test host: table pointer first.
#[repr(C)]
pub struct TestObject {
    #[allow(dead_code)]
    header: RawObject,
    class: ClassRef,
    refs: AtomicUsize,
    terminating: AtomicBool,
}

struct Subscription {
    id: SubscriptionId,
    event: LifecycleEvent,
    class_name: String,
    handler: NotificationHandler,
}

#[derive(Default)]
pub struct TestRuntime {
    classes: RwLock<Vec<Arc<ClassInfo>>>,
    live: Mutex<Vec<Box<TestObject>>>,
    // Terminated objects stay allocated so stale ObjectRefs remain readable.
    dead: Mutex<Vec<Box<TestObject>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_subscription: AtomicU64,
    subscribe_budget: Mutex<Option<usize>>,
    replay_on_subscribe: AtomicBool,
    disowned: Mutex<Vec<String>>,
}

impl TestRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lookup(&self, class: ClassRef) -> Arc<ClassInfo> {
        self.classes
            .read()
            .unwrap()
            .iter()
            .find(|c| Arc::as_ptr(c) as usize == class.addr())
            .cloned()
            .expect("unknown class")
    }

    fn build_entries(&self, parent: Option<ClassRef>, overrides: &[(u32, Method)], added: &[Method]) -> Vec<usize> {
        let mut entries: Vec<usize> = match parent {
            Some(p) => {
                let info = self.lookup(p);
                (0..info.table.len())
                    .map(|i| unsafe { read_entry(info.table.ptr(), i) })
                    .collect()
            }
            None => Vec::new(),
        };
        entries.extend(added.iter().map(|m| *m as usize));
        for (slot, method) in overrides {
            entries[*slot as usize - 1] = *method as usize;
        }
        entries
    }

    fn add_class(&self, name: &str, parent: Option<ClassRef>, table: ClassTable) -> ClassRef {
        let info = Arc::new(ClassInfo {
            name: name.into(),
            parent,
            table,
        });
        let class = ClassRef::from_ptr(Arc::as_ptr(&info));
        self.classes.write().unwrap().push(info);
        class
    }

    /// Define a class inheriting `parent`'s table, with `overrides` (1-based
    /// slot, method) applied and `added` methods appended.
    pub fn define_class(
        &self,
        name: &str,
        parent: Option<ClassRef>,
        overrides: &[(u32, Method)],
        added: &[Method],
    ) -> ClassRef {
        let entries = self.build_entries(parent, overrides, added);
        let table = entries.into_iter().map(AtomicUsize::new).collect();
        self.add_class(name, parent, ClassTable::Heap(table))
    }

    /// Like [`define_class`](Self::define_class) with the table in read-only memory.
    pub fn define_read_only_class(
        &self,
        name: &str,
        parent: Option<ClassRef>,
        overrides: &[(u32, Method)],
        added: &[Method],
    ) -> ClassRef {
        let entries = self.build_entries(parent, overrides, added);
        self.add_class(name, parent, ClassTable::ReadOnly(ReadOnlyTable::new(&entries)))
    }

    /// Like [`define_read_only_class`](Self::define_read_only_class), but the
    /// table can never be made writable.
    pub fn define_sealed_class(&self, name: &str, added: &[Method]) -> ClassRef {
        let entries = self.build_entries(None, &[], added);
        self.add_class(name, None, ClassTable::ReadOnly(ReadOnlyTable::sealed(&entries)))
    }

    /// Allocate an object without announcing it.
    pub fn create(&self, class: ClassRef) -> ObjectRef {
        let table = self.lookup(class).table.ptr();
        let mut object = Box::new(TestObject {
            header: RawObject::new(table.as_ptr()),
            class,
            refs: AtomicUsize::new(1),
            terminating: AtomicBool::new(false),
        });
        let ptr = &mut *object as *mut TestObject as *mut RawObject;
        self.live.lock().unwrap().push(object);
        unsafe { ObjectRef::from_raw(ptr) }.expect("non-null")
    }

    /// Announce `object`; returns whether every handler let it proceed.
    pub fn publish(&self, object: ObjectRef) -> bool {
        self.notify(LifecycleEvent::FirstPublished, object)
    }

    pub fn spawn(&self, class: ClassRef) -> ObjectRef {
        let object = self.create(class);
        self.publish(object);
        object
    }

    /// Run the terminate notification and retire the object.
    pub fn terminate(&self, object: ObjectRef) {
        self.mark_terminating(object);
        self.notify(LifecycleEvent::AboutToTerminate, object);
        let mut live = self.live.lock().unwrap();
        if let Some(pos) = live
            .iter()
            .position(|o| o.as_ref() as *const TestObject as usize == object.addr())
        {
            let retired = live.remove(pos);
            self.dead.lock().unwrap().push(retired);
        }
    }

    pub fn mark_terminating(&self, object: ObjectRef) {
        Self::object(object).terminating.store(true, Ordering::Release);
    }

    fn object<'a>(object: ObjectRef) -> &'a TestObject {
        unsafe { &*(object.as_ptr() as *const TestObject) }
    }

    fn notify(&self, event: LifecycleEvent, object: ObjectRef) -> bool {
        let candidates: Vec<(String, NotificationHandler)> = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.event == event)
            .map(|s| (s.class_name.clone(), Arc::clone(&s.handler)))
            .collect();
        let mut proceed = true;
        for (class_name, handler) in candidates {
            if self.is_instance_of(object, &class_name) {
                proceed &= handler(object);
            }
        }
        proceed
    }

    /// Dispatch `slot` (1-based) on `object` through its current table.
    pub fn call(&self, object: ObjectRef, slot: u32, arg: i64) -> i64 {
        let table = load_table(object);
        let address = unsafe { read_entry(table, slot as usize - 1) };
        let method: Method = unsafe { core::mem::transmute::<usize, Method>(address) };
        method(object, arg)
    }

    pub fn class_table(&self, class: ClassRef) -> VtablePtr {
        self.lookup(class).table.ptr()
    }

    pub fn table_entry(&self, class: ClassRef, slot: u32) -> usize {
        unsafe { read_entry(self.class_table(class), slot as usize - 1) }
    }

    pub fn object_table(&self, object: ObjectRef) -> VtablePtr {
        load_table(object)
    }

    pub fn ref_count(&self, object: ObjectRef) -> usize {
        Self::object(object).refs.load(Ordering::Acquire)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// Let `successes` more subscriptions succeed, then fail the rest.
    pub fn fail_subscriptions_after(&self, successes: usize) {
        *self.subscribe_budget.lock().unwrap() = Some(successes);
    }

    /// Deliver FirstPublished for existing objects from inside `subscribe`.
    pub fn set_replay_on_subscribe(&self, replay: bool) {
        self.replay_on_subscribe.store(replay, Ordering::Release);
    }

    /// Make instance checks against `class_name` fail even where the class
    /// chain says otherwise.
    pub fn disown_class(&self, class_name: &str) {
        self.disowned.lock().unwrap().push(class_name.to_owned());
    }
}

impl ObjectRuntime for TestRuntime {
    fn class_of(&self, object: ObjectRef) -> ClassRef {
        Self::object(object).class
    }

    fn class_name(&self, class: ClassRef) -> Arc<str> {
        Arc::clone(&self.lookup(class).name)
    }

    fn superclass(&self, class: ClassRef) -> Option<ClassRef> {
        self.lookup(class).parent
    }

    fn class_named(&self, name: &str) -> Option<ClassRef> {
        self.classes
            .read()
            .unwrap()
            .iter()
            .find(|c| &*c.name == name)
            .map(|c| ClassRef::from_ptr(Arc::as_ptr(c)))
    }

    fn table_len(&self, class: ClassRef) -> usize {
        self.lookup(class).table.len()
    }

    fn is_instance_of(&self, object: ObjectRef, class_name: &str) -> bool {
        if self.disowned.lock().unwrap().iter().any(|n| n == class_name) {
            return false;
        }
        let mut class = Some(self.class_of(object));
        while let Some(current) = class {
            if &*self.class_name(current) == class_name {
                return true;
            }
            class = self.superclass(current);
        }
        false
    }

    fn table_protection(&self, class: ClassRef) -> TableProtection {
        match self.lookup(class).table {
            ClassTable::Heap(_) => TableProtection::Writable,
            ClassTable::ReadOnly(_) => TableProtection::ReadOnly,
        }
    }

    fn retain(&self, object: ObjectRef) {
        Self::object(object).refs.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self, object: ObjectRef) {
        Self::object(object).refs.fetch_sub(1, Ordering::AcqRel);
    }

    fn is_terminating(&self, object: ObjectRef) -> bool {
        Self::object(object).terminating.load(Ordering::Acquire)
    }

    fn subscribe(
        &self,
        event: LifecycleEvent,
        class_name: &str,
        handler: NotificationHandler,
    ) -> Result<SubscriptionId, RuntimeError> {
        if let Some(budget) = self.subscribe_budget.lock().unwrap().as_mut() {
            if *budget == 0 {
                return Err(RuntimeError(format!("no notifier for '{class_name}'")));
            }
            *budget -= 1;
        }

        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.lock().unwrap().push(Subscription {
            id,
            event,
            class_name: class_name.to_string(),
            handler: Arc::clone(&handler),
        });

        if event == LifecycleEvent::FirstPublished && self.replay_on_subscribe.load(Ordering::Acquire) {
            let existing: Vec<ObjectRef> = self.live_objects().collect();
            for object in existing {
                if self.is_instance_of(object, class_name) {
                    handler(object);
                }
            }
        }
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.lock().unwrap().retain(|s| s.id != id);
    }

    fn live_objects(&self) -> Box<dyn Iterator<Item = ObjectRef> + '_> {
        let objects: Vec<ObjectRef> = self
            .live
            .lock()
            .unwrap()
            .iter_mut()
            .filter_map(|o| unsafe { ObjectRef::from_raw(&mut **o as *mut TestObject as *mut RawObject) })
            .collect();
        Box::new(objects.into_iter())
    }
}

static CURRENT_ENGINE: Mutex<Option<Engine>> = Mutex::new(None);

/// Makes `engine` reachable from replacement methods until dropped.
pub struct EngineScope(());

impl EngineScope {
    pub fn enter(engine: &Engine) -> Self {
        *CURRENT_ENGINE.lock().unwrap_or_else(|e| e.into_inner()) = Some(engine.clone());
        EngineScope(())
    }
}

impl Drop for EngineScope {
    fn drop(&mut self) {
        let engine = CURRENT_ENGINE.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(engine);
    }
}

/// Run `f` with the engine of the active [`EngineScope`].
pub fn with_current_engine<R>(f: impl FnOnce(&Engine) -> R) -> R {
    let engine = CURRENT_ENGINE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .expect("no engine in scope");
    f(&engine)
}

/// Serialize tests that create the process's engine or patch tables, and set
/// up logging.
pub fn engine_test_guard() -> MutexGuard<'static, ()> {
    init_logging();
    crate::lock_hook_tests()
}
