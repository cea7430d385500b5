//! Object headers, reference counting and per-object attachments.

use crate::class::{Class, ClassInner, ClassKind};
use crate::sel::common;
use core::ffi::c_void;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectKind {
    Instance,
    Class,
}

/// Key for an associated value. Keys compare by address, so declare them as
/// `static` items.
#[derive(Debug)]
pub struct AssociationKey {
    name: &'static str,
}

impl AssociationKey {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

type Associated = Arc<dyn Any + Send + Sync>;
type Finalizer = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ObjectState {
    associated: Vec<(&'static AssociationKey, Associated)>,
    slots: HashMap<String, i64>,
    finalizers: Vec<Finalizer>,
}

pub(crate) struct WeakSlot {
    target: Mutex<Option<Id>>,
}

#[repr(C)]
pub(crate) struct ObjectHeader {
    isa: AtomicPtr<ClassInner>,
    retain_count: AtomicUsize,
    kind: ObjectKind,
    state: Mutex<ObjectState>,
    weak: OnceLock<Arc<WeakSlot>>,
}

impl ObjectHeader {
    pub(crate) fn new(isa: *mut ClassInner, kind: ObjectKind) -> Self {
        Self {
            isa: AtomicPtr::new(isa),
            retain_count: AtomicUsize::new(1),
            kind,
            state: Mutex::new(ObjectState::default()),
            weak: OnceLock::new(),
        }
    }

    pub(crate) fn set_isa(&self, isa: *mut ClassInner) {
        self.isa.store(isa, Ordering::Release);
    }
}

/// Unretained object handle, passed through native frames as `@`.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(NonNull<ObjectHeader>);

unsafe impl Send for Id {}
unsafe impl Sync for Id {}

impl Id {
    pub(crate) fn from_header(header: &ObjectHeader) -> Id {
        Id(NonNull::from(header))
    }

    fn header(&self) -> &ObjectHeader {
        // Handles are only minted for live headers; using one after the
        // object was disposed is a caller bug, as with any unretained pointer.
        unsafe { self.0.as_ref() }
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr() as *mut c_void
    }

    /// # Safety
    ///
    /// `ptr` must come from [`Id::as_ptr`] of a live object.
    pub unsafe fn from_ptr(ptr: *mut c_void) -> Option<Id> {
        NonNull::new(ptr as *mut ObjectHeader).map(Id)
    }

    pub(crate) fn kind(self) -> ObjectKind {
        self.header().kind
    }

    pub fn is_class_object(self) -> bool {
        self.kind() == ObjectKind::Class
    }

    /// The live type tag. Unlike the `class` message this is never masked.
    pub fn object_class(self) -> Class {
        unsafe { Class::from_inner_ptr(self.header().isa.load(Ordering::Acquire)) }
    }

    /// Replaces the type tag and returns the previous one.
    pub fn set_object_class(self, class: Class) -> Class {
        let previous = self.header().isa.swap(class.inner_ptr(), Ordering::AcqRel);
        let previous = unsafe { Class::from_inner_ptr(previous) };
        log::trace!("isa {:?} -> {:?} on {:p}", previous, class, self.as_ptr());
        previous
    }

    pub fn retain_count(self) -> usize {
        self.header().retain_count.load(Ordering::Acquire)
    }

    /// Sends `retain` and wraps the result.
    pub fn retain(self) -> Retained {
        if self.object_class().responds_to(common().retain) {
            let retained: Id = unsafe { crate::message::msg_send(self, common().retain, ()) };
            Retained(retained)
        } else {
            self.intrinsic_retain();
            Retained(self)
        }
    }

    /// Sends `release`, or drops the count directly for value classes.
    ///
    /// # Safety
    ///
    /// The caller must own a reference it has not released yet.
    pub unsafe fn release(self) {
        if self.object_class().responds_to(common().release) {
            crate::message::msg_send::<(), _>(self, common().release, ());
        } else if self.intrinsic_release() {
            self.dispose();
        }
    }

    pub(crate) fn intrinsic_retain(self) {
        if self.kind() == ObjectKind::Instance {
            self.header().retain_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns true when the count dropped to zero.
    pub(crate) fn intrinsic_release(self) -> bool {
        if self.kind() != ObjectKind::Instance {
            return false;
        }
        let previous = self.header().retain_count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "over-release of {:?}", self);
        previous == 1
    }

    fn try_retain(self) -> bool {
        let count = &self.header().retain_count;
        let mut current = count.load(Ordering::Acquire);
        while current > 0 {
            match count.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Frees the object: clears weak references, drops associated values in
    /// insertion order, runs dispose finalizers newest first, then releases
    /// the storage.
    pub(crate) fn dispose(self) {
        if self.kind() != ObjectKind::Instance {
            return;
        }
        if let Some(slot) = self.header().weak.get() {
            *slot.target.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }
        let state = std::mem::take(&mut *self.header().state.lock().unwrap_or_else(|e| e.into_inner()));
        let ObjectState { associated, finalizers, .. } = state;
        for (_, value) in associated {
            drop(value);
        }
        for finalizer in finalizers.into_iter().rev() {
            finalizer();
        }
        log::trace!("disposed {:p}", self.as_ptr());
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }

    pub fn slot(self, name: &str) -> i64 {
        let state = self.header().state.lock().unwrap_or_else(|e| e.into_inner());
        state.slots.get(name).copied().unwrap_or_default()
    }

    pub fn set_slot(self, name: &str, value: i64) {
        let mut state = self.header().state.lock().unwrap_or_else(|e| e.into_inner());
        state.slots.insert(name.to_string(), value);
    }

    pub fn associated<T: Any + Send + Sync>(self, key: &'static AssociationKey) -> Option<Arc<T>> {
        let state = self.header().state.lock().unwrap_or_else(|e| e.into_inner());
        let value = state
            .associated
            .iter()
            .find(|(k, _)| std::ptr::eq(*k, key))
            .map(|(_, v)| v.clone())?;
        drop(state);
        value.downcast::<T>().ok()
    }

    /// Attaches `value`, returning whatever was stored under `key` before.
    pub fn set_associated<T: Any + Send + Sync>(
        self,
        key: &'static AssociationKey,
        value: Arc<T>,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        let mut state = self.header().state.lock().unwrap_or_else(|e| e.into_inner());
        match state.associated.iter_mut().find(|(k, _)| std::ptr::eq(*k, key)) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                state.associated.push((key, value));
                None
            }
        }
    }

    /// Returns the value under `key`, creating it atomically when absent.
    ///
    /// Returns `None` if a value of another type occupies the key.
    pub fn associated_or_insert_with<T, F>(self, key: &'static AssociationKey, make: F) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Arc<T>,
    {
        let mut state = self.header().state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, value)) = state.associated.iter().find(|(k, _)| std::ptr::eq(*k, key)) {
            return value.clone().downcast::<T>().ok();
        }
        let value = make();
        state.associated.push((key, value.clone()));
        Some(value)
    }

    /// Detaches the value under `key`. The value is dropped outside the
    /// object's lock.
    pub fn remove_associated(self, key: &'static AssociationKey) -> bool {
        let removed = {
            let mut state = self.header().state.lock().unwrap_or_else(|e| e.into_inner());
            let index = state.associated.iter().position(|(k, _)| std::ptr::eq(*k, key));
            index.map(|i| state.associated.remove(i))
        };
        removed.is_some()
    }

    /// Registers a closure that runs after every associated value has been
    /// released, immediately before the storage is freed.
    pub fn on_dispose<F: FnOnce() + Send + 'static>(self, finalizer: F) {
        let mut state = self.header().state.lock().unwrap_or_else(|e| e.into_inner());
        state.finalizers.push(Box::new(finalizer));
    }

    pub fn downgrade(self) -> WeakId {
        let slot = self.header().weak.get_or_init(|| {
            Arc::new(WeakSlot {
                target: Mutex::new(Some(self)),
            })
        });
        WeakId(slot.clone())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {:p}>", self.object_class().name(), self.as_ptr())
    }
}

impl Class {
    /// Allocates an instance with a retain count of one.
    pub fn new_object(self) -> Retained {
        assert!(self.kind() != ClassKind::Meta, "cannot instantiate metaclass {:?}", self);
        let header = Box::new(ObjectHeader::new(self.inner_ptr(), ObjectKind::Instance));
        let ptr = NonNull::from(Box::leak(header));
        Retained(Id(ptr))
    }
}

/// Owning object handle. Dropping it sends `release`.
#[derive(PartialEq, Eq, Hash)]
pub struct Retained(Id);

impl Retained {
    /// # Safety
    ///
    /// The caller transfers one reference it owns.
    pub unsafe fn from_raw(id: Id) -> Retained {
        Retained(id)
    }

    pub fn id(&self) -> Id {
        self.0
    }

    /// Gives up ownership without releasing.
    pub fn into_raw(self) -> Id {
        let id = self.0;
        std::mem::forget(self);
        id
    }
}

impl Deref for Retained {
    type Target = Id;

    fn deref(&self) -> &Id {
        &self.0
    }
}

impl Clone for Retained {
    fn clone(&self) -> Self {
        self.0.retain()
    }
}

impl Drop for Retained {
    fn drop(&mut self) {
        unsafe { self.0.release() }
    }
}

impl fmt::Debug for Retained {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Zeroing weak reference.
#[derive(Clone)]
pub struct WeakId(Arc<WeakSlot>);

impl WeakId {
    /// Returns a strong handle if the object has not started deallocating.
    pub fn upgrade(&self) -> Option<Retained> {
        let target = self.0.target.lock().unwrap_or_else(|e| e.into_inner());
        let id = (*target)?;
        if id.try_retain() {
            Some(Retained(id))
        } else {
            None
        }
    }

    /// Compares against `id` without retaining it.
    pub fn points_to(&self, id: Id) -> bool {
        *self.0.target.lock().unwrap_or_else(|e| e.into_inner()) == Some(id)
    }
}

impl fmt::Debug for WeakId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = *self.0.target.lock().unwrap_or_else(|e| e.into_inner());
        match target {
            Some(id) => write!(f, "WeakId({:p})", id.as_ptr()),
            None => f.write_str("WeakId(nil)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    static KEY: AssociationKey = AssociationKey::new("tests.value");
    static OTHER: AssociationKey = AssociationKey::new("tests.other");

    struct Flag(Arc<Mutex<Vec<&'static str>>>, &'static str);

    impl Drop for Flag {
        fn drop(&mut self) {
            self.0.lock().unwrap().push(self.1);
        }
    }

    #[test]
    fn associated_values_are_keyed_by_address() {
        let class = Class::allocate(Some(Class::root()), "ObjectTestsAssoc").unwrap();
        let obj = class.new_object();

        assert!(obj.associated::<i64>(&KEY).is_none());
        obj.set_associated(&KEY, Arc::new(5_i64));
        assert_eq!(*obj.associated::<i64>(&KEY).unwrap(), 5);
        assert!(obj.associated::<String>(&KEY).is_none());
        assert!(obj.associated::<i64>(&OTHER).is_none());

        let created = obj.associated_or_insert_with(&OTHER, || Arc::new(9_u32)).unwrap();
        let again = obj.associated_or_insert_with(&OTHER, || Arc::new(10_u32)).unwrap();
        assert!(Arc::ptr_eq(&created, &again));

        assert!(obj.remove_associated(&KEY));
        assert!(!obj.remove_associated(&KEY));
    }

    #[test]
    fn dispose_order_is_associated_then_finalizers() {
        let class = Class::allocate(Some(Class::root()), "ObjectTestsDispose").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let obj = class.new_object();
        obj.set_associated(&KEY, Arc::new(Flag(log.clone(), "first")));
        obj.set_associated(&OTHER, Arc::new(Flag(log.clone(), "second")));
        let l1 = log.clone();
        obj.on_dispose(move || l1.lock().unwrap().push("finalizer-1"));
        let l2 = log.clone();
        obj.on_dispose(move || l2.lock().unwrap().push("finalizer-2"));

        drop(obj);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first", "second", "finalizer-2", "finalizer-1"]
        );
    }

    #[test]
    fn weak_references_zero_on_dispose() {
        let class = Class::allocate(Some(Class::root()), "ObjectTestsWeak").unwrap();
        let obj = class.new_object();
        let weak = obj.downgrade();
        {
            let strong = weak.upgrade().unwrap();
            assert_eq!(strong.retain_count(), 2);
        }
        assert!(weak.points_to(*obj));
        drop(obj);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn type_tag_swaps_are_visible() {
        let base = Class::allocate(Some(Class::root()), "ObjectTestsIsaBase").unwrap();
        let sub = Class::allocate(Some(base), "ObjectTestsIsaSub").unwrap();
        let obj = base.new_object();

        assert_eq!(obj.set_object_class(sub), base);
        assert_eq!(obj.object_class(), sub);
        obj.set_object_class(base);
        assert_eq!(obj.object_class(), base);
    }

    #[test]
    fn value_objects_are_freed_without_dealloc() {
        let class = Class::value_root("ObjectTestsValue").unwrap();
        let freed = Arc::new(AtomicBool::new(false));
        let obj = class.new_object();
        let flag = freed.clone();
        obj.on_dispose(move || flag.store(true, Ordering::SeqCst));
        let extra = obj.clone();
        drop(obj);
        assert!(!freed.load(Ordering::SeqCst));
        drop(extra);
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn slots_default_to_zero() {
        let class = Class::allocate(Some(Class::root()), "ObjectTestsSlots").unwrap();
        let obj = class.new_object();
        assert_eq!(obj.slot("count"), 0);
        obj.set_slot("count", 3);
        assert_eq!(obj.slot("count"), 3);
    }
}
