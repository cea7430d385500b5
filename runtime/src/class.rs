//! Classes, metaclasses and method tables.

use crate::encode::Encode;
use crate::error::{Result, RuntimeError};
use crate::object::{Id, ObjectHeader, ObjectKind};
use crate::sel::Sel;
use core::ffi::c_void;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{OnceLock, RwLock};

/// A method entry point. Cast to the concrete signature before calling.
pub type Imp = unsafe extern "C" fn();

#[doc(hidden)]
pub struct MethodInner {
    selector: Sel,
    types: Box<str>,
    imp: AtomicPtr<c_void>,
}

/// A method table entry. Entries are never removed, only re-pointed.
#[derive(Clone, Copy)]
pub struct Method(&'static MethodInner);

impl Method {
    pub fn selector(self) -> Sel {
        self.0.selector
    }

    /// Type encoding, return type first.
    pub fn types(self) -> &'static str {
        &self.0.types
    }

    pub fn implementation(self) -> Imp {
        imp_from_raw(self.0.imp.load(Ordering::Acquire))
    }

    /// Swaps in a new entry point and returns the previous one.
    pub fn set_implementation(self, imp: Imp) -> Imp {
        imp_from_raw(self.0.imp.swap(imp as *mut c_void, Ordering::AcqRel))
    }

    /// Installs `new` only if the entry point is still `current`. On failure
    /// returns the entry point actually installed.
    pub fn compare_and_set_implementation(self, current: Imp, new: Imp) -> std::result::Result<(), Imp> {
        self.0
            .imp
            .compare_exchange(current as *mut c_void, new as *mut c_void, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(imp_from_raw)
    }
}

pub(crate) fn imp_from_raw(raw: *mut c_void) -> Imp {
    // Method entries are created from valid function pointers only.
    unsafe { core::mem::transmute::<*mut c_void, Imp>(raw) }
}

impl PartialEq for Method {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl Eq for Method {}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("selector", &self.selector())
            .field("types", &self.types())
            .field("imp", &(self.implementation() as *const c_void))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClassKind {
    /// Instances are reference counted and receive `dealloc`.
    Counted,
    /// Instances live outside the counted hierarchy; no `dealloc` message.
    Value,
    Meta,
}

#[doc(hidden)]
#[repr(C)]
pub struct ClassInner {
    header: ObjectHeader,
    name: Box<str>,
    superclass: Option<Class>,
    metaclass: Option<Class>,
    kind: ClassKind,
    methods: RwLock<HashMap<Sel, Method>>,
}

/// A registered class. Classes are immortal.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Class(&'static ClassInner);

unsafe impl Send for Class {}
unsafe impl Sync for Class {}

fn registry() -> &'static RwLock<HashMap<String, Class>> {
    static CLASSES: OnceLock<RwLock<HashMap<String, Class>>> = OnceLock::new();
    CLASSES.get_or_init(|| RwLock::new(HashMap::new()))
}

fn leak_class(inner: ClassInner) -> Class {
    Class(Box::leak(Box::new(inner)))
}

impl Class {
    /// Creates and registers a class together with its metaclass.
    pub fn allocate(superclass: Option<Class>, name: &str) -> Result<Class> {
        let kind = superclass.map(|s| s.0.kind).unwrap_or(ClassKind::Value);
        Class::allocate_with_kind(superclass, name, kind)
    }

    pub(crate) fn allocate_with_kind(superclass: Option<Class>, name: &str, kind: ClassKind) -> Result<Class> {
        let mut classes = registry().write().unwrap_or_else(|e| e.into_inner());
        if classes.contains_key(name) {
            return Err(RuntimeError::ClassExists(name.to_string()));
        }
        let meta = leak_class(ClassInner {
            header: ObjectHeader::new(core::ptr::null_mut(), ObjectKind::Class),
            name: name.into(),
            superclass: superclass.and_then(|s| s.0.metaclass),
            metaclass: None,
            kind: ClassKind::Meta,
            methods: RwLock::new(HashMap::new()),
        });
        meta.0.header.set_isa(meta.inner_ptr());
        let class = leak_class(ClassInner {
            header: ObjectHeader::new(meta.inner_ptr(), ObjectKind::Class),
            name: name.into(),
            superclass,
            metaclass: Some(meta),
            kind,
            methods: RwLock::new(HashMap::new()),
        });
        classes.insert(name.to_string(), class);
        log::debug!("registered class {}", name);
        Ok(class)
    }

    /// The reference-counted root class, `Object`.
    pub fn root() -> Class {
        static ROOT: OnceLock<Class> = OnceLock::new();
        *ROOT.get_or_init(crate::message::define_root)
    }

    /// Creates a root class outside the reference-counted hierarchy.
    ///
    /// Its instances are freed directly when released and never receive
    /// `dealloc`.
    pub fn value_root(name: &str) -> Result<Class> {
        let class = Class::allocate(None, name)?;
        crate::message::define_value_root(class);
        Ok(class)
    }

    pub fn lookup(name: &str) -> Option<Class> {
        registry().read().unwrap_or_else(|e| e.into_inner()).get(name).copied()
    }

    pub fn name(self) -> &'static str {
        &self.0.name
    }

    pub fn superclass(self) -> Option<Class> {
        self.0.superclass
    }

    /// The metaclass holding this class's class methods. `None` for metaclasses.
    pub fn metaclass(self) -> Option<Class> {
        self.0.metaclass
    }

    pub fn is_metaclass(self) -> bool {
        self.0.kind == ClassKind::Meta
    }

    /// Whether instances take part in reference counting and `dealloc`.
    pub fn is_reference_counted(self) -> bool {
        self.0.kind == ClassKind::Counted
    }

    /// True when `self` is `other` or inherits from it.
    pub fn is_subclass_of(self, other: Class) -> bool {
        let mut cursor = Some(self);
        while let Some(class) = cursor {
            if class == other {
                return true;
            }
            cursor = class.superclass();
        }
        false
    }

    /// The class object, usable as the receiver of class methods.
    pub fn as_object(self) -> Id {
        Id::from_header(&self.0.header)
    }

    /// Recovers the class from a class object.
    pub fn from_object(object: Id) -> Option<Class> {
        if object.kind() != ObjectKind::Class {
            return None;
        }
        Some(Class(unsafe { &*(object.as_ptr() as *const ClassInner) }))
    }

    pub(crate) fn inner_ptr(self) -> *mut ClassInner {
        self.0 as *const ClassInner as *mut ClassInner
    }

    pub(crate) unsafe fn from_inner_ptr(ptr: *mut ClassInner) -> Class {
        Class(&*ptr)
    }

    pub(crate) fn kind(self) -> ClassKind {
        self.0.kind
    }

    /// Adds a method to this class's own table.
    pub fn add_method(self, sel: Sel, imp: Imp, types: &str) -> Result<Method> {
        let mut methods = self.0.methods.write().unwrap_or_else(|e| e.into_inner());
        if methods.contains_key(&sel) {
            return Err(RuntimeError::MethodExists {
                class: self.name().to_string(),
                selector: sel.name().to_string(),
            });
        }
        let method = Method(Box::leak(Box::new(MethodInner {
            selector: sel,
            types: types.into(),
            imp: AtomicPtr::new(imp as *mut c_void),
        })));
        methods.insert(sel, method);
        Ok(method)
    }

    /// Adds a method whose type encoding is derived from the function type.
    ///
    /// ```
    /// use swizzle_runtime::{Class, Id, Sel};
    ///
    /// extern "C" fn twice(_this: Id, _cmd: Sel, value: i64) -> i64 {
    ///     value * 2
    /// }
    ///
    /// let class = Class::allocate(Some(Class::root()), "DocTwice").unwrap();
    /// let method = class
    ///     .add_typed_method(Sel::register("twice:"), twice as extern "C" fn(Id, Sel, i64) -> i64)
    ///     .unwrap();
    /// assert_eq!(method.types(), "q@:q");
    /// ```
    pub fn add_typed_method<F: MethodImplementation>(self, sel: Sel, f: F) -> Result<Method> {
        self.add_method(sel, f.imp(), &F::types())
    }

    /// Method defined directly on this class, ignoring superclasses.
    pub fn own_method(self, sel: Sel) -> Option<Method> {
        self.0.methods.read().unwrap_or_else(|e| e.into_inner()).get(&sel).copied()
    }

    /// Method resolved through the superclass chain.
    pub fn method(self, sel: Sel) -> Option<Method> {
        let mut cursor = Some(self);
        while let Some(class) = cursor {
            if let Some(method) = class.own_method(sel) {
                return Some(method);
            }
            cursor = class.superclass();
        }
        None
    }

    pub fn lookup_imp(self, sel: Sel) -> Option<Imp> {
        self.method(sel).map(Method::implementation)
    }

    pub fn responds_to(self, sel: Sel) -> bool {
        self.method(sel).is_some()
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl Eq for Class {}

impl Hash for Class {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0 as *const ClassInner as usize).hash(state)
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_metaclass() {
            write!(f, "Class(meta {})", self.name())
        } else {
            write!(f, "Class({})", self.name())
        }
    }
}

/// `extern "C"` functions usable as method implementations.
pub trait MethodImplementation: Copy {
    fn types() -> String;
    fn imp(self) -> Imp;
}

macro_rules! method_implementation {
    ($($arg:ident),*) => {
        impl<R: Encode, $($arg: Encode),*> MethodImplementation for extern "C" fn(Id, Sel $(, $arg)*) -> R {
            fn types() -> String {
                let mut out = String::new();
                R::encode(&mut out);
                out.push_str("@:");
                $($arg::encode(&mut out);)*
                out
            }

            fn imp(self) -> Imp {
                unsafe { core::mem::transmute::<*const (), Imp>(self as *const ()) }
            }
        }
    };
}

method_implementation!();
method_implementation!(A0);
method_implementation!(A0, A1);
method_implementation!(A0, A1, A2);
method_implementation!(A0, A1, A2, A3);
method_implementation!(A0, A1, A2, A3, A4);
method_implementation!(A0, A1, A2, A3, A4, A5);

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn answer(_this: Id, _cmd: Sel) -> i64 {
        42
    }

    extern "C" fn other_answer(_this: Id, _cmd: Sel) -> i64 {
        7
    }

    #[test]
    fn duplicate_class_names_are_rejected() {
        Class::allocate(Some(Class::root()), "ClassTestsDup").unwrap();
        assert_eq!(
            Class::allocate(Some(Class::root()), "ClassTestsDup"),
            Err(RuntimeError::ClassExists("ClassTestsDup".into()))
        );
    }

    #[test]
    fn methods_resolve_through_superclasses() {
        let base = Class::allocate(Some(Class::root()), "ClassTestsBase").unwrap();
        let derived = Class::allocate(Some(base), "ClassTestsDerived").unwrap();
        let sel = Sel::register("answer");
        let method = base
            .add_typed_method(sel, answer as extern "C" fn(Id, Sel) -> i64)
            .unwrap();

        assert_eq!(method.types(), "q@:");
        assert!(derived.own_method(sel).is_none());
        assert_eq!(derived.method(sel), Some(method));
        assert!(derived.is_subclass_of(base));
        assert!(!base.is_subclass_of(derived));
        assert!(derived.is_reference_counted());
        assert_eq!(Class::lookup("ClassTestsDerived"), Some(derived));
    }

    #[test]
    fn set_implementation_swaps_atomically() {
        let class = Class::allocate(Some(Class::root()), "ClassTestsSwap").unwrap();
        let sel = Sel::register("answer");
        let method = class
            .add_typed_method(sel, answer as extern "C" fn(Id, Sel) -> i64)
            .unwrap();
        let replacement = (other_answer as extern "C" fn(Id, Sel) -> i64).imp();
        let previous = method.set_implementation(replacement);

        assert!(core::ptr::fn_addr_eq(previous, (answer as extern "C" fn(Id, Sel) -> i64).imp()));
        assert!(core::ptr::fn_addr_eq(method.implementation(), replacement));
        assert!(class.add_method(sel, replacement, "q@:").is_err());

        assert!(method.compare_and_set_implementation(previous, replacement).is_err());
        assert!(method.compare_and_set_implementation(replacement, previous).is_ok());
        assert!(core::ptr::fn_addr_eq(method.implementation(), previous));
    }

    #[test]
    fn metaclass_mirrors_the_hierarchy() {
        let base = Class::allocate(Some(Class::root()), "ClassTestsMetaBase").unwrap();
        let derived = Class::allocate(Some(base), "ClassTestsMetaDerived").unwrap();
        let meta = derived.metaclass().unwrap();

        assert!(meta.is_metaclass());
        assert_eq!(meta.superclass(), base.metaclass());
        assert_eq!(derived.as_object().object_class(), meta);
        assert_eq!(Class::from_object(derived.as_object()), Some(derived));
    }
}
