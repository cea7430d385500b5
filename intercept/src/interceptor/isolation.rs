//! Instance isolation.
//!
//! Hooking one object moves it into a private subclass of its class, named
//! with the configured prefix, so contexts installed there only see objects
//! that were moved. The subclass answers `class` with its base, and one
//! subclass serves every object of the same base. Private subclasses and
//! the forwarding methods added to classes are process-wide and never
//! removed: an object or a stale method table entry may still point at them.

use crate::closure::{HookClosure, Original};
use crate::code::{CallInterface, Trampoline};
use crate::config::Config;
use crate::error::{HookError, Result};
use crate::interceptor::context::{ContextKey, DispatchContext, HookEntry};
use crate::interceptor::Mode;
use crate::signature::Signature;
use core::ffi::c_void;
use libffi::low::ffi_cif;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use swizzle_runtime::{common, Class, Id, Method, RuntimeError, Sel};

#[derive(Debug, Clone, Copy)]
pub(crate) struct SubclassRecord {
    pub base: Class,
    pub subclass: Class,
}

/// Forwards a method a class inherits to whatever its superclass resolves
/// the selector to at call time.
struct OverrideContext {
    class: Class,
    selector: Sel,
    cif: CallInterface,
    trampoline: Option<Trampoline>,
}

#[derive(Default)]
struct Isolation {
    /// subclass name -> record
    records: HashMap<String, SubclassRecord>,
    /// subclass -> base
    bases: HashMap<Class, Class>,
    /// `class` contexts of private subclasses, holding the mask.
    masks: HashMap<ContextKey, Arc<DispatchContext>>,
    overrides: Vec<Box<OverrideContext>>,
}

fn isolation() -> &'static Mutex<Isolation> {
    static ISOLATION: OnceLock<Mutex<Isolation>> = OnceLock::new();
    ISOLATION.get_or_init(|| Mutex::new(Isolation::default()))
}

unsafe extern "C" fn forward_to_super(_cif: *mut ffi_cif, ret: *mut c_void, args: *mut *mut c_void, userdata: *mut c_void) {
    let context = &*(userdata as *const OverrideContext);
    let Some(imp) = context.class.superclass().and_then(|s| s.lookup_imp(context.selector)) else {
        panic!("{} lost its inherited {}", context.class.name(), context.selector);
    };
    context.cif.call(imp, ret, args);
}

/// Returns `class`'s own method for `selector`, first adding a forwarding
/// override when the method is only inherited.
pub(crate) fn own_method(class: Class, selector: Sel) -> Result<Method> {
    let mut isolation = isolation().lock().unwrap_or_else(|e| e.into_inner());
    isolation.own_method(class, selector)
}

impl Isolation {
    fn own_method(&mut self, class: Class, selector: Sel) -> Result<Method> {
        if let Some(method) = class.own_method(selector) {
            return Ok(method);
        }
        let inherited = class.method(selector).ok_or(HookError::NoSuchSelector)?;
        let signature = Signature::of_method(inherited)?;
        let cif = CallInterface::new(&signature.args, &signature.ret)?;
        let mut context = Box::new(OverrideContext { class, selector, cif, trampoline: None });
        let userdata = &*context as *const OverrideContext as *mut c_void;
        let trampoline = unsafe { Trampoline::new(&context.cif, forward_to_super, userdata)? };
        let entry = trampoline.entry();
        context.trampoline = Some(trampoline);
        let method = class.add_method(selector, entry, inherited.types())?;
        log::debug!("{} forwards {} to its superclass", class.name(), selector);
        self.overrides.push(context);
        Ok(method)
    }

    fn create(&mut self, base: Class, name: String) -> Result<SubclassRecord> {
        // Classes cannot be unregistered; one left by an attempt that failed
        // after allocation is adopted.
        let subclass = match Class::lookup(&name) {
            Some(existing) if existing.superclass() == Some(base) => {
                log::debug!("adopting unrecorded subclass {} of {}", name, base.name());
                existing
            }
            Some(_) => return Err(RuntimeError::ClassExists(name).into()),
            None => Class::allocate(Some(base), &name)?,
        };
        let record = SubclassRecord { base, subclass };
        let class_sel = common().class;
        self.own_method(subclass, class_sel)?;
        let mask = DispatchContext::install(subclass, class_sel, true)?;
        let closure = HookClosure::new(move |original: Original<fn(Id, Sel) -> Class>, this: Id, cmd: Sel| -> Class {
            let reported = original.call(this, cmd);
            if reported.is_subclass_of(subclass) {
                base
            } else {
                reported
            }
        });
        if let Err(err) = mask.append(Mode::Instead, HookEntry { closure, arity: 0 }) {
            mask.uninstall();
            return Err(err);
        }
        log::debug!("created private subclass {} of {}", name, base.name());

        self.masks.insert(mask.key, mask);
        self.bases.insert(subclass, base);
        self.records.insert(name, record);
        Ok(record)
    }
}

/// Looks up or creates the private subclass of `base` for `config`'s prefix.
pub(crate) fn private_subclass(base: Class, config: &Config) -> Result<SubclassRecord> {
    let name = config.subclass_name(base.name());
    let mut isolation = isolation().lock().unwrap_or_else(|e| e.into_inner());
    if let Some(record) = isolation.records.get(&name) {
        return Ok(*record);
    }
    isolation.create(base, name)
}

/// The nearest private subclass in `class`'s ancestry, `class` included.
pub(crate) fn private_ancestor(class: Class) -> Option<SubclassRecord> {
    let isolation = isolation().lock().unwrap_or_else(|e| e.into_inner());
    let mut cursor = Some(class);
    while let Some(class) = cursor {
        if let Some(base) = isolation.bases.get(&class) {
            return Some(SubclassRecord { base: *base, subclass: class });
        }
        cursor = class.superclass();
    }
    None
}

/// The masking context installed for `key`, if `key` names a private
/// subclass's `class` method.
pub(crate) fn mask_context(key: &ContextKey) -> Option<Arc<DispatchContext>> {
    let isolation = isolation().lock().unwrap_or_else(|e| e.into_inner());
    isolation.masks.get(key).cloned()
}

pub(crate) fn is_private(class: Class) -> bool {
    let isolation = isolation().lock().unwrap_or_else(|e| e.into_inner());
    isolation.bases.contains_key(&class)
}
