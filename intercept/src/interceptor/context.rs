//! Dispatch contexts: one installed entry point per (class, selector).

use crate::closure::{ClosureId, HookClosure};
use crate::code::{CallInterface, Trampoline};
use crate::error::{HookError, Result};
use crate::interceptor::dispatch;
use crate::interceptor::Mode;
use crate::signature::{Encoding, Primitive, Signature};
use core::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use swizzle_runtime::{common, Class, Imp, Method, Sel};

#[derive(Debug, Clone)]
pub(crate) struct HookEntry {
    pub closure: HookClosure,
    /// Number of method arguments passed to before/after closures.
    pub arity: usize,
}

/// Interceptor lists, replaced wholesale on every change so call-time
/// readers keep a consistent snapshot.
#[derive(Debug, Clone, Default)]
pub(crate) struct HookLists {
    pub before: Vec<HookEntry>,
    pub instead: Vec<HookEntry>,
    pub after: Vec<HookEntry>,
}

impl HookLists {
    pub fn list(&self, mode: Mode) -> &[HookEntry] {
        match mode {
            Mode::Before => &self.before,
            Mode::Instead => &self.instead,
            Mode::After => &self.after,
        }
    }

    fn list_mut(&mut self, mode: Mode) -> &mut Vec<HookEntry> {
        match mode {
            Mode::Before => &mut self.before,
            Mode::Instead => &mut self.instead,
            Mode::After => &mut self.after,
        }
    }

    pub fn contains(&self, mode: Mode, id: ClosureId) -> bool {
        self.list(mode).iter().any(|e| e.closure.id() == id)
    }

    pub fn with(&self, mode: Mode, entry: HookEntry) -> Result<HookLists> {
        if self.contains(mode, entry.closure.id()) {
            return Err(HookError::DuplicateInterceptor);
        }
        let mut next = self.clone();
        next.list_mut(mode).push(entry);
        Ok(next)
    }

    pub fn without(&self, mode: Mode, id: ClosureId) -> Option<HookLists> {
        let index = self.list(mode).iter().position(|e| e.closure.id() == id)?;
        let mut next = self.clone();
        next.list_mut(mode).remove(index);
        Some(next)
    }

    pub fn len(&self) -> usize {
        self.before.len() + self.instead.len() + self.after.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ContextKey {
    pub class: Class,
    pub selector: Sel,
}

pub(crate) struct DispatchContext {
    pub key: ContextKey,
    pub method: Method,
    pub signature: Signature,
    /// Installed on a private subclass; per-object stores are consulted.
    pub isolated: bool,
    pub dealloc: bool,
    original: Imp,
    lists: RwLock<Arc<HookLists>>,
    object_hooks: AtomicUsize,
    active_calls: AtomicUsize,
    installed: AtomicBool,
    method_cif: CallInterface,
    hook_cifs: Vec<(usize, CallInterface)>,
    instead_cif: CallInterface,
    continue_cif: CallInterface,
    method_trampoline: Option<Trampoline>,
    continue_trampoline: Option<Trampoline>,
}

// Raw pointers inside the call interfaces and trampolines are immutable
// after construction.
unsafe impl Send for DispatchContext {}
unsafe impl Sync for DispatchContext {}

impl DispatchContext {
    /// Builds the call interfaces and trampolines for `class`'s own
    /// implementation of `selector`, then installs the method trampoline.
    pub fn install(class: Class, selector: Sel, isolated: bool) -> Result<Arc<DispatchContext>> {
        let method = class.own_method(selector).ok_or(HookError::NoSuchSelector)?;
        loop {
            let original = method.implementation();
            let context = DispatchContext::build(class, selector, method, isolated, original)?;
            let entry = context.entry();
            match method.compare_and_set_implementation(original, entry) {
                Ok(()) => {
                    context.installed.store(true, Ordering::Release);
                    log::debug!(
                        "installed dispatch context for {}[{}] ({})",
                        class.name(),
                        selector,
                        context.signature.codes()
                    );
                    return Ok(context);
                }
                Err(_) => log::debug!("entry point of {}[{}] moved during install; retrying", class.name(), selector),
            }
        }
    }

    /// Fails when no call interface can be prepared for `method`, before
    /// anything is allocated for it.
    pub fn check_marshaling(method: Method) -> Result<()> {
        let signature = Signature::of_method(method)?;
        CallInterface::new(&signature.args, &signature.ret).map(drop)
    }

    fn build(class: Class, selector: Sel, method: Method, isolated: bool, original: Imp) -> Result<Arc<DispatchContext>> {
        let signature = Signature::of_method(method)?;
        let dealloc = selector == common().dealloc;
        let closure = Encoding::Closure(None);
        let void = Encoding::Primitive(Primitive::Void);
        let args = &signature.args;

        let method_cif = CallInterface::new(args, &signature.ret)?;

        let mut prefixes = vec![0, 1, 2, args.len()];
        prefixes.retain(|n| *n <= args.len());
        prefixes.sort_unstable();
        prefixes.dedup();
        let hook_cifs = prefixes
            .into_iter()
            .map(|n| {
                let mut hook_args = vec![closure.clone()];
                hook_args.extend_from_slice(&args[..n]);
                CallInterface::new(&hook_args, &void).map(|cif| (n, cif))
            })
            .collect::<Result<Vec<_>>>()?;

        let (instead_cif, continue_cif) = if dealloc {
            (
                CallInterface::new(&[closure.clone(), closure.clone()], &void)?,
                CallInterface::new(&[closure], &void)?,
            )
        } else {
            let mut instead_args = vec![closure.clone(), closure.clone()];
            instead_args.extend_from_slice(args);
            let mut continue_args = vec![closure];
            continue_args.extend_from_slice(args);
            (
                CallInterface::new(&instead_args, &signature.ret)?,
                CallInterface::new(&continue_args, &signature.ret)?,
            )
        };

        let mut context = Arc::new(DispatchContext {
            key: ContextKey { class, selector },
            method,
            signature,
            isolated,
            dealloc,
            original,
            lists: RwLock::new(Arc::new(HookLists::default())),
            object_hooks: AtomicUsize::new(0),
            active_calls: AtomicUsize::new(0),
            installed: AtomicBool::new(false),
            method_cif,
            hook_cifs,
            instead_cif,
            continue_cif,
            method_trampoline: None,
            continue_trampoline: None,
        });

        let userdata = Arc::as_ptr(&context) as *mut c_void;
        let (method_trampoline, continue_trampoline) = unsafe {
            (
                Trampoline::new(&context.method_cif, dispatch::method_called, userdata)?,
                Trampoline::new(&context.continue_cif, dispatch::continue_called, userdata)?,
            )
        };
        let Some(inner) = Arc::get_mut(&mut context) else {
            unreachable!("dispatch context shared before installation");
        };
        inner.method_trampoline = Some(method_trampoline);
        inner.continue_trampoline = Some(continue_trampoline);
        Ok(context)
    }

    pub fn original(&self) -> Imp {
        self.original
    }

    /// Entry point of the method trampoline.
    pub fn entry(&self) -> Imp {
        match &self.method_trampoline {
            Some(trampoline) => trampoline.entry(),
            None => unreachable!("dispatch context without trampoline"),
        }
    }

    pub fn continue_entry(&self) -> *const c_void {
        match &self.continue_trampoline {
            Some(trampoline) => trampoline.entry() as *const c_void,
            None => unreachable!("dispatch context without continue trampoline"),
        }
    }

    pub fn method_cif(&self) -> &CallInterface {
        &self.method_cif
    }

    pub fn instead_cif(&self) -> &CallInterface {
        &self.instead_cif
    }

    pub fn hook_cif(&self, arity: usize) -> &CallInterface {
        match self.hook_cifs.iter().find(|(n, _)| *n == arity) {
            Some((_, cif)) => cif,
            None => panic!("no call interface for {arity} arguments on {}", self.key.selector),
        }
    }

    pub fn snapshot(&self) -> Arc<HookLists> {
        self.lists.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn append(&self, mode: Mode, entry: HookEntry) -> Result<()> {
        let mut lists = self.lists.write().unwrap_or_else(|e| e.into_inner());
        let next = lists.with(mode, entry)?;
        *lists = Arc::new(next);
        Ok(())
    }

    pub fn remove(&self, mode: Mode, id: ClosureId) -> bool {
        let mut lists = self.lists.write().unwrap_or_else(|e| e.into_inner());
        match lists.without(mode, id) {
            Some(next) => {
                *lists = Arc::new(next);
                true
            }
            None => false,
        }
    }

    pub fn add_object_hooks(&self, count: usize) {
        self.object_hooks.fetch_add(count, Ordering::AcqRel);
    }

    pub fn remove_object_hooks(&self, count: usize) {
        let update = self
            .object_hooks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(count)));
        if let Ok(previous) = update {
            if previous < count {
                log::warn!(
                    "per-object hook count of {}[{}] dropped below zero ({previous} - {count})",
                    self.key.class.name(),
                    self.key.selector
                );
            }
        }
    }

    pub fn object_hooks(&self) -> usize {
        self.object_hooks.load(Ordering::Acquire)
    }

    /// No closures in the context's own lists or in any live object's store.
    pub fn is_idle(&self) -> bool {
        self.snapshot().is_empty() && self.object_hooks() == 0
    }

    /// The method's live entry point is no longer this context's trampoline.
    pub fn has_drifted(&self) -> bool {
        self.key.class.own_method(self.key.selector) != Some(self.method)
            || !core::ptr::fn_addr_eq(self.method.implementation(), self.entry())
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Restores the captured original entry point if the trampoline is still
    /// the live one.
    pub fn uninstall(&self) -> bool {
        if !self.is_installed() {
            return false;
        }
        match self.method.compare_and_set_implementation(self.entry(), self.original) {
            Ok(()) => {
                self.installed.store(false, Ordering::Release);
                log::debug!("restored {}[{}]", self.key.class.name(), self.key.selector);
                true
            }
            Err(_) => false,
        }
    }

    pub fn enter(&self) -> ActiveCall<'_> {
        self.active_calls.fetch_add(1, Ordering::AcqRel);
        ActiveCall(self)
    }

    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::Acquire)
    }
}

/// Marks a call executing inside the context's trampolines.
pub(crate) struct ActiveCall<'a>(&'a DispatchContext);

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.0.active_calls.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("class", &self.key.class)
            .field("selector", &self.key.selector)
            .field("isolated", &self.isolated)
            .field("closures", &self.snapshot().len())
            .field("object_hooks", &self.object_hooks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swizzle_runtime::Id;

    extern "C" fn noop(_this: Id, _cmd: Sel) {}

    fn entry(f: impl Fn() + Send + Sync + 'static) -> HookEntry {
        HookEntry { closure: HookClosure::new(f), arity: 0 }
    }

    #[test]
    fn lists_reject_duplicates_per_mode() {
        let a = entry(|| {});
        let lists = HookLists::default().with(Mode::Before, a.clone()).unwrap();
        assert_eq!(
            lists.with(Mode::Before, a.clone()).unwrap_err(),
            HookError::DuplicateInterceptor
        );
        let lists = lists.with(Mode::After, a.clone()).unwrap();
        assert_eq!(lists.len(), 2);
    }

    #[test]
    fn removal_is_by_identity() {
        let a = entry(|| {});
        let b = entry(|| {});
        let lists = HookLists::default()
            .with(Mode::Instead, a.clone())
            .unwrap()
            .with(Mode::Instead, b.clone())
            .unwrap();
        let lists = lists.without(Mode::Instead, a.closure.id()).unwrap();
        assert_eq!(lists.instead.len(), 1);
        assert!(lists.instead[0].closure.same(&b.closure));
        assert!(lists.without(Mode::Instead, a.closure.id()).is_none());
        assert!(lists.without(Mode::Before, b.closure.id()).is_none());
    }

    #[test]
    fn object_hook_count_never_wraps() {
        let _guard = crate::lock_hook_tests();
        let class = Class::allocate(Some(Class::root()), "ContextTestsSaturate").unwrap();
        let sel = Sel::register("noop");
        class.add_typed_method(sel, noop as extern "C" fn(Id, Sel)).unwrap();
        let context = DispatchContext::install(class, sel, true).unwrap();

        context.add_object_hooks(1);
        context.remove_object_hooks(2);
        assert_eq!(context.object_hooks(), 0);
        assert!(context.is_idle());
        assert!(context.uninstall());
    }
}
