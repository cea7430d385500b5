//! The interception engine.
//!
//! A [`DispatchContext`] owns one (class, selector) pair: it captures the
//! method's entry point once, installs a trampoline in its place and
//! multiplexes every call across its before, instead and after lists.
//! Instance targets are moved into a private subclass first (see
//! [`isolation`]) and keep their closures in a per-object store.

use crate::closure::HookClosure;
use crate::config::Config;
use crate::error::{HookError, Result};
use crate::validate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, TryLockError, Weak};
use swizzle_runtime::{common, Class, Id, Sel};

pub(crate) mod context;
pub(crate) mod dealloc;
pub(crate) mod dispatch;
pub(crate) mod isolation;
pub(crate) mod store;
pub mod token;

use context::{ContextKey, DispatchContext, HookEntry};
pub use token::{Cancellation, Token};

/// What a registration applies to.
#[derive(Debug, Clone, Copy)]
pub enum Target {
    /// One object; siblings of the same class are unaffected.
    Instance(Id),
    /// Every instance of the class and its subclasses.
    AllInstances(Class),
    /// A method on the class object itself.
    ClassMethod(Class),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Before,
    After,
    Instead,
}

pub(crate) struct Registry {
    contexts: HashMap<ContextKey, Arc<DispatchContext>>,
    /// Torn-down contexts whose trampolines were still executing.
    retired: Vec<Arc<DispatchContext>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            contexts: HashMap::new(),
            retired: Vec::new(),
        }
    }

    fn context_for(&mut self, class: Class, selector: Sel, isolated: bool) -> Result<Arc<DispatchContext>> {
        let key = ContextKey { class, selector };
        if let Some(context) = self.contexts.get(&key) {
            return Ok(context.clone());
        }
        if let Some(mask) = isolation::mask_context(&key) {
            return Ok(mask);
        }
        isolation::own_method(class, selector)?;
        let context = DispatchContext::install(class, selector, isolated)?;
        if self.contexts.insert(key, context.clone()).is_some() {
            panic!("two dispatch contexts for {}[{}]", class.name(), selector);
        }
        Ok(context)
    }

    /// Tears `context` down once nothing uses it and its trampoline is still
    /// the live entry point. Returns whether it was torn down.
    pub(crate) fn release(&mut self, context: &Arc<DispatchContext>) -> bool {
        self.retired.retain(|retired| retired.active_calls() > 0);
        if !context.is_idle() || context.has_drifted() {
            return false;
        }
        let Some(registered) = self.contexts.get(&context.key) else {
            return false;
        };
        if !Arc::ptr_eq(registered, context) {
            return false;
        }
        if !context.uninstall() {
            return false;
        }
        let Some(context) = self.contexts.remove(&context.key) else {
            return false;
        };
        log::debug!("tore down {}[{}]", context.key.class.name(), context.key.selector);
        if context.active_calls() > 0 {
            self.retired.push(context);
        }
        true
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for (_, context) in self.contexts.drain() {
            if context.active_calls() == 0 && context.uninstall() {
                continue;
            }
            // Still reachable from a live entry point.
            log::warn!(
                "leaking dispatch context for {}[{}]",
                context.key.class.name(),
                context.key.selector
            );
            std::mem::forget(context);
        }
        for context in self.retired.drain(..) {
            if context.active_calls() > 0 {
                std::mem::forget(context);
            }
        }
    }
}

pub(crate) struct Shared {
    config: Config,
    registry: Mutex<Registry>,
    /// Contexts left unused by dying objects while the registry was locked.
    pending: Mutex<Vec<Weak<DispatchContext>>>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Registry> {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        for context in pending.iter().filter_map(Weak::upgrade) {
            registry.release(&context);
        }
        registry
    }

    /// Releases `context` after the last object using it died. An object can
    /// die while this engine's lock is held, so a locked registry defers the
    /// release to its next access. Returns false only when the context was
    /// checked and is still needed.
    pub(crate) fn release_unused(&self, context: &Arc<DispatchContext>) -> bool {
        match self.registry.try_lock() {
            Ok(mut registry) => registry.release(context),
            Err(TryLockError::Poisoned(err)) => err.into_inner().release(context),
            Err(TryLockError::WouldBlock) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(Arc::downgrade(context));
                true
            }
        }
    }
}

/// Entry point for registering interceptors.
///
/// [`Interceptor::obtain`] returns the process-wide engine; engines built
/// with [`Interceptor::with_config`] keep their own contexts and restore
/// every method they still hold when dropped. Registration and cancellation
/// are serialized per engine, intercepted calls never take the lock.
#[derive(Clone)]
pub struct Interceptor {
    shared: Arc<Shared>,
}

impl Interceptor {
    pub fn obtain() -> &'static Interceptor {
        static INSTANCE: OnceLock<Interceptor> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            let config = Config::from_env().unwrap_or_else(|err| {
                log::warn!("ignoring interceptor config: {err}");
                Config::default()
            });
            Interceptor::with_config(config)
        })
    }

    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Mutex::new(Registry::new()),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Registers `closure` to run `mode` relative to `selector` on `target`.
    ///
    /// Nothing is installed when this fails. `dealloc` is routed to
    /// [`Interceptor::intercept_deallocation`].
    pub fn intercept(&self, target: Target, selector: Sel, mode: Mode, closure: HookClosure) -> Result<Token> {
        if selector == common().dealloc {
            return self.intercept_deallocation(target, mode, closure);
        }
        validate::selector(&self.shared.config, selector)?;
        match target {
            Target::Instance(object) => {
                if object.is_class_object() {
                    return Err(HookError::ClassObjectAsInstance);
                }
                let method = object.object_class().method(selector).ok_or(HookError::NoSuchSelector)?;
                let arity = validate::method_closure(method, mode, &closure)?;
                DispatchContext::check_marshaling(method)?;
                self.register_instance(object, selector, mode, HookEntry { closure, arity })
            }
            Target::AllInstances(class) => {
                let method = class.method(selector).ok_or(HookError::NoSuchSelector)?;
                let arity = validate::method_closure(method, mode, &closure)?;
                self.register_class(class, selector, mode, HookEntry { closure, arity })
            }
            Target::ClassMethod(class) => {
                let meta = class.metaclass().ok_or(HookError::NoSuchSelector)?;
                let method = meta.method(selector).ok_or(HookError::NoSuchSelector)?;
                let arity = validate::method_closure(method, mode, &closure)?;
                self.register_class(meta, selector, mode, HookEntry { closure, arity })
            }
        }
    }

    /// Registers `closure` around the destruction of `target`.
    ///
    /// `After` on an instance attaches a tail observer that runs while the
    /// object releases its associated values. Every other combination goes
    /// through a dispatch context on `dealloc` and needs a reference-counted
    /// class. Class objects are never deallocated.
    pub fn intercept_deallocation(&self, target: Target, mode: Mode, closure: HookClosure) -> Result<Token> {
        let dealloc_sel = common().dealloc;
        match target {
            Target::ClassMethod(_) => Err(HookError::UnsupportedDeallocInterception),
            Target::Instance(object) if object.is_class_object() => Err(HookError::ClassObjectAsInstance),
            Target::Instance(object) if mode == Mode::After => {
                let arity = validate::dealloc_closure(mode, &closure)?;
                let _registry = self.shared.lock();
                let id = closure.id();
                dealloc::attach(object, HookEntry { closure, arity })?;
                log::debug!("attached dealloc observer to {:?}", object);
                Ok(Token::new(
                    &self.shared,
                    token::Registration::DeallocTail { object: object.downgrade(), closure: id },
                ))
            }
            Target::Instance(object) => {
                if !object.object_class().is_reference_counted() {
                    return Err(HookError::UnsupportedDeallocInterception);
                }
                let arity = validate::dealloc_closure(mode, &closure)?;
                self.register_instance(object, dealloc_sel, mode, HookEntry { closure, arity })
            }
            Target::AllInstances(class) => {
                if !class.is_reference_counted() {
                    return Err(HookError::UnsupportedDeallocInterception);
                }
                let arity = validate::dealloc_closure(mode, &closure)?;
                self.register_class(class, dealloc_sel, mode, HookEntry { closure, arity })
            }
        }
    }

    fn register_class(&self, class: Class, selector: Sel, mode: Mode, entry: HookEntry) -> Result<Token> {
        let mut registry = self.shared.lock();
        let context = registry.context_for(class, selector, false)?;
        let id = entry.closure.id();
        if let Err(err) = context.append(mode, entry) {
            registry.release(&context);
            return Err(err);
        }
        log::debug!("{:?} interceptor on {}[{}]", mode, class.name(), selector);
        Ok(Token::new(
            &self.shared,
            token::Registration::Class {
                context: Arc::downgrade(&context),
                mode,
                closure: id,
            },
        ))
    }

    fn register_instance(&self, object: Id, selector: Sel, mode: Mode, entry: HookEntry) -> Result<Token> {
        let mut registry = self.shared.lock();
        let current = object.object_class();
        let (record, move_object) = match isolation::private_ancestor(current) {
            Some(record) => (record, false),
            None => (isolation::private_subclass(current, &self.shared.config)?, true),
        };
        let context = registry.context_for(record.subclass, selector, true)?;
        let id = entry.closure.id();
        if let Err(err) = store::append(object, &self.shared, &context, mode, entry) {
            registry.release(&context);
            return Err(err);
        }
        if move_object {
            object.set_object_class(record.subclass);
            log::debug!("moved {:p} from {} to {}", object.as_ptr(), current.name(), record.subclass.name());
        }
        log::debug!("{:?} interceptor on {:p}[{}]", mode, object.as_ptr(), selector);
        Ok(Token::new(
            &self.shared,
            token::Registration::Instance {
                object: object.downgrade(),
                base: record.base,
                context: Arc::downgrade(&context),
                mode,
                closure: id,
            },
        ))
    }

    /// Whether this engine has a dispatch context on `class` for `selector`.
    pub fn is_intercepting(&self, class: Class, selector: Sel) -> bool {
        let key = ContextKey { class, selector };
        self.shared.lock().contexts.contains_key(&key)
    }

    pub fn context_count(&self) -> usize {
        self.shared.lock().contexts.len()
    }
}

impl Default for Interceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("config", &self.shared.config)
            .field("contexts", &self.context_count())
            .finish()
    }
}
