//! Per-object interceptor lists, attached to the intercepted object.
//!
//! Entries are keyed by the dispatch context they belong to, so engines that
//! stack contexts on the same private subclass and selector each see only
//! their own closures.

use crate::closure::ClosureId;
use crate::error::{HookError, Result};
use crate::interceptor::context::{DispatchContext, HookEntry, HookLists};
use crate::interceptor::{Mode, Shared};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use swizzle_runtime::{AssociationKey, Id};

static OBJECT_HOOKS: AssociationKey = AssociationKey::new("swizzle.intercept.object-hooks");

/// Address of a dispatch context. Entries hold a `Weak` to it, which keeps
/// the allocation and with it the address from being reused.
type ContextSlot = usize;

fn slot_of(context: &DispatchContext) -> ContextSlot {
    context as *const DispatchContext as usize
}

#[derive(Clone)]
struct ContextHooks {
    context: Weak<DispatchContext>,
    shared: Weak<Shared>,
    lists: Arc<HookLists>,
}

/// Context -> lists for one object. Dropped together with the object,
/// releasing its share of every context it used.
#[derive(Default)]
pub(crate) struct ObjectHooks {
    contexts: RwLock<Arc<HashMap<ContextSlot, ContextHooks>>>,
}

impl ObjectHooks {
    fn snapshot(&self) -> Arc<HashMap<ContextSlot, ContextHooks>> {
        self.contexts.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().values().all(|hooks| hooks.lists.is_empty())
    }
}

impl Drop for ObjectHooks {
    fn drop(&mut self) {
        let contexts = self.contexts.get_mut().unwrap_or_else(|e| e.into_inner());
        let mut unused = Vec::new();
        for hooks in contexts.values() {
            let Some(context) = hooks.context.upgrade() else {
                continue;
            };
            context.remove_object_hooks(hooks.lists.len());
            if let Some(shared) = hooks.shared.upgrade() {
                unused.push((shared, context));
            }
        }
        // A context stacked on another one must go first, so retry until a
        // round tears nothing down.
        loop {
            let pending = unused.len();
            unused.retain(|(shared, context)| !shared.release_unused(context));
            if unused.is_empty() || unused.len() == pending {
                break;
            }
        }
    }
}

/// Lists registered on `object` for `context`, read without the engine lock.
pub(crate) fn object_lists(object: Id, context: &DispatchContext) -> Option<Arc<HookLists>> {
    let hooks = object.associated::<ObjectHooks>(&OBJECT_HOOKS)?;
    let snapshot = hooks.snapshot();
    snapshot.get(&slot_of(context)).map(|hooks| hooks.lists.clone())
}

pub(crate) fn is_empty(object: Id) -> bool {
    object
        .associated::<ObjectHooks>(&OBJECT_HOOKS)
        .is_none_or(|hooks| hooks.is_empty())
}

pub(crate) fn append(
    object: Id,
    shared: &Arc<Shared>,
    context: &Arc<DispatchContext>,
    mode: Mode,
    entry: HookEntry,
) -> Result<()> {
    let Some(hooks) = object.associated_or_insert_with(&OBJECT_HOOKS, || Arc::new(ObjectHooks::default())) else {
        return Err(HookError::ForeignAssociation(OBJECT_HOOKS.name()));
    };
    let slot = slot_of(context);
    let mut contexts = hooks.contexts.write().unwrap_or_else(|e| e.into_inner());
    let current = contexts.get(&slot).map(|hooks| hooks.lists.clone()).unwrap_or_default();
    let lists = Arc::new(current.with(mode, entry)?);

    let mut next = HashMap::clone(&contexts);
    next.insert(
        slot,
        ContextHooks {
            context: Arc::downgrade(context),
            shared: Arc::downgrade(shared),
            lists,
        },
    );
    *contexts = Arc::new(next);
    context.add_object_hooks(1);
    Ok(())
}

/// Removes `id` from the object's `mode` list for `context`. Returns false
/// when the closure is not registered there.
pub(crate) fn remove(object: Id, context: &DispatchContext, mode: Mode, id: ClosureId) -> bool {
    let Some(hooks) = object.associated::<ObjectHooks>(&OBJECT_HOOKS) else {
        return false;
    };
    let slot = slot_of(context);
    let mut contexts = hooks.contexts.write().unwrap_or_else(|e| e.into_inner());
    let Some(lists) = contexts.get(&slot).and_then(|hooks| hooks.lists.without(mode, id)) else {
        return false;
    };

    let mut next = HashMap::clone(&contexts);
    if lists.is_empty() {
        next.remove(&slot);
    } else if let Some(hooks) = next.get_mut(&slot) {
        hooks.lists = Arc::new(lists);
    }
    *contexts = Arc::new(next);
    context.remove_object_hooks(1);
    true
}

/// Detaches an empty store.
pub(crate) fn discard(object: Id) {
    if is_empty(object) {
        object.remove_associated(&OBJECT_HOOKS);
    }
}
