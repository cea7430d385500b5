//! Tail observers of object disposal.

use crate::closure::{BlockHeader, ClosureId};
use crate::error::{HookError, Result};
use crate::interceptor::context::HookEntry;
use std::sync::{Arc, Mutex};
use swizzle_runtime::{AssociationKey, Id};

static DEALLOC_DELEGATE: AssociationKey = AssociationKey::new("swizzle.intercept.dealloc-delegate");

/// Attached to an observed object; runs its closures newest first when the
/// object drops its associated values during disposal.
#[derive(Default)]
pub(crate) struct DeallocDelegate {
    closures: Mutex<Vec<HookEntry>>,
}

impl Drop for DeallocDelegate {
    fn drop(&mut self) {
        let closures = std::mem::take(self.closures.get_mut().unwrap_or_else(|e| e.into_inner()));
        for entry in closures.into_iter().rev() {
            let invoke: unsafe extern "C" fn(*const BlockHeader) =
                unsafe { core::mem::transmute(entry.closure.entry()) };
            unsafe { invoke(entry.closure.block()) };
        }
    }
}

pub(crate) fn attach(object: Id, entry: HookEntry) -> Result<()> {
    let Some(delegate) =
        object.associated_or_insert_with(&DEALLOC_DELEGATE, || Arc::new(DeallocDelegate::default()))
    else {
        return Err(HookError::ForeignAssociation(DEALLOC_DELEGATE.name()));
    };
    let mut closures = delegate.closures.lock().unwrap_or_else(|e| e.into_inner());
    if closures.iter().any(|e| e.closure.same(&entry.closure)) {
        return Err(HookError::DuplicateInterceptor);
    }
    closures.push(entry);
    Ok(())
}

/// Returns false when the closure is not attached.
pub(crate) fn detach(object: Id, id: ClosureId) -> bool {
    let Some(delegate) = object.associated::<DeallocDelegate>(&DEALLOC_DELEGATE) else {
        return false;
    };
    let emptied = {
        let mut closures = delegate.closures.lock().unwrap_or_else(|e| e.into_inner());
        let Some(index) = closures.iter().position(|e| e.closure.id() == id) else {
            return false;
        };
        closures.remove(index);
        closures.is_empty()
    };
    if emptied {
        object.remove_associated(&DEALLOC_DELEGATE);
    }
    true
}
