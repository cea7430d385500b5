//! Registration tokens and cancellation.

use crate::closure::ClosureId;
use crate::interceptor::context::DispatchContext;
use crate::interceptor::{dealloc, store, Mode, Shared};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use swizzle_runtime::{Class, WeakId};

/// Outcome of [`Token::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// The closure is gone and everything this registration changed is
    /// restored, or still needed by other registrations of this engine.
    FullyReverted,
    /// The closure is gone, but another mechanism has replaced the entry
    /// point or the object's type tag, so nothing was restored over it.
    PartiallyReverted,
    /// Nothing to do: cancelled before, or the object no longer exists.
    AlreadyCancelled,
}

pub(crate) enum Registration {
    Class {
        context: Weak<DispatchContext>,
        mode: Mode,
        closure: ClosureId,
    },
    Instance {
        object: WeakId,
        base: Class,
        context: Weak<DispatchContext>,
        mode: Mode,
        closure: ClosureId,
    },
    DeallocTail {
        object: WeakId,
        closure: ClosureId,
    },
}

/// Returned by every registration. Holds only weak references, so a closure
/// may capture its own token and cancel itself.
///
/// Dropping a token leaves the interceptor installed.
pub struct Token {
    shared: Weak<Shared>,
    state: Mutex<Option<Registration>>,
}

impl Token {
    pub(crate) fn new(shared: &Arc<Shared>, registration: Registration) -> Token {
        Token {
            shared: Arc::downgrade(shared),
            state: Mutex::new(Some(registration)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Removes the closure. Safe to call repeatedly and from inside the
    /// closure itself.
    pub fn cancel(&self) -> Cancellation {
        let Some(registration) = self.state.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return Cancellation::AlreadyCancelled;
        };
        let Some(shared) = self.shared.upgrade() else {
            return Cancellation::AlreadyCancelled;
        };

        match registration {
            Registration::Class { context, mode, closure } => {
                let Some(context) = context.upgrade() else {
                    return Cancellation::AlreadyCancelled;
                };
                let mut registry = shared.lock();
                if !context.remove(mode, closure) {
                    panic!("{:?} is not registered on {:?}", closure, context);
                }
                if context.has_drifted() {
                    log::warn!(
                        "{}[{}] was replaced outside the interceptor; leaving its context in place",
                        context.key.class.name(),
                        context.key.selector
                    );
                    return Cancellation::PartiallyReverted;
                }
                registry.release(&context);
                Cancellation::FullyReverted
            }
            Registration::Instance { object, base, context, mode, closure } => {
                // Dropped after the registry lock: the last release may
                // deallocate the object through intercepted methods.
                let object = object.upgrade();
                let Some(context) = context.upgrade() else {
                    return Cancellation::AlreadyCancelled;
                };
                let mut registry = shared.lock();
                let Some(object) = object.as_ref() else {
                    registry.release(&context);
                    return Cancellation::AlreadyCancelled;
                };
                if !store::remove(**object, &context, mode, closure) {
                    panic!("{:?} is not registered on {:?} for {:?}", closure, object, context);
                }

                let mut outcome = Cancellation::FullyReverted;
                if store::is_empty(**object) {
                    store::discard(**object);
                    if object.object_class() == context.key.class {
                        object.set_object_class(base);
                        log::debug!("{:?} returned to {}", object, base.name());
                    } else {
                        log::debug!(
                            "type tag of {:p} was changed outside the interceptor; keeping it",
                            object.as_ptr()
                        );
                        outcome = Cancellation::PartiallyReverted;
                    }
                }
                if context.has_drifted() {
                    log::warn!(
                        "{}[{}] was replaced outside the interceptor; leaving its context in place",
                        context.key.class.name(),
                        context.key.selector
                    );
                    return Cancellation::PartiallyReverted;
                }
                registry.release(&context);
                outcome
            }
            Registration::DeallocTail { object, closure } => {
                let object = object.upgrade();
                let _registry = shared.lock();
                let Some(object) = object.as_ref() else {
                    return Cancellation::AlreadyCancelled;
                };
                if !dealloc::detach(**object, closure) {
                    panic!("{:?} is not attached to {:?}", closure, object);
                }
                Cancellation::FullyReverted
            }
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let description = match &*state {
            None => "cancelled",
            Some(Registration::Class { .. }) => "class",
            Some(Registration::Instance { .. }) => "instance",
            Some(Registration::DeallocTail { .. }) => "dealloc tail",
        };
        f.debug_struct("Token").field("registration", &description).finish()
    }
}
