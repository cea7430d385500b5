//! Call-time multiplexing.
//!
//! Every call into an intercepted method lands in [`method_called`] through
//! the context's method trampoline. Instead closures receive a
//! [`Continuation`] whose header points at the context's continue
//! trampoline, so calling it from the closure lands in [`continue_called`].

use crate::closure::{BlockHeader, ClosureId};
use crate::interceptor::context::{DispatchContext, HookEntry, HookLists};
use crate::interceptor::store;
use core::ffi::c_void;
use libffi::low::ffi_cif;
use std::sync::Arc;
use swizzle_runtime::Id;

/// The lists in effect for one call: the context's own lists, then the
/// receiver's per-object lists when the context is instance scoped.
struct Effective {
    own: Arc<HookLists>,
    object: Option<Arc<HookLists>>,
}

impl Effective {
    fn gather(context: &DispatchContext, receiver: Option<Id>) -> Effective {
        let object = match receiver {
            Some(receiver) if context.isolated => store::object_lists(receiver, context),
            _ => None,
        };
        Effective { own: context.snapshot(), object }
    }

    fn instead(&self) -> impl DoubleEndedIterator<Item = &HookEntry> + '_ {
        let object = self.object.iter().flat_map(|lists| lists.instead.iter());
        self.own.instead.iter().chain(object)
    }

    fn before(&self) -> impl DoubleEndedIterator<Item = &HookEntry> + '_ {
        let object = self.object.iter().flat_map(|lists| lists.before.iter());
        self.own.before.iter().chain(object)
    }

    fn after(&self) -> impl DoubleEndedIterator<Item = &HookEntry> + '_ {
        let object = self.object.iter().flat_map(|lists| lists.after.iter());
        self.own.after.iter().chain(object)
    }

    /// The instead closure registered just before `id`.
    fn instead_preceding(&self, id: ClosureId) -> Lookup<'_> {
        let mut previous = None;
        for entry in self.instead() {
            if entry.closure.id() == id {
                return match previous {
                    Some(entry) => Lookup::Next(entry),
                    None => Lookup::First,
                };
            }
            previous = Some(entry);
        }
        Lookup::Missing
    }
}

enum Lookup<'a> {
    Next(&'a HookEntry),
    First,
    Missing,
}

/// The "continue" callable handed to one instead closure invocation. Lives
/// on the stack of the frame that invoked the closure.
#[repr(C)]
struct Continuation {
    header: BlockHeader,
    receiver: Option<Id>,
    handed_to: ClosureId,
}

unsafe fn receiver_of(args: *mut *mut c_void) -> Option<Id> {
    Id::from_ptr(*(*args as *const *mut c_void))
}

/// Entry callback of the method trampoline.
pub(crate) unsafe extern "C" fn method_called(
    _cif: *mut ffi_cif,
    ret: *mut c_void,
    args: *mut *mut c_void,
    userdata: *mut c_void,
) {
    let context = &*(userdata as *const DispatchContext);
    let _active = context.enter();
    let receiver = receiver_of(args);
    let effective = Effective::gather(context, receiver);
    match effective.instead().next_back() {
        Some(last) => call_instead(context, last, receiver, ret, args),
        None => run_sequence(context, &effective, ret, args),
    };
}

/// Entry callback of the continue trampoline.
pub(crate) unsafe extern "C" fn continue_called(
    _cif: *mut ffi_cif,
    ret: *mut c_void,
    args: *mut *mut c_void,
    userdata: *mut c_void,
) {
    let context = &*(userdata as *const DispatchContext);
    let _active = context.enter();
    let continuation = &**(*args as *const *const Continuation);

    let mut receiver = continuation.receiver.map_or(core::ptr::null_mut(), |id| id.as_ptr());
    let mut selector = context.key.selector;
    let mut synthesized: [*mut c_void; 2] = [
        &mut receiver as *mut *mut c_void as *mut c_void,
        &mut selector as *mut _ as *mut c_void,
    ];
    // dealloc continuations are called without arguments.
    let method_args = if context.dealloc {
        synthesized.as_mut_ptr()
    } else {
        args.add(1)
    };

    let effective = Effective::gather(context, continuation.receiver);
    match effective.instead_preceding(continuation.handed_to) {
        Lookup::Next(entry) => call_instead(context, entry, continuation.receiver, ret, method_args),
        Lookup::First => run_sequence(context, &effective, ret, method_args),
        Lookup::Missing => {
            log::warn!(
                "instead closure {:?} left {}[{}] while running; continuing with the original",
                continuation.handed_to,
                context.key.class.name(),
                context.key.selector
            );
            run_sequence(context, &effective, ret, method_args)
        }
    };
}

unsafe fn call_instead(
    context: &DispatchContext,
    entry: &HookEntry,
    receiver: Option<Id>,
    ret: *mut c_void,
    method_args: *mut *mut c_void,
) {
    let continuation = Continuation {
        header: BlockHeader::new(context.continue_entry()),
        receiver,
        handed_to: entry.closure.id(),
    };
    let mut block = entry.closure.block() as *const c_void;
    let mut original = &continuation as *const Continuation as *const c_void;

    let cif = context.instead_cif();
    let mut argv: Vec<*mut c_void> = Vec::with_capacity(cif.arg_count());
    argv.push(&mut block as *mut *const c_void as *mut c_void);
    argv.push(&mut original as *mut *const c_void as *mut c_void);
    for i in 0..cif.arg_count() - 2 {
        argv.push(*method_args.add(i));
    }
    cif.call(entry.closure.entry(), ret, argv.as_mut_ptr());
}

/// Before closures newest first, the original implementation, then after
/// closures newest first.
unsafe fn run_sequence(context: &DispatchContext, effective: &Effective, ret: *mut c_void, args: *mut *mut c_void) {
    for entry in effective.before().rev() {
        call_hook(context, entry, args);
    }
    context.method_cif().call(context.original(), ret, args);
    for entry in effective.after().rev() {
        call_hook(context, entry, args);
    }
}

unsafe fn call_hook(context: &DispatchContext, entry: &HookEntry, args: *mut *mut c_void) {
    let mut block = entry.closure.block() as *const c_void;
    let mut argv: Vec<*mut c_void> = Vec::with_capacity(entry.arity + 1);
    argv.push(&mut block as *mut *const c_void as *mut c_void);
    for i in 0..entry.arity {
        argv.push(*args.add(i));
    }
    let mut ignored = 0_u64;
    context
        .hook_cif(entry.arity)
        .call(entry.closure.entry(), &mut ignored as *mut u64 as *mut c_void, argv.as_mut_ptr());
}
