//! Interceptor closures.
//!
//! A [`HookClosure`] wraps a Rust closure behind a block-shaped header: the
//! first word is a native entry point that takes the block pointer followed
//! by the closure's own arguments. The engine calls it through a call
//! interface built from the closure's type encoding, so any `Encode`able
//! argument list works without per-signature glue.

use core::ffi::c_void;
use core::marker::PhantomData;
use std::fmt;
use std::sync::Arc;
use swizzle_runtime::{Encode, Imp};

#[repr(C)]
pub struct BlockHeader {
    invoke: *const c_void,
}

impl BlockHeader {
    pub(crate) fn new(invoke: *const c_void) -> Self {
        Self { invoke }
    }
}

#[repr(C)]
struct BlockLayout<F> {
    header: BlockHeader,
    f: F,
}

// The header only holds a code pointer.
unsafe impl<F: Send> Send for BlockLayout<F> {}
unsafe impl<F: Sync> Sync for BlockLayout<F> {}

trait ErasedBlock: Send + Sync {
    fn header(&self) -> *const BlockHeader;
}

impl<F: Send + Sync> ErasedBlock for BlockLayout<F> {
    fn header(&self) -> *const BlockHeader {
        &self.header
    }
}

/// Identity of a closure; stable for as long as any clone is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClosureId(usize);

/// A type-erased interceptor closure. Clones share identity.
#[derive(Clone)]
pub struct HookClosure {
    block: Arc<dyn ErasedBlock>,
    encoding: Arc<str>,
}

impl HookClosure {
    pub fn new<M, F: IntoHookClosure<M>>(f: F) -> HookClosure {
        f.into_hook_closure()
    }

    fn from_parts<F: Send + Sync + 'static>(invoke: *const c_void, f: F, encoding: String) -> HookClosure {
        HookClosure {
            block: Arc::new(BlockLayout { header: BlockHeader { invoke }, f }),
            encoding: encoding.into(),
        }
    }

    /// Closure-shaped type encoding: return type, `@?`, then parameters.
    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn id(&self) -> ClosureId {
        ClosureId(self.block() as usize)
    }

    pub fn same(&self, other: &HookClosure) -> bool {
        self.id() == other.id()
    }

    pub(crate) fn block(&self) -> *const BlockHeader {
        self.block.header()
    }

    pub(crate) fn entry(&self) -> Imp {
        unsafe { core::mem::transmute::<*const c_void, Imp>((*self.block()).invoke) }
    }
}

impl fmt::Debug for HookClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookClosure")
            .field("id", &self.id())
            .field("encoding", &self.encoding())
            .finish()
    }
}

/// Conversion of Rust closures into [`HookClosure`]s.
///
/// Implemented for `Fn` closures of up to eight parameters whose parameter
/// and return types implement [`Encode`]. Parameters must be annotated so
/// the arity can be inferred:
///
/// ```
/// use swizzle_intercept::HookClosure;
/// use swizzle_runtime::{Id, Sel};
///
/// let closure = HookClosure::new(|_this: Id, _cmd: Sel, a: i64| {
///     let _ = a;
/// });
/// assert_eq!(closure.encoding(), "v@?@:q");
/// ```
///
/// A panic escaping the closure aborts the process, since it would unwind
/// through a native frame.
pub trait IntoHookClosure<Marker> {
    fn into_hook_closure(self) -> HookClosure;
}

impl IntoHookClosure<()> for HookClosure {
    fn into_hook_closure(self) -> HookClosure {
        self
    }
}

macro_rules! hook_closure_arity {
    ($($arg:ident : $ty:ident),*) => {
        impl<F, R, $($ty),*> IntoHookClosure<fn($($ty),*) -> R> for F
        where
            F: Fn($($ty),*) -> R + Send + Sync + 'static,
            R: Encode,
            $($ty: Encode,)*
        {
            fn into_hook_closure(self) -> HookClosure {
                unsafe extern "C" fn invoke<F, R, $($ty),*>(block: *const BlockHeader $(, $arg: $ty)*) -> R
                where
                    F: Fn($($ty),*) -> R,
                {
                    let layout = &*(block as *const BlockLayout<F>);
                    (layout.f)($($arg),*)
                }

                let mut encoding = String::new();
                R::encode(&mut encoding);
                encoding.push_str("@?");
                $($ty::encode(&mut encoding);)*
                let entry = invoke::<F, R, $($ty),*> as unsafe extern "C" fn(*const BlockHeader $(, $ty)*) -> R;
                HookClosure::from_parts(entry as *const c_void, self, encoding)
            }
        }
    };
}

hook_closure_arity!();
hook_closure_arity!(a0: A0);
hook_closure_arity!(a0: A0, a1: A1);
hook_closure_arity!(a0: A0, a1: A1, a2: A2);
hook_closure_arity!(a0: A0, a1: A1, a2: A2, a3: A3);
hook_closure_arity!(a0: A0, a1: A1, a2: A2, a3: A3, a4: A4);
hook_closure_arity!(a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5);
hook_closure_arity!(a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6);
hook_closure_arity!(a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6, a7: A7);

/// Function-pointer types usable as the signature of an [`Original`].
pub trait BlockSignature {
    fn encode_block(out: &mut String);
}

/// The "continue" callable handed to instead closures as their first
/// parameter. `S` is the intercepted method's signature as a function
/// pointer type, receiver and selector included; for `dealloc` it is `fn()`.
///
/// Calling it runs the next earlier instead closure, or the before
/// closures, the original implementation and the after closures when there
/// is none. It may be called any number of times, but only while the
/// instead closure that received it is running.
#[repr(transparent)]
pub struct Original<S> {
    block: *const BlockHeader,
    _signature: PhantomData<S>,
}

impl<S> Clone for Original<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Original<S> {}

impl<S> fmt::Debug for Original<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Original({:p})", self.block)
    }
}

unsafe impl<S: BlockSignature> Encode for Original<S> {
    fn encode(out: &mut String) {
        out.push_str("@?<");
        S::encode_block(out);
        out.push('>');
    }
}

macro_rules! original_arity {
    ($($arg:ident : $ty:ident),*) => {
        impl<R: Encode, $($ty: Encode),*> BlockSignature for fn($($ty),*) -> R {
            fn encode_block(out: &mut String) {
                R::encode(out);
                out.push_str("@?");
                $($ty::encode(out);)*
            }
        }

        impl<R, $($ty),*> Original<fn($($ty),*) -> R> {
            #[allow(clippy::too_many_arguments)]
            pub fn call(&self $(, $arg: $ty)*) -> R {
                unsafe {
                    let invoke: unsafe extern "C" fn(*const BlockHeader $(, $ty)*) -> R =
                        core::mem::transmute((*self.block).invoke);
                    invoke(self.block $(, $arg)*)
                }
            }
        }
    };
}

original_arity!();
original_arity!(a0: A0);
original_arity!(a0: A0, a1: A1);
original_arity!(a0: A0, a1: A1, a2: A2);
original_arity!(a0: A0, a1: A1, a2: A2, a3: A3);
original_arity!(a0: A0, a1: A1, a2: A2, a3: A3, a4: A4);
original_arity!(a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5);
original_arity!(a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6);
