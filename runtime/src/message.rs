//! Message dispatch and the root class.

use crate::class::{Class, ClassKind, Imp, MethodImplementation};
use crate::encode::Encode;
use crate::object::Id;
use crate::sel::{common, Sel};
use core::ffi::c_void;

/// Argument tuples that can be marshaled into a method call.
pub trait MessageArguments: Sized {
    fn encode_arguments(out: &mut String);

    /// # Safety
    ///
    /// `imp` must have the signature `R (Id, Sel, args...)`.
    unsafe fn invoke<R>(imp: Imp, receiver: Id, sel: Sel, args: Self) -> R;
}

macro_rules! message_arguments {
    ($($arg:ident : $ty:ident),*) => {
        impl<$($ty: Encode),*> MessageArguments for ($($ty,)*) {
            fn encode_arguments(_out: &mut String) {
                $($ty::encode(_out);)*
            }

            #[allow(clippy::unused_unit)]
            unsafe fn invoke<R>(imp: Imp, receiver: Id, sel: Sel, args: Self) -> R {
                let ($($arg,)*) = args;
                let imp: unsafe extern "C" fn(Id, Sel $(, $ty)*) -> R = core::mem::transmute(imp);
                imp(receiver, sel $(, $arg)*)
            }
        }
    };
}

message_arguments!();
message_arguments!(a0: A0);
message_arguments!(a0: A0, a1: A1);
message_arguments!(a0: A0, a1: A1, a2: A2);
message_arguments!(a0: A0, a1: A1, a2: A2, a3: A3);
message_arguments!(a0: A0, a1: A1, a2: A2, a3: A3, a4: A4);
message_arguments!(a0: A0, a1: A1, a2: A2, a3: A3, a4: A4, a5: A5);

/// Type encoding a method must have to be sent `args` and answer `R`.
pub fn encoding_for<R: Encode, A: MessageArguments>() -> String {
    let mut out = String::new();
    R::encode(&mut out);
    out.push_str("@:");
    A::encode_arguments(&mut out);
    out
}

fn unrecognized(receiver: Id, sel: Sel) -> ! {
    panic!(
        "-[{} {}]: unrecognized selector sent to {:p}",
        receiver.object_class().name(),
        sel,
        receiver.as_ptr()
    )
}

/// Sends `sel` to `receiver`, resolving the implementation through its live
/// type tag. Panics if the receiver does not respond.
///
/// # Safety
///
/// `R` and `A` must match the method's type encoding.
pub unsafe fn msg_send<R, A: MessageArguments>(receiver: Id, sel: Sel, args: A) -> R {
    let imp = receiver
        .object_class()
        .lookup_imp(sel)
        .unwrap_or_else(|| unrecognized(receiver, sel));
    A::invoke(imp, receiver, sel, args)
}

/// Sends `sel` starting the lookup at `class`'s superclass.
///
/// # Safety
///
/// Same contract as [`msg_send`].
pub unsafe fn msg_send_super<R, A: MessageArguments>(class: Class, receiver: Id, sel: Sel, args: A) -> R {
    let imp = class
        .superclass()
        .and_then(|superclass| superclass.lookup_imp(sel))
        .unwrap_or_else(|| unrecognized(receiver, sel));
    A::invoke(imp, receiver, sel, args)
}

impl Id {
    /// Checked send. Panics when the method is missing or its type encoding
    /// differs from `R (Id, Sel, A...)`.
    pub fn send<R: Encode, A: MessageArguments>(self, sel: Sel, args: A) -> R {
        let method = self
            .object_class()
            .method(sel)
            .unwrap_or_else(|| unrecognized(self, sel));
        let expected = encoding_for::<R, A>();
        assert_eq!(method.types(), expected, "type mismatch sending {} to {:?}", sel, self);
        unsafe { A::invoke(method.implementation(), self, sel, args) }
    }

    /// The `class` message. Unlike [`Id::object_class`] this can be
    /// overridden, so synthesized subclasses may report their base.
    pub fn class(self) -> Class {
        self.send(common().class, ())
    }
}

extern "C" fn object_class(this: Id, _cmd: Sel) -> Class {
    this.object_class()
}

extern "C" fn class_object_class(this: Id, _cmd: Sel) -> Class {
    Class::from_object(this).unwrap_or_else(|| this.object_class())
}

extern "C" fn object_retain(this: Id, _cmd: Sel) -> Id {
    this.intrinsic_retain();
    this
}

extern "C" fn object_release(this: Id, _cmd: Sel) {
    if this.intrinsic_release() {
        unsafe { msg_send::<(), _>(this, common().dealloc, ()) };
        this.dispose();
    }
}

extern "C" fn object_autorelease(this: Id, _cmd: Sel) -> Id {
    this
}

extern "C" fn object_dealloc(this: Id, _cmd: Sel) {
    log::trace!("dealloc {:?}", this);
}

extern "C" fn object_forward_invocation(this: Id, _cmd: Sel, _invocation: *mut c_void) {
    log::warn!("forwardInvocation: reached the root class for {:?}", this);
}

fn must<T>(result: crate::error::Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("defining the root class failed: {err}"),
    }
}

pub(crate) fn define_root() -> Class {
    let sel = common();
    let root = must(Class::allocate_with_kind(None, "Object", ClassKind::Counted));
    must(root.add_typed_method(sel.class, object_class as extern "C" fn(Id, Sel) -> Class));
    must(root.add_typed_method(sel.retain, object_retain as extern "C" fn(Id, Sel) -> Id));
    must(root.add_typed_method(sel.release, object_release as extern "C" fn(Id, Sel)));
    must(root.add_typed_method(sel.autorelease, object_autorelease as extern "C" fn(Id, Sel) -> Id));
    must(root.add_typed_method(sel.dealloc, object_dealloc as extern "C" fn(Id, Sel)));
    must(root.add_typed_method(
        sel.forward_invocation,
        object_forward_invocation as extern "C" fn(Id, Sel, *mut c_void),
    ));
    define_class_query(root);
    root
}

pub(crate) fn define_value_root(class: Class) {
    must(class.add_typed_method(common().class, object_class as extern "C" fn(Id, Sel) -> Class));
    define_class_query(class);
}

fn define_class_query(root: Class) {
    if let Some(meta) = root.metaclass() {
        must(meta.add_typed_method(common().class, class_object_class as extern "C" fn(Id, Sel) -> Class));
    }
}
