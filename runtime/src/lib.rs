//! swizzle-runtime: a small reference-counted object runtime.
//!
//! Objects carry a mutable type tag (`isa`), classes carry swappable method
//! tables, and the last `release` sends `dealloc` before the object's
//! associated values and finalizers are torn down. The interception engine
//! in `swizzle-intercept` is built on these primitives.

pub mod class;
pub mod encode;
pub mod error;
pub mod kvo;
pub mod message;
pub mod object;
pub mod sel;

pub use class::{Class, Imp, Method, MethodImplementation};
pub use encode::Encode;
pub use error::{Result, RuntimeError};
pub use message::{msg_send, msg_send_super, MessageArguments};
pub use object::{AssociationKey, Id, Retained, WeakId};
pub use sel::{common, Sel};
