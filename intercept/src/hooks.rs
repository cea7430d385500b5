//! Shorthand registration methods taking plain Rust closures.
//!
//! ```no_run
//! use swizzle_intercept::{Interceptor, Original, Target};
//! use swizzle_runtime::{Class, Id, Sel};
//!
//! let counter = Class::lookup("Counter").unwrap();
//! let token = Interceptor::obtain()
//!     .instead(
//!         Target::AllInstances(counter),
//!         Sel::register("add:"),
//!         |original: Original<fn(Id, Sel, i64) -> i64>, this: Id, cmd: Sel, n: i64| -> i64 {
//!             original.call(this, cmd, n * 2)
//!         },
//!     )
//!     .unwrap();
//! token.cancel();
//! ```

use crate::closure::IntoHookClosure;
use crate::error::Result;
use crate::interceptor::{Interceptor, Mode, Target, Token};
use swizzle_runtime::Sel;

impl Interceptor {
    pub fn before<M, F: IntoHookClosure<M>>(&self, target: Target, selector: Sel, closure: F) -> Result<Token> {
        self.intercept(target, selector, Mode::Before, closure.into_hook_closure())
    }

    pub fn after<M, F: IntoHookClosure<M>>(&self, target: Target, selector: Sel, closure: F) -> Result<Token> {
        self.intercept(target, selector, Mode::After, closure.into_hook_closure())
    }

    pub fn instead<M, F: IntoHookClosure<M>>(&self, target: Target, selector: Sel, closure: F) -> Result<Token> {
        self.intercept(target, selector, Mode::Instead, closure.into_hook_closure())
    }

    pub fn before_dealloc<M, F: IntoHookClosure<M>>(&self, target: Target, closure: F) -> Result<Token> {
        self.intercept_deallocation(target, Mode::Before, closure.into_hook_closure())
    }

    pub fn after_dealloc<M, F: IntoHookClosure<M>>(&self, target: Target, closure: F) -> Result<Token> {
        self.intercept_deallocation(target, Mode::After, closure.into_hook_closure())
    }

    pub fn instead_dealloc<M, F: IntoHookClosure<M>>(&self, target: Target, closure: F) -> Result<Token> {
        self.intercept_deallocation(target, Mode::Instead, closure.into_hook_closure())
    }
}
