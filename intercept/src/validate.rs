//! Closure-versus-method signature checks, run before anything is installed.

use crate::closure::HookClosure;
use crate::config::Config;
use crate::error::{HookError, Result};
use crate::interceptor::Mode;
use crate::signature::{Encoding, Signature};
use swizzle_runtime::{Method, Sel};

pub(crate) fn selector(config: &Config, selector: Sel) -> Result<()> {
    if config.is_blacklisted(selector) {
        return Err(HookError::BlacklistedSelector);
    }
    Ok(())
}

fn mismatch(closure: &Signature, method: &Signature, reason: &str) -> HookError {
    HookError::SignatureMismatch(format!("{reason} (closure {}, method {})", closure.codes(), method.codes()))
}

/// Receivers may be declared as either object or class.
fn receiver_compatible(a: &Encoding, b: &Encoding) -> bool {
    a.same_type(b) || matches!((a, b), (Encoding::Object | Encoding::Class, Encoding::Object | Encoding::Class))
}

fn params_match(closure: &[Encoding], method: &[Encoding]) -> bool {
    closure.len() == method.len()
        && closure.iter().zip(method).enumerate().all(|(i, (c, m))| {
            if i == 0 {
                receiver_compatible(c, m)
            } else {
                c.same_type(m)
            }
        })
}

/// Checks `closure` against `method` for `mode` and returns how many of the
/// method's arguments a before/after closure receives.
pub(crate) fn method_closure(method: Method, mode: Mode, closure: &HookClosure) -> Result<usize> {
    let method = Signature::of_method(method)?;
    let closure = Signature::of_closure(closure)?;
    match mode {
        Mode::Before | Mode::After => {
            if !closure.ret.is_void() {
                return Err(mismatch(&closure, &method, "before and after closures return nothing"));
            }
            let arity = closure.args.len();
            let accepted = arity == 0
                || (arity == 2 && params_match(&closure.args, &method.args[..2]))
                || params_match(&closure.args, &method.args);
            if !accepted {
                return Err(mismatch(
                    &closure,
                    &method,
                    "parameters must be empty, receiver and selector, or the full argument list",
                ));
            }
            Ok(arity)
        }
        Mode::Instead => {
            let expected = method.args.len() + 1;
            if closure.args.len() != expected {
                return Err(mismatch(
                    &closure,
                    &method,
                    &format!("instead closure takes {} parameters, expected {expected}", closure.args.len()),
                ));
            }
            let Encoding::Closure(Some(original)) = &closure.args[0] else {
                return Err(mismatch(&closure, &method, "first parameter must be the original callable"));
            };
            if !original.ret.same_type(&method.ret) || !params_match(&original.args, &method.args) {
                return Err(mismatch(&closure, &method, "original callable does not have the method's signature"));
            }
            if !closure.ret.same_type(&method.ret) {
                return Err(mismatch(&closure, &method, "return type differs"));
            }
            if !params_match(&closure.args[1..], &method.args) {
                return Err(mismatch(&closure, &method, "parameter types differ"));
            }
            Ok(method.args.len())
        }
    }
}

/// Deallocation closures: before takes nothing or the receiver, after takes
/// nothing, instead takes only the original callable.
pub(crate) fn dealloc_closure(mode: Mode, closure: &HookClosure) -> Result<usize> {
    let signature = Signature::of_closure(closure)?;
    let fail = |reason: &str| HookError::SignatureMismatch(format!("{reason} (closure {})", signature.codes()));
    if !signature.ret.is_void() {
        return Err(fail("deallocation closures return nothing"));
    }
    let args = &signature.args;
    match mode {
        Mode::Before => match args.as_slice() {
            [] => Ok(0),
            [Encoding::Object] => Ok(1),
            _ => Err(fail("before-dealloc closures take nothing or the receiver")),
        },
        Mode::After if args.is_empty() => Ok(0),
        Mode::After => Err(fail("after-dealloc closures take no parameters")),
        Mode::Instead => match args.as_slice() {
            [Encoding::Closure(Some(original))] if original.ret.is_void() && original.args.is_empty() => Ok(0),
            _ => Err(fail("instead-dealloc closures take only the original callable")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::Original;
    use swizzle_runtime::{Class, Id};

    extern "C" fn sum(_this: Id, _cmd: Sel, a: i64, b: i64) -> i64 {
        a + b
    }

    fn sum_method() -> Method {
        let name = "ValidateTestsSum";
        let class = Class::lookup(name).unwrap_or_else(|| {
            let class = Class::allocate(Some(Class::root()), name).unwrap();
            class
                .add_typed_method(Sel::register("sum:with:"), sum as extern "C" fn(Id, Sel, i64, i64) -> i64)
                .unwrap();
            class
        });
        class.own_method(Sel::register("sum:with:")).unwrap()
    }

    fn check(mode: Mode, closure: HookClosure) -> Result<usize> {
        let _guard = crate::lock_hook_tests();
        method_closure(sum_method(), mode, &closure)
    }

    #[test]
    fn before_after_parameter_shapes() {
        assert_eq!(check(Mode::Before, HookClosure::new(|| {})), Ok(0));
        assert_eq!(check(Mode::After, HookClosure::new(|_: Id, _: Sel| {})), Ok(2));
        assert_eq!(check(Mode::Before, HookClosure::new(|_: Id, _: Sel, _: i64, _: i64| {})), Ok(4));
        assert!(matches!(
            check(Mode::Before, HookClosure::new(|_: Id| {})),
            Err(HookError::SignatureMismatch(_))
        ));
        assert!(matches!(
            check(Mode::After, HookClosure::new(|_: Id, _: Sel, _: i64, _: f64| {})),
            Err(HookError::SignatureMismatch(_))
        ));
        assert!(matches!(
            check(Mode::Before, HookClosure::new(|| -> i64 { 1 })),
            Err(HookError::SignatureMismatch(_))
        ));
    }

    #[test]
    fn instead_requires_method_arity_plus_one() {
        let exact = HookClosure::new(
            |original: Original<fn(Id, Sel, i64, i64) -> i64>, this: Id, cmd: Sel, a: i64, b: i64| -> i64 {
                original.call(this, cmd, a, b)
            },
        );
        assert_eq!(check(Mode::Instead, exact), Ok(4));

        let too_few = HookClosure::new(
            |original: Original<fn(Id, Sel, i64, i64) -> i64>, this: Id, cmd: Sel, a: i64| -> i64 {
                original.call(this, cmd, a, 0)
            },
        );
        assert!(matches!(check(Mode::Instead, too_few), Err(HookError::SignatureMismatch(_))));

        let too_many = HookClosure::new(
            |_: Original<fn(Id, Sel, i64, i64) -> i64>, _: Id, _: Sel, _: i64, _: i64, _: i64| -> i64 { 0 },
        );
        assert!(matches!(check(Mode::Instead, too_many), Err(HookError::SignatureMismatch(_))));

        let wrong_return = HookClosure::new(
            |original: Original<fn(Id, Sel, i64, i64) -> i64>, this: Id, cmd: Sel, a: i64, b: i64| {
                original.call(this, cmd, a, b);
            },
        );
        assert!(matches!(check(Mode::Instead, wrong_return), Err(HookError::SignatureMismatch(_))));
    }

    #[test]
    fn dealloc_shapes() {
        assert_eq!(dealloc_closure(Mode::Before, &HookClosure::new(|| {})), Ok(0));
        assert_eq!(dealloc_closure(Mode::Before, &HookClosure::new(|_: Id| {})), Ok(1));
        assert_eq!(dealloc_closure(Mode::After, &HookClosure::new(|| {})), Ok(0));
        assert!(dealloc_closure(Mode::After, &HookClosure::new(|_: Id| {})).is_err());
        let instead = HookClosure::new(|original: Original<fn()>| original.call());
        assert_eq!(dealloc_closure(Mode::Instead, &instead), Ok(0));
        assert!(dealloc_closure(Mode::Instead, &HookClosure::new(|| {})).is_err());
    }

    #[test]
    fn blacklist() {
        let config = Config::default();
        assert_eq!(selector(&config, Sel::register("retain")), Err(HookError::BlacklistedSelector));
        assert_eq!(selector(&config, Sel::register("sum:with:")), Ok(()));
    }
}
