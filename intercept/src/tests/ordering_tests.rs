//! Registration identity, before/after/instead ordering and cancellation.

use super::*;
use crate::{Cancellation, HookClosure, HookError, Interceptor, Mode, Original, Target, Token};
use std::sync::OnceLock;
use swizzle_runtime::Imp;

// =============================================================================
// Context identity
// =============================================================================

#[test]
fn test_same_pair_shares_one_context() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingIdentity");
    let method = class.own_method(sum_sel()).unwrap();
    let original = method.implementation();

    let first = interceptor.before(Target::AllInstances(class), sum_sel(), || {}).unwrap();
    let installed = method.implementation();
    assert!(!std::ptr::fn_addr_eq(installed, original));

    let second = interceptor.after(Target::AllInstances(class), sum_sel(), || {}).unwrap();
    assert!(std::ptr::fn_addr_eq(method.implementation(), installed));
    assert_eq!(interceptor.context_count(), 1);
    assert!(interceptor.is_intercepting(class, sum_sel()));

    assert_eq!(first.cancel(), Cancellation::FullyReverted);
    assert!(std::ptr::fn_addr_eq(method.implementation(), installed));
    assert_eq!(second.cancel(), Cancellation::FullyReverted);
    assert!(std::ptr::fn_addr_eq(method.implementation(), original));
    assert_eq!(interceptor.context_count(), 0);
}

// =============================================================================
// Before / after
// =============================================================================

#[test]
fn test_before_and_after_run_newest_first() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingLifo");
    let object = class.new_object();
    let log = attach_log(*object);
    let target = Target::AllInstances(class);

    for name in ["A", "B"] {
        let log = log.clone();
        interceptor.before(target, sum_sel(), move || log.push(format!("before {name}"))).unwrap();
    }
    for name in ["C", "D"] {
        let log = log.clone();
        interceptor.after(target, sum_sel(), move || log.push(format!("after {name}"))).unwrap();
    }

    assert_eq!(call_sum(*object, 2, 3), 5);
    assert_eq!(log.take(), ["before B", "before A", "body", "after D", "after C"]);
}

#[test]
fn test_before_closures_receive_requested_arguments() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingArguments");
    let object = class.new_object();
    let log = attach_log(*object);
    let target = Target::AllInstances(class);

    let sink = log.clone();
    interceptor
        .before(target, sum_sel(), move |this: Id, cmd: Sel| {
            sink.push(format!("{} {}", this.class().name(), cmd));
        })
        .unwrap();
    let sink = log.clone();
    interceptor
        .after(target, sum_sel(), move |_this: Id, _cmd: Sel, a: i64, b: i64| {
            sink.push(format!("{a}+{b}"));
        })
        .unwrap();

    assert_eq!(call_sum(*object, 40, 2), 42);
    assert_eq!(log.take(), ["OrderingArguments sum:with:", "body", "40+2"]);
}

// =============================================================================
// Instead
// =============================================================================

#[test]
fn test_instead_without_original_prevents_the_body() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingInsteadOverride");
    let object = class.new_object();

    interceptor
        .instead(
            Target::AllInstances(class),
            sum_sel(),
            |_original: Original<fn(Id, Sel, i64, i64) -> i64>, _this: Id, _cmd: Sel, a: i64, b: i64| -> i64 {
                a * b
            },
        )
        .unwrap();

    assert_eq!(call_sum(*object, 2, 3), 6);
    assert_eq!(sum_calls(*object), 0);
}

#[test]
fn test_instead_sees_the_original_result() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingInsteadWrap");
    let object = class.new_object();

    interceptor
        .instead(
            Target::AllInstances(class),
            sum_sel(),
            |original: Original<fn(Id, Sel, i64, i64) -> i64>, this: Id, cmd: Sel, a: i64, b: i64| -> i64 {
                original.call(this, cmd, a, b) + 100
            },
        )
        .unwrap();

    assert_eq!(call_sum(*object, 2, 3), 105);
    assert_eq!(sum_calls(*object), 1);
}

#[test]
fn test_instead_chain_runs_back_to_the_original() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingInsteadChain");
    let object = class.new_object();
    let log = attach_log(*object);
    let target = Target::AllInstances(class);

    for name in ["I1", "I2"] {
        let log = log.clone();
        interceptor
            .instead(
                target,
                sum_sel(),
                move |original: Original<fn(Id, Sel, i64, i64) -> i64>, this: Id, cmd: Sel, a: i64, b: i64| -> i64 {
                    log.push(format!("{name} entry"));
                    let result = original.call(this, cmd, a + 1, b);
                    log.push(format!("{name} exit"));
                    result
                },
            )
            .unwrap();
    }
    let sink = log.clone();
    interceptor.before(target, sum_sel(), move || sink.push("before")).unwrap();

    assert_eq!(call_sum(*object, 2, 3), 7);
    assert_eq!(
        log.take(),
        ["I2 entry", "I1 entry", "before", "body", "I1 exit", "I2 exit"]
    );
}

#[test]
fn test_original_may_be_called_repeatedly() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingInsteadTwice");
    let object = class.new_object();

    interceptor
        .instead(
            Target::AllInstances(class),
            sum_sel(),
            |original: Original<fn(Id, Sel, i64, i64) -> i64>, this: Id, cmd: Sel, a: i64, b: i64| -> i64 {
                original.call(this, cmd, a, b) + original.call(this, cmd, a, b)
            },
        )
        .unwrap();

    assert_eq!(call_sum(*object, 2, 3), 10);
    assert_eq!(sum_calls(*object), 2);
}

#[test]
fn test_instead_can_cancel_itself() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingSelfCancel");
    let object = class.new_object();
    let original_imp = class.own_method(sum_sel()).unwrap().implementation();

    let slot: Arc<OnceLock<Token>> = Arc::new(OnceLock::new());
    let own = slot.clone();
    let token = interceptor
        .instead(
            Target::AllInstances(class),
            sum_sel(),
            move |original: Original<fn(Id, Sel, i64, i64) -> i64>, this: Id, cmd: Sel, a: i64, b: i64| -> i64 {
                if let Some(token) = own.get() {
                    assert_eq!(token.cancel(), Cancellation::FullyReverted);
                }
                original.call(this, cmd, a, b) * 10
            },
        )
        .unwrap();
    slot.set(token).unwrap();

    assert_eq!(call_sum(*object, 2, 3), 50);
    assert_eq!(call_sum(*object, 2, 3), 5);
    assert!(std::ptr::fn_addr_eq(
        class.own_method(sum_sel()).unwrap().implementation(),
        original_imp
    ));
    assert_eq!(slot.get().unwrap().cancel(), Cancellation::AlreadyCancelled);
}

#[test]
fn test_instead_removed_mid_call_continues_with_the_original() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingDegradedChain");
    let object = class.new_object();
    let log = attach_log(*object);
    let target = Target::AllInstances(class);

    let sink = log.clone();
    interceptor.before(target, sum_sel(), move || sink.push("before")).unwrap();
    let sink = log.clone();
    interceptor
        .instead(
            target,
            sum_sel(),
            move |original: Original<fn(Id, Sel, i64, i64) -> i64>, this: Id, cmd: Sel, a: i64, b: i64| -> i64 {
                sink.push("older");
                original.call(this, cmd, a, b) * 100
            },
        )
        .unwrap();
    let slot: Arc<OnceLock<Token>> = Arc::new(OnceLock::new());
    let own = slot.clone();
    let sink = log.clone();
    let newest = interceptor
        .instead(
            target,
            sum_sel(),
            move |original: Original<fn(Id, Sel, i64, i64) -> i64>, this: Id, cmd: Sel, a: i64, b: i64| -> i64 {
                sink.push("newest");
                if let Some(token) = own.get() {
                    token.cancel();
                }
                original.call(this, cmd, a, b) * 10
            },
        )
        .unwrap();
    slot.set(newest).unwrap();

    // The older instead closure is skipped for the call that removed its successor.
    assert_eq!(call_sum(*object, 2, 3), 50);
    assert_eq!(log.take(), ["newest", "before", "body"]);
    assert_eq!(call_sum(*object, 2, 3), 500);
    assert_eq!(log.take(), ["older", "before", "body"]);
}

// =============================================================================
// Rejections
// =============================================================================

#[test]
fn test_duplicate_closure_rejected_until_cancelled() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingDuplicate");
    let target = Target::AllInstances(class);
    let closure = HookClosure::new(|| {});

    let token = interceptor.intercept(target, sum_sel(), Mode::Before, closure.clone()).unwrap();
    assert_eq!(
        interceptor.intercept(target, sum_sel(), Mode::Before, closure.clone()).unwrap_err(),
        HookError::DuplicateInterceptor
    );
    let after = interceptor.intercept(target, sum_sel(), Mode::After, closure.clone()).unwrap();

    assert_eq!(token.cancel(), Cancellation::FullyReverted);
    let again = interceptor.intercept(target, sum_sel(), Mode::Before, closure).unwrap();
    assert_eq!(again.cancel(), Cancellation::FullyReverted);
    assert_eq!(after.cancel(), Cancellation::FullyReverted);
}

#[test]
fn test_instead_arity_mismatch_rejected() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingMismatch");
    let method = class.own_method(sum_sel()).unwrap();
    let original = method.implementation();
    let target = Target::AllInstances(class);

    let too_few = interceptor.instead(
        target,
        sum_sel(),
        |original: Original<fn(Id, Sel, i64, i64) -> i64>, this: Id, cmd: Sel| -> i64 { original.call(this, cmd, 0, 0) },
    );
    assert!(matches!(too_few, Err(HookError::SignatureMismatch(_))));

    let too_many = interceptor.instead(
        target,
        sum_sel(),
        |_: Original<fn(Id, Sel, i64, i64) -> i64>, _: Id, _: Sel, _: i64, _: i64, _: i64| -> i64 { 0 },
    );
    assert!(matches!(too_many, Err(HookError::SignatureMismatch(_))));

    assert!(std::ptr::fn_addr_eq(method.implementation(), original));
    assert_eq!(interceptor.context_count(), 0);
}

#[test]
fn test_blacklisted_and_unknown_selectors_rejected() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingBlacklist");
    let target = Target::AllInstances(class);

    for name in ["retain", "release", "autorelease", "forwardInvocation:"] {
        assert_eq!(
            interceptor.before(target, Sel::register(name), || {}).unwrap_err(),
            HookError::BlacklistedSelector
        );
    }
    assert_eq!(
        interceptor.before(target, Sel::register("orderingMissing"), || {}).unwrap_err(),
        HookError::NoSuchSelector
    );

    let strict = Interceptor::with_config(crate::Config {
        blacklist: vec!["execute".into()],
        ..crate::Config::default()
    });
    assert_eq!(
        strict.before(target, execute_sel(), || {}).unwrap_err(),
        HookError::BlacklistedSelector
    );
}

extern "C" fn takes_empty(_this: Id, _cmd: Sel) {}

#[test]
fn test_unmarshalable_method_leaves_nothing_behind() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingUnmarshalable");
    let sel = Sel::register("takeEmpty:");
    let imp: Imp = unsafe { core::mem::transmute(takes_empty as extern "C" fn(Id, Sel)) };
    let method = class.add_method(sel, imp, "v@:{Empty=}").unwrap();
    let object = class.new_object();

    for target in [Target::AllInstances(class), Target::Instance(*object)] {
        assert!(matches!(
            interceptor.before(target, sel, || {}),
            Err(HookError::UnsupportedType(_))
        ));
    }
    assert!(std::ptr::fn_addr_eq(method.implementation(), imp));
    assert_eq!(interceptor.context_count(), 0);
    assert_eq!(object.object_class(), class);
    assert!(Class::lookup("Swizzle_OrderingUnmarshalable").is_none());
}

// =============================================================================
// Revert
// =============================================================================

#[test]
fn test_cancel_restores_exact_behavior() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingRevert");
    let object = class.new_object();
    let log = attach_log(*object);
    let method = class.own_method(sum_sel()).unwrap();
    let original = method.implementation();

    assert_eq!(call_sum(*object, 2, 3), 5);
    let baseline = log.take();

    let sink = log.clone();
    let before = interceptor.before(Target::AllInstances(class), sum_sel(), move || sink.push("hook")).unwrap();
    let instead = interceptor
        .instead(
            Target::AllInstances(class),
            sum_sel(),
            |_: Original<fn(Id, Sel, i64, i64) -> i64>, _: Id, _: Sel, _: i64, _: i64| -> i64 { -1 },
        )
        .unwrap();
    assert_eq!(call_sum(*object, 2, 3), -1);
    log.take();

    assert_eq!(instead.cancel(), Cancellation::FullyReverted);
    assert_eq!(before.cancel(), Cancellation::FullyReverted);
    assert_eq!(before.cancel(), Cancellation::AlreadyCancelled);
    assert!(!before.is_active());

    assert!(std::ptr::fn_addr_eq(method.implementation(), original));
    assert_eq!(call_sum(*object, 2, 3), 5);
    assert_eq!(log.take(), baseline);
}

#[test]
fn test_dropping_an_engine_restores_its_methods() {
    let _guard = crate::lock_hook_tests();
    let class = test_class("OrderingEngineDrop");
    let object = class.new_object();
    let method = class.own_method(sum_sel()).unwrap();
    let original = method.implementation();

    let interceptor = Interceptor::new();
    let token = interceptor
        .instead(
            Target::AllInstances(class),
            sum_sel(),
            |_: Original<fn(Id, Sel, i64, i64) -> i64>, _: Id, _: Sel, _: i64, _: i64| -> i64 { 0 },
        )
        .unwrap();
    assert_eq!(call_sum(*object, 2, 3), 0);

    drop(interceptor);
    assert!(std::ptr::fn_addr_eq(method.implementation(), original));
    assert_eq!(call_sum(*object, 2, 3), 5);
    assert_eq!(token.cancel(), Cancellation::AlreadyCancelled);
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_registration_while_other_threads_call() {
    let _guard = crate::lock_hook_tests();
    let interceptor = Interceptor::new();
    let class = test_class("OrderingConcurrent");
    let object = class.new_object();
    let id = *object;
    let target = Target::AllInstances(class);
    let anchor = interceptor.before(target, sum_sel(), || {}).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..5_000 {
                    let result = call_sum(id, 2, 3);
                    assert!(result == 5 || result == -5, "unexpected result {result}");
                }
            });
        }
        for _ in 0..200 {
            let token = interceptor
                .instead(
                    target,
                    sum_sel(),
                    |original: Original<fn(Id, Sel, i64, i64) -> i64>, this: Id, cmd: Sel, a: i64, b: i64| -> i64 {
                        -original.call(this, cmd, a, b)
                    },
                )
                .unwrap();
            let after = interceptor.after(target, sum_sel(), |_this: Id, _cmd: Sel| {}).unwrap();
            assert_eq!(after.cancel(), Cancellation::FullyReverted);
            assert_eq!(token.cancel(), Cancellation::FullyReverted);
        }
    });

    assert_eq!(anchor.cancel(), Cancellation::FullyReverted);
    assert_eq!(call_sum(id, 2, 3), 5);
    assert_eq!(interceptor.context_count(), 0);
}
