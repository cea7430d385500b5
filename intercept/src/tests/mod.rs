//! Scenario tests for the interception engine.

mod ordering_tests;

use std::sync::{Arc, Mutex};
use swizzle_runtime::{common, AssociationKey, Class, Id, Sel};

static EVENTS: AssociationKey = AssociationKey::new("swizzle.tests.events");

/// Ordered record of what ran, shared between closures and method bodies.
#[derive(Default)]
pub(crate) struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    pub(crate) fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub(crate) fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

/// Attaches a fresh log that the fixture method bodies write to.
pub(crate) fn attach_log(object: Id) -> Arc<EventLog> {
    let log = Arc::new(EventLog::default());
    object.set_associated(&EVENTS, log.clone());
    log
}

fn record(this: Id, event: &str) {
    if let Some(log) = this.associated::<EventLog>(&EVENTS) {
        log.push(event);
    }
}

pub(crate) fn sum_sel() -> Sel {
    Sel::register("sum:with:")
}

pub(crate) fn execute_sel() -> Sel {
    Sel::register("execute")
}

pub(crate) fn set_value_sel() -> Sel {
    Sel::register("setValue:")
}

pub(crate) fn value_sel() -> Sel {
    Sel::register("value")
}

extern "C" fn sum(this: Id, _cmd: Sel, a: i64, b: i64) -> i64 {
    this.set_slot("sum_calls", this.slot("sum_calls") + 1);
    record(this, "body");
    a + b
}

extern "C" fn execute(this: Id, _cmd: Sel) {
    record(this, "execute");
}

extern "C" fn set_value(this: Id, _cmd: Sel, value: i64) {
    this.set_slot("value", value);
    record(this, "set");
}

extern "C" fn value(this: Id, _cmd: Sel) -> i64 {
    this.slot("value")
}

extern "C" fn dealloc(this: Id, _cmd: Sel) {
    record(this, "body");
}

/// A reference-counted class with `sum:with:`, `execute`, `setValue:`,
/// `value` and a recording `dealloc`.
pub(crate) fn test_class(name: &str) -> Class {
    let class = Class::allocate(Some(Class::root()), name).unwrap();
    class
        .add_typed_method(sum_sel(), sum as extern "C" fn(Id, Sel, i64, i64) -> i64)
        .unwrap();
    class
        .add_typed_method(execute_sel(), execute as extern "C" fn(Id, Sel))
        .unwrap();
    class
        .add_typed_method(set_value_sel(), set_value as extern "C" fn(Id, Sel, i64))
        .unwrap();
    class
        .add_typed_method(value_sel(), value as extern "C" fn(Id, Sel) -> i64)
        .unwrap();
    class
        .add_typed_method(common().dealloc, dealloc as extern "C" fn(Id, Sel))
        .unwrap();
    class
}

pub(crate) fn call_sum(object: Id, a: i64, b: i64) -> i64 {
    object.send(sum_sel(), (a, b))
}

pub(crate) fn call_execute(object: Id) {
    object.send::<(), _>(execute_sel(), ())
}

pub(crate) fn set_value_on(object: Id, value: i64) {
    object.send::<(), _>(set_value_sel(), (value,))
}

pub(crate) fn sum_calls(object: Id) -> i64 {
    object.slot("sum_calls")
}
