//! Observation by type tag.
//!
//! Observing a key moves the object into a `KVONotifying_<Class>` subclass
//! whose setter override calls the inherited setter and then notifies the
//! observers. The subclass also overrides `class` so the object keeps
//! reporting the observed class. This is the second mechanism, besides
//! method interception, that rewrites an object's type tag.

use crate::class::{Class, Imp, MethodImplementation};
use crate::error::{Result, RuntimeError};
use crate::message::MessageArguments;
use crate::object::{AssociationKey, Id, WeakId};
use crate::sel::{common, Sel};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

pub const NOTIFYING_PREFIX: &str = "KVONotifying_";

static OBSERVERS: AssociationKey = AssociationKey::new("swizzle.kvo.observers");

type Callback = Arc<dyn Fn(Id, i64) + Send + Sync>;

struct Observer {
    token: u64,
    key: String,
    callback: Callback,
}

#[derive(Default)]
struct ObserverList {
    entries: Mutex<Vec<Observer>>,
}

/// base class -> notifying subclass
fn notifying_classes() -> &'static Mutex<HashMap<Class, Class>> {
    static CLASSES: OnceLock<Mutex<HashMap<Class, Class>>> = OnceLock::new();
    CLASSES.get_or_init(|| Mutex::new(HashMap::new()))
}

fn is_notifying(class: Class) -> bool {
    let classes = notifying_classes().lock().unwrap_or_else(|e| e.into_inner());
    classes.values().any(|c| *c == class)
}

/// Nearest notifying class in the object's live hierarchy.
fn notifying_ancestor(object: Id) -> Option<Class> {
    let mut cursor = Some(object.object_class());
    while let Some(class) = cursor {
        if is_notifying(class) {
            return Some(class);
        }
        cursor = class.superclass();
    }
    None
}

fn setter_for(key: &str) -> Sel {
    let mut chars = key.chars();
    let name = match chars.next() {
        Some(first) => format!("set{}{}:", first.to_uppercase(), chars.as_str()),
        None => "set:".to_string(),
    };
    Sel::register(&name)
}

fn key_for(setter: Sel) -> Option<String> {
    let name = setter.name().strip_prefix("set")?.strip_suffix(':')?;
    let mut chars = name.chars();
    let first = chars.next()?;
    Some(format!("{}{}", first.to_lowercase(), chars.as_str()))
}

fn inherited_imp(notifying: Class, object: Id, sel: Sel) -> Imp {
    match notifying.superclass().and_then(|s| s.lookup_imp(sel)) {
        Some(imp) => imp,
        None => panic!("{:?} lost the inherited implementation of {}", object, sel),
    }
}

extern "C" fn notifying_set_i64(this: Id, cmd: Sel, value: i64) {
    let Some(notifying) = notifying_ancestor(this) else {
        panic!("notifying setter reached outside a notifying class on {:?}", this);
    };
    unsafe {
        <(i64,) as MessageArguments>::invoke::<()>(inherited_imp(notifying, this, cmd), this, cmd, (value,))
    };

    let Some(key) = key_for(cmd) else { return };
    let Some(list) = this.associated::<ObserverList>(&OBSERVERS) else {
        return;
    };
    let callbacks: Vec<Callback> = {
        let entries = list.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().filter(|o| o.key == key).map(|o| o.callback.clone()).collect()
    };
    for callback in callbacks {
        callback(this, value);
    }
}

extern "C" fn notifying_class(this: Id, cmd: Sel) -> Class {
    let Some(notifying) = notifying_ancestor(this) else {
        return this.object_class();
    };
    let reported: Class =
        unsafe { <() as MessageArguments>::invoke(inherited_imp(notifying, this, cmd), this, cmd, ()) };
    if reported.is_subclass_of(notifying) {
        notifying.superclass().unwrap_or(reported)
    } else {
        reported
    }
}

fn notifying_subclass(base: Class) -> Result<Class> {
    let mut classes = notifying_classes().lock().unwrap_or_else(|e| e.into_inner());
    if let Some(class) = classes.get(&base) {
        return Ok(*class);
    }
    let name = format!("{NOTIFYING_PREFIX}{}", base.name());
    let class = Class::allocate(Some(base), &name)?;
    class.add_typed_method(common().class, notifying_class as extern "C" fn(Id, Sel) -> Class)?;
    classes.insert(base, class);
    log::debug!("created {} for observation", name);
    Ok(class)
}

/// A registered observer. Observations stay active until invalidated.
#[derive(Debug)]
pub struct Observation {
    object: WeakId,
    token: u64,
    notifying: Class,
}

/// Observes `key` on `object`. `callback` receives the object and the new
/// value after every call to the `set<Key>:` setter.
pub fn observe<F>(object: Id, key: &str, callback: F) -> Result<Observation>
where
    F: Fn(Id, i64) + Send + Sync + 'static,
{
    static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

    let setter = setter_for(key);
    let current = object.object_class();
    let setter_method = current.method(setter).ok_or_else(|| RuntimeError::NoSuchMethod {
        class: current.name().to_string(),
        selector: setter.name().to_string(),
    })?;
    let setter_types = <extern "C" fn(Id, Sel, i64) as MethodImplementation>::types();
    if setter_method.types() != setter_types {
        return Err(RuntimeError::UnsupportedSetter(setter.name().to_string()));
    }

    let notifying = match notifying_ancestor(object) {
        Some(class) => class,
        None => notifying_subclass(current)?,
    };
    if notifying.own_method(setter).is_none() {
        notifying.add_typed_method(setter, notifying_set_i64 as extern "C" fn(Id, Sel, i64))?;
    }

    let list = object
        .associated_or_insert_with(&OBSERVERS, || Arc::new(ObserverList::default()))
        .ok_or(RuntimeError::ObjectDeallocated)?;
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    list.entries
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(Observer { token, key: key.to_string(), callback: Arc::new(callback) });

    if !object.object_class().is_subclass_of(notifying) {
        object.set_object_class(notifying);
    }
    Ok(Observation { object: object.downgrade(), token, notifying })
}

impl Observation {
    /// Removes the observer. When it was the last one the object's type tag is
    /// restored, but only if it still equals the notifying class. Returns
    /// whether the tag was restored.
    pub fn invalidate(self) -> bool {
        let Some(object) = self.object.upgrade() else {
            return false;
        };
        let Some(list) = object.associated::<ObserverList>(&OBSERVERS) else {
            return false;
        };
        let remaining = {
            let mut entries = list.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.retain(|o| o.token != self.token);
            entries.len()
        };
        if remaining > 0 {
            return false;
        }
        object.remove_associated(&OBSERVERS);
        if object.object_class() != self.notifying {
            log::debug!(
                "{:?} left {} while observed; keeping its type tag",
                *object,
                self.notifying.name()
            );
            return false;
        }
        match self.notifying.superclass() {
            Some(base) => {
                object.set_object_class(base);
                true
            }
            None => false,
        }
    }
}
