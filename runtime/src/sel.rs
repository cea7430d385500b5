//! Interned selectors.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{OnceLock, RwLock};

#[doc(hidden)]
pub struct SelInner {
    name: Box<str>,
}

/// A method name, interned process-wide.
///
/// Two selectors are equal exactly when they were registered with the same
/// name, and equality is a pointer comparison. The handle is a thin pointer,
/// so it can be passed through native call frames as the `:` argument.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Sel(&'static SelInner);

fn table() -> &'static RwLock<HashMap<&'static str, Sel>> {
    static TABLE: OnceLock<RwLock<HashMap<&'static str, Sel>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

impl Sel {
    /// Returns the selector for `name`, registering it on first use.
    pub fn register(name: &str) -> Sel {
        if let Some(sel) = table().read().unwrap_or_else(|e| e.into_inner()).get(name) {
            return *sel;
        }
        let mut table = table().write().unwrap_or_else(|e| e.into_inner());
        if let Some(sel) = table.get(name) {
            return *sel;
        }
        let inner: &'static SelInner = Box::leak(Box::new(SelInner { name: name.into() }));
        let sel = Sel(inner);
        table.insert(&inner.name, sel);
        sel
    }

    pub fn name(self) -> &'static str {
        &self.0.name
    }

    /// Number of explicit arguments, counted from the colons in the name.
    pub fn arity(self) -> usize {
        self.0.name.bytes().filter(|b| *b == b':').count()
    }
}

/// Selectors the runtime itself dispatches.
#[derive(Debug)]
pub struct CommonSelectors {
    pub class: Sel,
    pub retain: Sel,
    pub release: Sel,
    pub autorelease: Sel,
    pub dealloc: Sel,
    pub forward_invocation: Sel,
}

pub fn common() -> &'static CommonSelectors {
    static COMMON: OnceLock<CommonSelectors> = OnceLock::new();
    COMMON.get_or_init(|| CommonSelectors {
        class: Sel::register("class"),
        retain: Sel::register("retain"),
        release: Sel::register("release"),
        autorelease: Sel::register("autorelease"),
        dealloc: Sel::register("dealloc"),
        forward_invocation: Sel::register("forwardInvocation:"),
    })
}

impl PartialEq for Sel {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for Sel {}

impl Hash for Sel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0 as *const SelInner as usize).hash(state)
    }
}

impl fmt::Debug for Sel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sel({})", self.name())
    }
}

impl fmt::Display for Sel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
