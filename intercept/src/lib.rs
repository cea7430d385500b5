//! swizzle-intercept: before/after/instead interception of runtime methods.

pub mod closure;
pub mod code;
pub mod config;
pub mod error;
mod hooks;
pub mod interceptor;
pub mod signature;
mod validate;

// Re-exports for convenience (flattened imports)
pub use closure::{HookClosure, IntoHookClosure, Original};
pub use config::Config;
pub use error::{ConfigError, HookError, Result};
pub use interceptor::{Cancellation, Interceptor, Mode, Target, Token};
pub use signature::{Encoding, Signature};

/// Initialize logging for the engine. Safe to call more than once.
pub fn init() {
    let _ = env_logger::try_init();
}

/// Process-global lock for tests that swap method implementations or type
/// tags; the runtime's class table is shared by every test thread.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests;
