//! Executable trampolines.

use crate::code::cif::CallInterface;
use crate::error::{HookError, Result};
use core::ffi::c_void;
use libffi::low::{closure_alloc, closure_free, ffi_cif, ffi_closure, CodePtr};
use libffi::raw;
use swizzle_runtime::Imp;

/// Receives the call interface, the return buffer, the argument buffer
/// array and the trampoline's user data.
pub type Callback = unsafe extern "C" fn(*mut ffi_cif, *mut c_void, *mut *mut c_void, *mut c_void);

/// A libffi closure: a native entry point that forwards every call to a
/// [`Callback`]. The entry point is invalid once the trampoline is dropped.
pub struct Trampoline {
    closure: *mut ffi_closure,
    entry: CodePtr,
}

unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

impl Trampoline {
    /// # Safety
    ///
    /// `cif` must outlive the trampoline, and `userdata` must stay valid for
    /// as long as the entry point can be called.
    pub unsafe fn new(cif: &CallInterface, callback: Callback, userdata: *mut c_void) -> Result<Trampoline> {
        let (closure, entry) = closure_alloc();
        if closure.is_null() {
            return Err(HookError::TrampolineError("executable memory allocation failed".into()));
        }
        let status = raw::ffi_prep_closure_loc(closure, cif.as_raw(), Some(callback), userdata, entry.as_mut_ptr());
        if status != raw::ffi_status_FFI_OK {
            closure_free(closure);
            return Err(HookError::TrampolineError(format!("ffi_prep_closure_loc returned {status}")));
        }
        Ok(Trampoline { closure, entry })
    }

    pub fn entry(&self) -> Imp {
        unsafe { std::mem::transmute::<*mut c_void, Imp>(self.entry.as_mut_ptr()) }
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        unsafe { closure_free(self.closure) };
    }
}

impl std::fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Trampoline({:p})", self.entry.as_mut_ptr())
    }
}
