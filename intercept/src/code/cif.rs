//! Call interfaces.

use crate::code::descriptor::{self, TypeDescriptor};
use crate::error::{HookError, Result};
use crate::signature::Encoding;
use core::ffi::c_void;
use libffi::low::{ffi_abi_FFI_DEFAULT_ABI, ffi_cif, ffi_type, prep_cif};
use libffi::raw;
use std::cell::UnsafeCell;
use std::sync::Arc;
use swizzle_runtime::Imp;

/// A prepared libffi call interface. The descriptor array it points into is
/// owned here and freed together with it.
pub struct CallInterface {
    cif: Box<UnsafeCell<ffi_cif>>,
    // Backing storage for `cif.arg_types`; must not be resized.
    arg_types: Vec<*mut ffi_type>,
    args: Vec<Arc<TypeDescriptor>>,
    ret: Arc<TypeDescriptor>,
}

// The cif is written once by `prep_cif` and only read afterwards.
unsafe impl Send for CallInterface {}
unsafe impl Sync for CallInterface {}

impl CallInterface {
    pub fn new(args: &[Encoding], ret: &Encoding) -> Result<CallInterface> {
        let args = args.iter().map(descriptor::intern).collect::<Result<Vec<_>>>()?;
        let ret = descriptor::intern(ret)?;
        CallInterface::from_descriptors(args, ret)
    }

    pub fn from_descriptors(args: Vec<Arc<TypeDescriptor>>, ret: Arc<TypeDescriptor>) -> Result<CallInterface> {
        if let Some(void) = args.iter().find(|d| d.code() == "v") {
            return Err(HookError::UnsupportedType(format!("{} is not a valid argument type", void.code())));
        }
        let mut arg_types: Vec<*mut ffi_type> = args.iter().map(|d| d.as_raw()).collect();
        let cif = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed::<ffi_cif>() }));
        let atypes = if arg_types.is_empty() {
            std::ptr::null_mut()
        } else {
            arg_types.as_mut_ptr()
        };
        unsafe { prep_cif(cif.get(), ffi_abi_FFI_DEFAULT_ABI, arg_types.len(), ret.as_raw(), atypes) }
            .map_err(|err| HookError::CallInterfaceError(format!("{err:?} for {}", describe(&args, &ret))))?;
        Ok(CallInterface { cif, arg_types, args, ret })
    }

    pub fn arg_count(&self) -> usize {
        self.arg_types.len()
    }

    pub fn args(&self) -> &[Arc<TypeDescriptor>] {
        &self.args
    }

    pub fn ret(&self) -> &Arc<TypeDescriptor> {
        &self.ret
    }

    pub fn as_raw(&self) -> *mut ffi_cif {
        self.cif.get()
    }

    /// Calls `code` with the marshaled argument buffers.
    ///
    /// # Safety
    ///
    /// `code` must follow this interface's signature, `args` must hold
    /// `arg_count()` pointers to values of the matching types, and `ret`
    /// must point to storage large enough for the return value (at least one
    /// machine word for integral returns).
    pub unsafe fn call(&self, code: Imp, ret: *mut c_void, args: *mut *mut c_void) {
        raw::ffi_call(self.as_raw(), Some(code), ret, args);
    }
}

fn describe(args: &[Arc<TypeDescriptor>], ret: &TypeDescriptor) -> String {
    let args: Vec<&str> = args.iter().map(|d| d.code()).collect();
    format!("({}) -> {}", args.join(", "), ret.code())
}

impl std::fmt::Debug for CallInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CallInterface{}", describe(&self.args, &self.ret))
    }
}
