//! Interned libffi type descriptors.

use crate::error::{HookError, Result};
use crate::signature::{Encoding, Primitive};
use libffi::low::ffi_type;
use libffi::middle::Type;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// A libffi type for one canonical encoding. Descriptors live in a
/// process-wide table and are shared by every call interface using them.
pub struct TypeDescriptor {
    code: String,
    ty: Type,
}

// `Type` owns heap-allocated `ffi_type` records that are never mutated after
// construction.
unsafe impl Send for TypeDescriptor {}
unsafe impl Sync for TypeDescriptor {}

impl TypeDescriptor {
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn as_raw(&self) -> *mut ffi_type {
        self.ty.as_raw_ptr()
    }
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypeDescriptor({})", self.code)
    }
}

fn table() -> &'static Mutex<HashMap<String, Arc<TypeDescriptor>>> {
    static TABLE: OnceLock<Mutex<HashMap<String, Arc<TypeDescriptor>>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the shared descriptor for `encoding`, building it on first use.
pub fn intern(encoding: &Encoding) -> Result<Arc<TypeDescriptor>> {
    let code = encoding.code();
    if let Some(existing) = table().lock().unwrap_or_else(|e| e.into_inner()).get(&code) {
        return Ok(existing.clone());
    }
    let ty = build(encoding)?;
    let mut table = table().lock().unwrap_or_else(|e| e.into_inner());
    let descriptor = table
        .entry(code.clone())
        .or_insert_with(|| Arc::new(TypeDescriptor { code, ty }));
    Ok(descriptor.clone())
}

fn build(encoding: &Encoding) -> Result<Type> {
    let ty = match encoding {
        Encoding::Primitive(p) => match p {
            Primitive::Void => Type::void(),
            Primitive::Bool | Primitive::U8 => Type::u8(),
            Primitive::I8 => Type::i8(),
            Primitive::I16 => Type::i16(),
            Primitive::U16 => Type::u16(),
            Primitive::I32 => Type::i32(),
            Primitive::U32 => Type::u32(),
            Primitive::I64 => Type::i64(),
            Primitive::U64 => Type::u64(),
            Primitive::F32 => Type::f32(),
            Primitive::F64 => Type::f64(),
        },
        Encoding::Pointer | Encoding::Object | Encoding::Class | Encoding::Selector | Encoding::Closure(_) => {
            Type::pointer()
        }
        Encoding::Struct { name, fields } => {
            if fields.is_empty() {
                return Err(HookError::UnsupportedType(format!("empty struct {name}")));
            }
            if fields.iter().any(Encoding::is_void) {
                return Err(HookError::UnsupportedType(format!("void field in struct {name}")));
            }
            let members = fields
                .iter()
                .map(|field| intern(field).map(|d| d.ty.clone()))
                .collect::<Result<Vec<_>>>()?;
            Type::structure(members)
        }
    };
    Ok(ty)
}

/// Number of distinct descriptors built so far.
pub fn interned_count() -> usize {
    table().lock().unwrap_or_else(|e| e.into_inner()).len()
}
