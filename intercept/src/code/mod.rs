//! Native calling-convention plumbing on top of libffi.

pub mod cif;
pub mod descriptor;
pub mod trampoline;

pub use cif::CallInterface;
pub use descriptor::TypeDescriptor;
pub use trampoline::{Callback, Trampoline};
