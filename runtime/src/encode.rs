//! Runtime type encodings.
//!
//! Every method carries a compact type string: the return type followed by
//! each argument, receiver and selector included. `q@:qq` is a method taking
//! two `i64` after the implicit receiver and selector and returning `i64`.
//!
//! | code | type |
//! |------|------|
//! | `c s i q` | `i8 i16 i32 i64` |
//! | `C S I Q` | `u8 u16 u32 u64` |
//! | `f d` | `f32 f64` |
//! | `B` | `bool` |
//! | `v` | `()` |
//! | `@ # :` | object, class, selector |
//! | `^v` | raw pointer |
//! | `{Name=..}` | struct passed by value |

use crate::class::Class;
use crate::object::Id;
use crate::sel::Sel;

/// Types that have a runtime type encoding.
///
/// # Safety
///
/// The encoding must describe the native calling-convention layout of the
/// type exactly. A struct must be `#[repr(C)]` and list its fields in order:
///
/// ```
/// use swizzle_runtime::Encode;
///
/// #[repr(C)]
/// #[derive(Clone, Copy)]
/// struct Point {
///     x: f64,
///     y: f64,
/// }
///
/// unsafe impl Encode for Point {
///     fn encode(out: &mut String) {
///         out.push_str("{Point=dd}");
///     }
/// }
///
/// assert_eq!(Point::encoding(), "{Point=dd}");
/// ```
pub unsafe trait Encode {
    fn encode(out: &mut String);

    fn encoding() -> String {
        let mut out = String::new();
        Self::encode(&mut out);
        out
    }
}

macro_rules! encode_as {
    ($($ty:ty => $code:literal),* $(,)?) => {
        $(
            unsafe impl Encode for $ty {
                fn encode(out: &mut String) {
                    out.push_str($code);
                }
            }
        )*
    };
}

encode_as! {
    i8 => "c",
    i16 => "s",
    i32 => "i",
    i64 => "q",
    u8 => "C",
    u16 => "S",
    u32 => "I",
    u64 => "Q",
    f32 => "f",
    f64 => "d",
    bool => "B",
    () => "v",
    Id => "@",
    Option<Id> => "@",
    Class => "#",
    Sel => ":",
}

#[cfg(target_pointer_width = "64")]
encode_as! { isize => "q", usize => "Q" }

#[cfg(target_pointer_width = "32")]
encode_as! { isize => "i", usize => "I" }

unsafe impl<T> Encode for *const T {
    fn encode(out: &mut String) {
        out.push_str("^v");
    }
}

unsafe impl<T> Encode for *mut T {
    fn encode(out: &mut String) {
        out.push_str("^v");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Rect {
        origin: (f64, f64),
        size: (f64, f64),
    }

    unsafe impl Encode for Rect {
        fn encode(out: &mut String) {
            out.push_str("{Rect={Point=dd}{Size=dd}}");
        }
    }

    #[test]
    fn primitive_encodings() {
        assert_eq!(i64::encoding(), "q");
        assert_eq!(u8::encoding(), "C");
        assert_eq!(<()>::encoding(), "v");
        assert_eq!(Id::encoding(), "@");
        assert_eq!(Sel::encoding(), ":");
        assert_eq!(<*mut u8>::encoding(), "^v");
    }

    #[test]
    fn struct_encoding_is_user_supplied() {
        let _ = Rect { origin: (0.0, 0.0), size: (1.0, 1.0) };
        assert_eq!(Rect::encoding(), "{Rect={Point=dd}{Size=dd}}");
    }
}
