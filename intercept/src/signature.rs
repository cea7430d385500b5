//! Type encoding parser and method/closure signatures.

use crate::closure::HookClosure;
use crate::error::{HookError, Result};
use std::fmt::Write;
use swizzle_runtime::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Void,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl Primitive {
    fn code(self) -> char {
        match self {
            Primitive::Void => 'v',
            Primitive::Bool => 'B',
            Primitive::I8 => 'c',
            Primitive::I16 => 's',
            Primitive::I32 => 'i',
            Primitive::I64 => 'q',
            Primitive::U8 => 'C',
            Primitive::U16 => 'S',
            Primitive::U32 => 'I',
            Primitive::U64 => 'Q',
            Primitive::F32 => 'f',
            Primitive::F64 => 'd',
        }
    }
}

/// One parsed value type.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoding {
    Primitive(Primitive),
    /// `^type` and `*`; the pointee is not tracked.
    Pointer,
    Object,
    Class,
    Selector,
    /// `@?`, optionally carrying the callable's own signature in `<...>`.
    Closure(Option<Box<Signature>>),
    Struct { name: String, fields: Vec<Encoding> },
}

impl Encoding {
    /// Canonical code: class names, qualifiers, offsets and closure
    /// signatures are dropped. Two encodings with the same code share a
    /// calling-convention layout.
    pub fn code(&self) -> String {
        let mut out = String::new();
        self.write_code(&mut out);
        out
    }

    fn write_code(&self, out: &mut String) {
        match self {
            Encoding::Primitive(p) => out.push(p.code()),
            Encoding::Pointer => out.push_str("^v"),
            Encoding::Object => out.push('@'),
            Encoding::Class => out.push('#'),
            Encoding::Selector => out.push(':'),
            Encoding::Closure(_) => out.push_str("@?"),
            Encoding::Struct { name, fields } => {
                let _ = write!(out, "{{{name}=");
                for field in fields {
                    field.write_code(out);
                }
                out.push('}');
            }
        }
    }

    pub fn same_type(&self, other: &Encoding) -> bool {
        self.code() == other.code()
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Encoding::Primitive(Primitive::Void))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Implicit receiver and selector are the first two arguments.
    Method,
    /// The callable itself is passed first and is not listed in `args`.
    Closure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub ret: Encoding,
    pub args: Vec<Encoding>,
    pub shape: Shape,
}

impl Signature {
    pub fn parse(types: &str, shape: Shape) -> Result<Signature> {
        if types.is_empty() {
            return Err(HookError::NoSignature);
        }
        let mut parser = Parser { bytes: types.as_bytes(), pos: 0 };
        let ret = parser.parse_type()?;
        let mut args = Vec::new();
        while !parser.at_end() {
            args.push(parser.parse_type()?);
        }
        match shape {
            Shape::Method => {
                let leading_ok = matches!(args.first(), Some(Encoding::Object | Encoding::Class))
                    && matches!(args.get(1), Some(Encoding::Selector));
                if !leading_ok {
                    return Err(HookError::UnsupportedType(format!(
                        "'{types}' lacks the receiver and selector arguments"
                    )));
                }
            }
            Shape::Closure => match args.first() {
                Some(Encoding::Closure(_)) => {
                    args.remove(0);
                }
                _ => return Err(HookError::NoSignature),
            },
        }
        Ok(Signature { ret, args, shape })
    }

    pub fn of_method(method: Method) -> Result<Signature> {
        Signature::parse(method.types(), Shape::Method)
    }

    pub fn of_closure(closure: &HookClosure) -> Result<Signature> {
        Signature::parse(closure.encoding(), Shape::Closure)
    }

    /// Arguments other than receiver and selector.
    pub fn explicit_args(&self) -> &[Encoding] {
        match self.shape {
            Shape::Method => &self.args[2..],
            Shape::Closure => &self.args,
        }
    }

    pub fn codes(&self) -> String {
        let mut out = self.ret.code();
        if self.shape == Shape::Closure {
            out.push_str("@?");
        }
        for arg in &self.args {
            arg.write_code(&mut out);
        }
        out
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn rest(&self) -> String {
        String::from_utf8_lossy(&self.bytes[self.pos.min(self.bytes.len())..]).into_owned()
    }

    fn skip_qualifiers(&mut self) {
        while matches!(self.peek(), Some(b'r' | b'n' | b'N' | b'o' | b'O' | b'R' | b'V' | b'A' | b'j')) {
            self.pos += 1;
        }
    }

    fn skip_offset(&mut self) {
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
    }

    fn parse_type(&mut self) -> Result<Encoding> {
        self.skip_qualifiers();
        let start = self.pos;
        let Some(code) = self.bump() else {
            return Err(HookError::UnsupportedType("truncated encoding".into()));
        };
        let encoding = match code {
            b'v' => Encoding::Primitive(Primitive::Void),
            b'B' => Encoding::Primitive(Primitive::Bool),
            b'c' => Encoding::Primitive(Primitive::I8),
            b's' => Encoding::Primitive(Primitive::I16),
            b'i' | b'l' => Encoding::Primitive(Primitive::I32),
            b'q' => Encoding::Primitive(Primitive::I64),
            b'C' => Encoding::Primitive(Primitive::U8),
            b'S' => Encoding::Primitive(Primitive::U16),
            b'I' | b'L' => Encoding::Primitive(Primitive::U32),
            b'Q' => Encoding::Primitive(Primitive::U64),
            b'f' => Encoding::Primitive(Primitive::F32),
            b'd' => Encoding::Primitive(Primitive::F64),
            b'*' => Encoding::Pointer,
            b'^' => {
                self.skip_pointee()?;
                Encoding::Pointer
            }
            b'#' => Encoding::Class,
            b':' => Encoding::Selector,
            b'@' => self.parse_object()?,
            b'{' => self.parse_struct()?,
            _ => {
                self.pos = start;
                return Err(HookError::UnsupportedType(self.rest()));
            }
        };
        self.skip_offset();
        Ok(encoding)
    }

    fn parse_object(&mut self) -> Result<Encoding> {
        match self.peek() {
            Some(b'?') => {
                self.pos += 1;
                if self.peek() != Some(b'<') {
                    return Ok(Encoding::Closure(None));
                }
                self.pos += 1;
                let inner_start = self.pos;
                let mut depth = 1usize;
                while depth > 0 {
                    match self.bump() {
                        Some(b'<') => depth += 1,
                        Some(b'>') => depth -= 1,
                        Some(_) => {}
                        None => return Err(HookError::UnsupportedType("unterminated closure signature".into())),
                    }
                }
                let inner = std::str::from_utf8(&self.bytes[inner_start..self.pos - 1])
                    .map_err(|_| HookError::UnsupportedType("closure signature is not UTF-8".into()))?;
                let signature = Signature::parse(inner, Shape::Closure)?;
                Ok(Encoding::Closure(Some(Box::new(signature))))
            }
            Some(b'"') => {
                self.pos += 1;
                while let Some(byte) = self.bump() {
                    if byte == b'"' {
                        return Ok(Encoding::Object);
                    }
                }
                Err(HookError::UnsupportedType("unterminated class name".into()))
            }
            _ => Ok(Encoding::Object),
        }
    }

    fn parse_struct(&mut self) -> Result<Encoding> {
        let name_start = self.pos;
        loop {
            match self.bump() {
                Some(b'=') => break,
                Some(b'}') => {
                    let name = String::from_utf8_lossy(&self.bytes[name_start..self.pos - 1]);
                    return Err(HookError::UnsupportedType(format!("opaque struct {name}")));
                }
                Some(_) => {}
                None => return Err(HookError::UnsupportedType("unterminated struct".into())),
            }
        }
        let name = String::from_utf8_lossy(&self.bytes[name_start..self.pos - 1]).into_owned();
        let mut fields = Vec::new();
        loop {
            match self.peek() {
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Encoding::Struct { name, fields });
                }
                Some(b'"') => {
                    // named field
                    self.pos += 1;
                    while !matches!(self.bump(), Some(b'"') | None) {}
                }
                Some(_) => fields.push(self.parse_type()?),
                None => return Err(HookError::UnsupportedType(format!("unterminated struct {name}"))),
            }
        }
    }

    fn skip_pointee(&mut self) -> Result<()> {
        self.skip_qualifiers();
        let Some(byte) = self.bump() else {
            return Err(HookError::UnsupportedType("pointer without pointee".into()));
        };
        let closer = match byte {
            b'^' => return self.skip_pointee(),
            b'{' => b'}',
            b'(' => b')',
            b'[' => b']',
            b'@' => {
                if self.peek() == Some(b'?') {
                    self.pos += 1;
                } else if self.peek() == Some(b'"') {
                    self.pos += 1;
                    while !matches!(self.bump(), Some(b'"') | None) {}
                }
                return Ok(());
            }
            _ => return Ok(()),
        };
        let mut depth = 1usize;
        while depth > 0 {
            match self.bump() {
                Some(b) if b == byte => depth += 1,
                Some(b) if b == closer => depth -= 1,
                Some(_) => {}
                None => return Err(HookError::UnsupportedType("unterminated pointee".into())),
            }
        }
        Ok(())
    }
}
