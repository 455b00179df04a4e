//! Wire-type signatures and the type tree they describe.
//!
//! A signature such as `a(ias)` is parsed into a [`Type`] tree with
//! [`parse`]. Only complete, single types are accepted, and the
//! dictionary-entry constructor `{...}` is rejected wherever it appears,
//! since the generated glue has no representation for it.

use crate::error::{Error, Result};

use log::trace;
use std::fmt;
use std::str::FromStr;

/// Longest signature the wire format can carry.
pub const MAX_SIGNATURE_LEN: usize = 255;
/// Deepest nesting of arrays, and separately of structures, in one type.
pub const MAX_NESTING: usize = 32;

/// The non-container DBus types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BasicType {
    Byte,
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
}

impl BasicType {
    pub const ALL: [BasicType; 13] = [
        BasicType::Byte,
        BasicType::Boolean,
        BasicType::Int16,
        BasicType::Uint16,
        BasicType::Int32,
        BasicType::Uint32,
        BasicType::Int64,
        BasicType::Uint64,
        BasicType::Double,
        BasicType::String,
        BasicType::ObjectPath,
        BasicType::Signature,
        BasicType::UnixFd,
    ];

    pub fn from_code(code: u8) -> Option<BasicType> {
        match code {
            b'y' => Some(BasicType::Byte),
            b'b' => Some(BasicType::Boolean),
            b'n' => Some(BasicType::Int16),
            b'q' => Some(BasicType::Uint16),
            b'i' => Some(BasicType::Int32),
            b'u' => Some(BasicType::Uint32),
            b'x' => Some(BasicType::Int64),
            b't' => Some(BasicType::Uint64),
            b'd' => Some(BasicType::Double),
            b's' => Some(BasicType::String),
            b'o' => Some(BasicType::ObjectPath),
            b'g' => Some(BasicType::Signature),
            b'h' => Some(BasicType::UnixFd),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            BasicType::Byte => b'y',
            BasicType::Boolean => b'b',
            BasicType::Int16 => b'n',
            BasicType::Uint16 => b'q',
            BasicType::Int32 => b'i',
            BasicType::Uint32 => b'u',
            BasicType::Int64 => b'x',
            BasicType::Uint64 => b't',
            BasicType::Double => b'd',
            BasicType::String => b's',
            BasicType::ObjectPath => b'o',
            BasicType::Signature => b'g',
            BasicType::UnixFd => b'h',
        }
    }

    /// String-like types are carried as references that may be null
    /// before they are filled in.
    pub fn is_text(self) -> bool {
        matches!(
            self,
            BasicType::String | BasicType::ObjectPath | BasicType::Signature
        )
    }
}

/// A run-time type tag, as reported by a message iterator or recorded
/// alongside a variant payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Invalid,
    Basic(BasicType),
    Array,
    Struct,
    Variant,
    DictEntry,
}

impl TypeCode {
    pub fn from_code(code: u8) -> Option<TypeCode> {
        match code {
            b'a' => Some(TypeCode::Array),
            b'(' => Some(TypeCode::Struct),
            b'v' => Some(TypeCode::Variant),
            b'{' => Some(TypeCode::DictEntry),
            _ => BasicType::from_code(code).map(TypeCode::Basic),
        }
    }

    /// The signature character, or `None` for [`TypeCode::Invalid`].
    pub fn code(self) -> Option<u8> {
        match self {
            TypeCode::Invalid => None,
            TypeCode::Basic(basic) => Some(basic.code()),
            TypeCode::Array => Some(b'a'),
            TypeCode::Struct => Some(b'('),
            TypeCode::Variant => Some(b'v'),
            TypeCode::DictEntry => Some(b'{'),
        }
    }

    pub fn basic(self) -> Option<BasicType> {
        match self {
            TypeCode::Basic(basic) => Some(basic),
            _ => None,
        }
    }

    pub fn is_basic(self) -> bool {
        self.basic().is_some()
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "'{}'", code as char),
            None => f.write_str("INVALID"),
        }
    }
}

/// One complete type, parsed from a signature.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Primitive(BasicType),
    Array(Box<Type>),
    Struct(Vec<Type>),
    Variant,
}

impl Type {
    /// The discriminator this node keeps of its own signature.
    pub fn code(&self) -> u8 {
        match self {
            Type::Primitive(basic) => basic.code(),
            Type::Array(_) => b'a',
            Type::Struct(_) => b'(',
            Type::Variant => b'v',
        }
    }

    /// The tag a message iterator reports for a value of this type.
    pub fn type_code(&self) -> TypeCode {
        match self {
            Type::Primitive(basic) => TypeCode::Basic(*basic),
            Type::Array(_) => TypeCode::Array,
            Type::Struct(_) => TypeCode::Struct,
            Type::Variant => TypeCode::Variant,
        }
    }

    pub fn children(&self) -> &[Type] {
        match self {
            Type::Array(element) => std::slice::from_ref(element.as_ref()),
            Type::Struct(members) => members,
            Type::Primitive(_) | Type::Variant => &[],
        }
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, Type::Primitive(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Type::Array(_))
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, Type::Struct(_))
    }

    pub fn is_variant(&self) -> bool {
        matches!(self, Type::Variant)
    }

    /// Whether decoding a value of this type can leave heap buffers behind.
    pub fn needs_release(&self) -> bool {
        match self {
            Type::Primitive(_) => false,
            Type::Array(_) | Type::Variant => true,
            Type::Struct(members) => members.iter().any(Type::needs_release),
        }
    }

    /// Rebuilds the signature this type was parsed from.
    pub fn signature(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Primitive(basic) => write!(f, "{}", basic.code() as char),
            Type::Array(element) => write!(f, "a{}", element),
            Type::Struct(members) => {
                f.write_str("(")?;
                for member in members {
                    write!(f, "{}", member)?;
                }
                f.write_str(")")
            }
            Type::Variant => f.write_str("v"),
        }
    }
}

impl FromStr for Type {
    type Err = Error;

    fn from_str(s: &str) -> Result<Type> {
        parse(s)
    }
}

fn bad(signature: &str, reason: &'static str) -> Error {
    Error::BadSignature {
        signature: signature.to_owned(),
        reason,
    }
}

/// Parses exactly one complete type.
pub fn parse(signature: &str) -> Result<Type> {
    if !signature.is_ascii() {
        return Err(bad(signature, "unknown type code"));
    }
    if signature.len() > MAX_SIGNATURE_LEN {
        return Err(bad(signature, "signature longer than 255 bytes"));
    }
    let ty = parse_single(signature, 0, 0)?;
    trace!("parsed signature {:?}", signature);
    Ok(ty)
}

/// `arrays` and `structs` count the containers enclosing `signature`.
fn parse_single(signature: &str, arrays: usize, structs: usize) -> Result<Type> {
    let bytes = signature.as_bytes();
    let first = match bytes.first() {
        Some(first) => *first,
        None => return Err(bad(signature, "empty signature")),
    };

    match first {
        b'{' => Err(bad(signature, "dictionary entries are not supported")),
        b'a' => {
            if arrays == MAX_NESTING {
                return Err(bad(signature, "arrays nested more than 32 deep"));
            }
            let element = parse_single(&signature[1..], arrays + 1, structs)
                .map_err(|err| match err {
                    Error::BadSignature { reason, .. } => bad(signature, reason),
                    other => other,
                })?;
            Ok(Type::Array(Box::new(element)))
        }
        b'(' => {
            let len = span_len(bytes).ok_or_else(|| bad(signature, "unbalanced brackets"))?;
            if len != bytes.len() {
                return Err(bad(signature, "trailing types after a complete type"));
            }
            if len == 2 {
                return Err(bad(signature, "empty structures are not allowed"));
            }
            if structs == MAX_NESTING {
                return Err(bad(signature, "structures nested more than 32 deep"));
            }
            let members = split(&signature[1..len - 1])?
                .into_iter()
                .map(|member| parse_single(member, arrays, structs + 1))
                .collect::<Result<Vec<_>>>()
                .map_err(|err| match err {
                    Error::BadSignature { reason, .. } => bad(signature, reason),
                    other => other,
                })?;
            Ok(Type::Struct(members))
        }
        code => {
            let ty = if code == b'v' {
                Type::Variant
            } else if let Some(basic) = BasicType::from_code(code) {
                Type::Primitive(basic)
            } else if code == b')' || code == b'}' {
                return Err(bad(signature, "unbalanced brackets"));
            } else {
                return Err(bad(signature, "unknown type code"));
            };
            if bytes.len() != 1 {
                return Err(bad(signature, "trailing types after a complete type"));
            }
            Ok(ty)
        }
    }
}

/// Length of the complete type at the front of `sig`, or `None` when its
/// brackets never balance.
pub(crate) fn span_len(sig: &[u8]) -> Option<usize> {
    let arrays = sig.iter().take_while(|byte| **byte == b'a').count();
    let rest = &sig[arrays..];
    let len = match rest.first()? {
        open @ b'(' | open @ b'{' => {
            let close = if *open == b'(' { b')' } else { b'}' };
            let mut depth = 1usize;
            let mut end = None;
            for (ix, byte) in rest.iter().enumerate().skip(1) {
                if byte == open {
                    depth += 1;
                } else if *byte == close {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(ix + 1);
                        break;
                    }
                }
            }
            end?
        }
        _ => 1,
    };
    Some(arrays + len)
}

/// Splits a structure body into its members' signatures, in order.
///
/// The spans partition `body`: concatenated, they give it back unchanged.
pub fn split(body: &str) -> Result<Vec<&str>> {
    if !body.is_ascii() {
        return Err(bad(body, "unknown type code"));
    }
    let mut spans = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let len = span_len(rest.as_bytes()).ok_or_else(|| bad(body, "unbalanced brackets"))?;
        let (span, tail) = rest.split_at(len);
        spans.push(span);
        rest = tail;
    }
    Ok(spans)
}
