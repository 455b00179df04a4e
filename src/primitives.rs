use crate::error::{Error, Result};
use crate::signature::{BasicType, TypeCode};
use crate::wire::builder::MessageBuilder;

use std::mem::size_of;

pub(crate) trait DbusPrimitive {
    fn alignment() -> usize;
    fn size(&self) -> usize;
    fn serialize(&self, out: &mut [u8]) -> Result<()>;
}

macro_rules! basic_primitive {
    ($type:ident) => {
        impl DbusPrimitive for $type {
            fn size(&self) -> usize {
                size_of::<$type>()
            }

            fn serialize(&self, out: &mut [u8]) -> Result<()> {
                out.copy_from_slice(&self.to_le_bytes());
                Ok(())
            }

            fn alignment() -> usize {
                size_of::<$type>()
            }
        }
    };
}

basic_primitive!(u8);
basic_primitive!(f64);
basic_primitive!(i16);
basic_primitive!(u16);
basic_primitive!(i32);
basic_primitive!(u32);
basic_primitive!(i64);
basic_primitive!(u64);

impl DbusPrimitive for bool {
    fn size(&self) -> usize {
        4
    }

    fn serialize(&self, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(&(*self as u32).to_le_bytes());
        Ok(())
    }

    fn alignment() -> usize {
        4
    }
}

fn serialize_long_string(bytes: &[u8], out: &mut [u8]) {
    out[0..4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
    out[4..4 + bytes.len()].copy_from_slice(bytes);
    out[4 + bytes.len()] = 0u8;
}

impl DbusPrimitive for &str {
    fn size(&self) -> usize {
        self.as_bytes().len() + 5 // size and terminating null
    }

    fn serialize(&self, out: &mut [u8]) -> Result<()> {
        serialize_long_string(self.as_bytes(), out);
        Ok(())
    }

    fn alignment() -> usize {
        4
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Signature<'a>(pub &'a str);

impl DbusPrimitive for Signature<'_> {
    fn size(&self) -> usize {
        self.0.as_bytes().len() + 2 // size and terminating null
    }

    fn serialize(&self, out: &mut [u8]) -> Result<()> {
        let bytes = self.0.as_bytes();
        if bytes.len() > u8::MAX as usize {
            return Err(Error::BadSignature {
                signature: self.0.to_owned(),
                reason: "signature longer than 255 bytes",
            });
        }
        out[0] = bytes.len() as u8;
        out[1..1 + bytes.len()].copy_from_slice(bytes);
        out[1 + bytes.len()] = 0u8;
        Ok(())
    }

    fn alignment() -> usize {
        1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ObjectPath<'a>(pub &'a str);

impl DbusPrimitive for ObjectPath<'_> {
    fn size(&self) -> usize {
        self.0.as_bytes().len() + 5 // size and terminating null
    }

    fn serialize(&self, out: &mut [u8]) -> Result<()> {
        serialize_long_string(self.0.as_bytes(), out);
        Ok(())
    }

    fn alignment() -> usize {
        4
    }
}

/// Index into the out-of-band file descriptor array of a message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct UnixFd(pub u32);

impl DbusPrimitive for UnixFd {
    fn size(&self) -> usize {
        4
    }

    fn serialize(&self, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(&self.0.to_le_bytes());
        Ok(())
    }

    fn alignment() -> usize {
        4
    }
}

pub(crate) fn write_primitive<T: DbusPrimitive>(
    builder: &mut MessageBuilder,
    primitive: &T,
) -> Result<()> {
    builder.align(T::alignment());
    primitive.serialize(builder.prepare_write(primitive.size()))
}

/// A value of one of the basic types. String-like values hold `None`
/// while they are still a null reference.
#[derive(Debug, Clone, PartialEq)]
pub enum BasicValue {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(Option<String>),
    ObjectPath(Option<String>),
    Signature(Option<String>),
    UnixFd(u32),
}

impl BasicValue {
    /// Zero for numbers, a null reference for strings.
    pub fn default_for(basic: BasicType) -> BasicValue {
        match basic {
            BasicType::Byte => BasicValue::Byte(0),
            BasicType::Boolean => BasicValue::Boolean(false),
            BasicType::Int16 => BasicValue::Int16(0),
            BasicType::Uint16 => BasicValue::Uint16(0),
            BasicType::Int32 => BasicValue::Int32(0),
            BasicType::Uint32 => BasicValue::Uint32(0),
            BasicType::Int64 => BasicValue::Int64(0),
            BasicType::Uint64 => BasicValue::Uint64(0),
            BasicType::Double => BasicValue::Double(0.0),
            BasicType::String => BasicValue::String(None),
            BasicType::ObjectPath => BasicValue::ObjectPath(None),
            BasicType::Signature => BasicValue::Signature(None),
            BasicType::UnixFd => BasicValue::UnixFd(0),
        }
    }

    pub fn basic_type(&self) -> BasicType {
        match self {
            BasicValue::Byte(_) => BasicType::Byte,
            BasicValue::Boolean(_) => BasicType::Boolean,
            BasicValue::Int16(_) => BasicType::Int16,
            BasicValue::Uint16(_) => BasicType::Uint16,
            BasicValue::Int32(_) => BasicType::Int32,
            BasicValue::Uint32(_) => BasicType::Uint32,
            BasicValue::Int64(_) => BasicType::Int64,
            BasicValue::Uint64(_) => BasicType::Uint64,
            BasicValue::Double(_) => BasicType::Double,
            BasicValue::String(_) => BasicType::String,
            BasicValue::ObjectPath(_) => BasicType::ObjectPath,
            BasicValue::Signature(_) => BasicType::Signature,
            BasicValue::UnixFd(_) => BasicType::UnixFd,
        }
    }

    pub fn type_code(&self) -> TypeCode {
        TypeCode::Basic(self.basic_type())
    }

    /// Appends this value as its basic wire type. A null string goes out
    /// as the empty string.
    pub(crate) fn write(&self, builder: &mut MessageBuilder) -> Result<()> {
        match self {
            BasicValue::Byte(val) => write_primitive(builder, val),
            BasicValue::Boolean(val) => write_primitive(builder, val),
            BasicValue::Int16(val) => write_primitive(builder, val),
            BasicValue::Uint16(val) => write_primitive(builder, val),
            BasicValue::Int32(val) => write_primitive(builder, val),
            BasicValue::Uint32(val) => write_primitive(builder, val),
            BasicValue::Int64(val) => write_primitive(builder, val),
            BasicValue::Uint64(val) => write_primitive(builder, val),
            BasicValue::Double(val) => write_primitive(builder, val),
            BasicValue::String(val) => {
                write_primitive(builder, &val.as_deref().unwrap_or(""))
            }
            BasicValue::ObjectPath(val) => {
                write_primitive(builder, &ObjectPath(val.as_deref().unwrap_or("")))
            }
            BasicValue::Signature(val) => {
                write_primitive(builder, &Signature(val.as_deref().unwrap_or("")))
            }
            BasicValue::UnixFd(val) => write_primitive(builder, &UnixFd(*val)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn null_string_is_written_empty() -> Result<()> {
        let mut builder = MessageBuilder::new();
        BasicValue::String(None).write(&mut builder)?;
        assert_eq!(builder.complete(), vec![0, 0, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn signature_has_one_byte_length() -> Result<()> {
        let mut builder = MessageBuilder::new();
        BasicValue::Signature(Some("ai".to_owned())).write(&mut builder)?;
        assert_eq!(builder.complete(), vec![2, b'a', b'i', 0]);
        Ok(())
    }

    #[test]
    fn defaults_match_their_type() {
        for basic in BasicType::ALL.iter() {
            assert_eq!(BasicValue::default_for(*basic).basic_type(), *basic);
        }
    }
}
