use crate::error::{Error, Result};
use crate::message::Message;
use crate::primitives::BasicValue;
use crate::signature::{span_len, BasicType, TypeCode};

use super::{align, alignment_of};

use byteorder::{ByteOrder, LittleEndian};
use log::{error, trace};
use std::marker::PhantomData;
use std::str::from_utf8;

/// Deepest container nesting a value may have.
const MAX_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug)]
enum Mode<'m> {
    /// Top level, structure members, or a variant payload: one value per
    /// complete type in `sig`.
    Sequence { sig: &'m [u8], ix: usize },
    /// Array elements of type `element` until the data reaches `end`.
    Array { element: &'m [u8], end: usize },
}

/// A read cursor over one container level of a message body.
///
/// Reading never consumes: [`get_basic`](Self::get_basic) and
/// [`recurse`](Self::recurse) look at the current element, and
/// [`next`](Self::next) steps past it whatever its type.
#[derive(Clone, Debug)]
pub struct WireReader<'m, B: ByteOrder = LittleEndian> {
    data: &'m [u8],
    pos: usize,
    mode: Mode<'m>,
    phantom: PhantomData<B>,
}

impl<'m> WireReader<'m, LittleEndian> {
    pub fn new(message: &'m Message) -> Self {
        Self::with_byte_order(message)
    }
}

impl<'m, B: ByteOrder> WireReader<'m, B> {
    pub fn with_byte_order(message: &'m Message) -> Self {
        Self {
            data: &message.data,
            pos: 0,
            mode: Mode::Sequence {
                sig: &message.signature,
                ix: 0,
            },
            phantom: PhantomData,
        }
    }

    fn read(&self, pos: usize, len: usize) -> Result<&'m [u8]> {
        let end = pos + len;
        if end > self.data.len() {
            error!("Index out of bounds");
            return Err(Error::IndexOutOfBounds(end));
        }
        Ok(&self.data[pos..end])
    }

    fn current(&self) -> Result<Option<&'m [u8]>> {
        match self.mode {
            Mode::Sequence { sig, ix } => {
                if ix >= sig.len() {
                    return Ok(None);
                }
                let len = span_len(&sig[ix..]).ok_or(Error::SignatureExhausted)?;
                Ok(Some(&sig[ix..ix + len]))
            }
            Mode::Array { element, end } => {
                let first = *element.first().ok_or(Error::SignatureExhausted)?;
                if align(self.pos, alignment_of(first)?) >= end {
                    Ok(None)
                } else {
                    Ok(Some(element))
                }
            }
        }
    }

    /// The type of the current element, [`TypeCode::Invalid`] past the end.
    pub fn arg_type(&self) -> Result<TypeCode> {
        Ok(match self.current()? {
            Some(sig) => TypeCode::from_code(sig[0]).unwrap_or(TypeCode::Invalid),
            None => TypeCode::Invalid,
        })
    }

    pub fn get_basic(&self) -> Result<BasicValue> {
        let code = self.arg_type()?;
        let basic = code.basic().ok_or(Error::NotABasicValue(code))?;
        let (value, _) = self.read_basic_at(basic, self.pos)?;
        trace!("read {:?} at {}", value, self.pos);
        Ok(value)
    }

    /// Steps past the current element. Returns whether another element
    /// follows it.
    pub fn next(&mut self) -> Result<bool> {
        let sig = match self.current()? {
            Some(sig) => sig,
            None => return Ok(false),
        };
        let pos = self.skip_value(sig, self.pos, 0)?;
        match &mut self.mode {
            Mode::Sequence { ix, .. } => *ix += sig.len(),
            // An element that takes no bytes would repeat forever.
            Mode::Array { .. } if pos <= self.pos => {
                error!("array element at {} occupies no bytes", self.pos);
                return Err(Error::StalledArray(self.pos));
            }
            Mode::Array { .. } => {}
        }
        self.pos = pos;
        Ok(self.current()?.is_some())
    }

    /// A reader over the contents of the current array, struct or variant.
    pub fn recurse(&self) -> Result<WireReader<'m, B>> {
        let sig = self
            .current()?
            .ok_or(Error::NotAContainer(TypeCode::Invalid))?;
        let (pos, mode) = match sig[0] {
            b'a' => {
                let (start, end) = self.array_bounds(sig, self.pos)?;
                (
                    start,
                    Mode::Array {
                        element: &sig[1..],
                        end,
                    },
                )
            }
            b'(' | b'{' => (
                align(self.pos, 8),
                Mode::Sequence {
                    sig: &sig[1..sig.len() - 1],
                    ix: 0,
                },
            ),
            b'v' => {
                let (inner, body) = self.variant_signature(self.pos)?;
                (body, Mode::Sequence { sig: inner, ix: 0 })
            }
            code => {
                return Err(Error::NotAContainer(
                    TypeCode::from_code(code).unwrap_or(TypeCode::Invalid),
                ))
            }
        };
        Ok(WireReader {
            data: self.data,
            pos,
            mode,
            phantom: PhantomData,
        })
    }

    fn array_bounds(&self, sig: &[u8], pos: usize) -> Result<(usize, usize)> {
        let at = align(pos, 4);
        let len = B::read_u32(self.read(at, 4)?) as usize;
        let element = *sig.get(1).ok_or(Error::SignatureExhausted)?;
        let start = align(at + 4, alignment_of(element)?);
        let end = start + len;
        if end > self.data.len() {
            return Err(Error::IndexOutOfBounds(end));
        }
        Ok((start, end))
    }

    fn variant_signature(&self, pos: usize) -> Result<(&'m [u8], usize)> {
        let len = self.read(pos, 1)?[0] as usize;
        let inner = self.read(pos + 1, len)?;
        self.read(pos + 1 + len, 1)?;
        if span_len(inner) != Some(len) {
            return Err(Error::BadSignature {
                signature: String::from_utf8_lossy(inner).into_owned(),
                reason: "variant must hold exactly one complete type",
            });
        }
        Ok((inner, pos + 2 + len))
    }

    fn skip_value(&self, sig: &[u8], pos: usize, depth: usize) -> Result<usize> {
        if depth > MAX_DEPTH {
            return Err(Error::NestingTooDeep(MAX_DEPTH));
        }
        let code = *sig.first().ok_or(Error::SignatureExhausted)?;
        match code {
            b'a' => Ok(self.array_bounds(sig, pos)?.1),
            b'(' | b'{' => {
                let body = &sig[1..sig.len() - 1];
                let mut pos = align(pos, 8);
                let mut ix = 0;
                while ix < body.len() {
                    let len = span_len(&body[ix..]).ok_or(Error::SignatureExhausted)?;
                    pos = self.skip_value(&body[ix..ix + len], pos, depth + 1)?;
                    ix += len;
                }
                Ok(pos)
            }
            b'v' => {
                let (inner, body) = self.variant_signature(pos)?;
                self.skip_value(inner, body, depth + 1)
            }
            _ => {
                let basic = BasicType::from_code(code).ok_or(Error::BadSignature {
                    signature: (code as char).to_string(),
                    reason: "unknown type code",
                })?;
                Ok(self.read_basic_at(basic, pos)?.1)
            }
        }
    }

    fn read_string(&self, pos: usize) -> Result<(String, usize)> {
        let at = align(pos, 4);
        let len = B::read_u32(self.read(at, 4)?) as usize;
        let bytes = self.read(at + 4, len + 1)?;
        Ok((from_utf8(&bytes[..len])?.to_owned(), at + 5 + len))
    }

    fn read_basic_at(&self, basic: BasicType, pos: usize) -> Result<(BasicValue, usize)> {
        let at = align(pos, alignment_of(basic.code())?);
        let value = match basic {
            BasicType::Byte => (BasicValue::Byte(self.read(at, 1)?[0]), at + 1),
            BasicType::Boolean => {
                let i = B::read_u32(self.read(at, 4)?);
                if i > 1 {
                    return Err(Error::InvalidBoolValue(i));
                }
                (BasicValue::Boolean(i == 1), at + 4)
            }
            BasicType::Int16 => (BasicValue::Int16(B::read_i16(self.read(at, 2)?)), at + 2),
            BasicType::Uint16 => (BasicValue::Uint16(B::read_u16(self.read(at, 2)?)), at + 2),
            BasicType::Int32 => (BasicValue::Int32(B::read_i32(self.read(at, 4)?)), at + 4),
            BasicType::Uint32 => (BasicValue::Uint32(B::read_u32(self.read(at, 4)?)), at + 4),
            BasicType::Int64 => (BasicValue::Int64(B::read_i64(self.read(at, 8)?)), at + 8),
            BasicType::Uint64 => (BasicValue::Uint64(B::read_u64(self.read(at, 8)?)), at + 8),
            BasicType::Double => (BasicValue::Double(B::read_f64(self.read(at, 8)?)), at + 8),
            BasicType::UnixFd => (BasicValue::UnixFd(B::read_u32(self.read(at, 4)?)), at + 4),
            BasicType::String => {
                let (string, end) = self.read_string(at)?;
                (BasicValue::String(Some(string)), end)
            }
            BasicType::ObjectPath => {
                let (string, end) = self.read_string(at)?;
                (BasicValue::ObjectPath(Some(string)), end)
            }
            BasicType::Signature => {
                let len = self.read(at, 1)?[0] as usize;
                let bytes = self.read(at + 1, len + 1)?;
                let sig = from_utf8(&bytes[..len])?.to_owned();
                (BasicValue::Signature(Some(sig)), at + 2 + len)
            }
        };
        Ok(value)
    }
}
