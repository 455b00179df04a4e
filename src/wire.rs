//! An in-memory implementation of the DBus marshalling format.
//!
//! [`WireWriter`] and [`WireReader`] expose the same iterator operations
//! the generated glue calls on a real connection's messages (append a basic
//! value, open and close containers, inspect the current element's type,
//! read it, step past it, descend into it), over a little-endian
//! [`Message`](crate::message::Message) body.

use crate::error::{Error, Result};

use std::num::Wrapping;

pub(crate) mod builder;
mod reader;
mod writer;

pub use reader::WireReader;
pub use writer::{Container, WireWriter};

pub(crate) fn align(ix: usize, alignment: usize) -> usize {
    debug_assert!(
        alignment.is_power_of_two(),
        "{} is not power of 2, cannot be used as alignment",
        alignment
    );
    let mask = Wrapping(alignment) - Wrapping(1);
    let old_size = Wrapping(ix);
    (old_size + ((-old_size) & mask)).0
}

/// Alignment of a value whose signature starts with `code`.
pub(crate) fn alignment_of(code: u8) -> Result<usize> {
    match code {
        b'y' => Ok(1), // BYTE
        b'b' => Ok(4), // BOOLEAN
        b'n' => Ok(2), // INT16
        b'q' => Ok(2), // UINT16
        b'i' => Ok(4), // INT32
        b'u' => Ok(4), // UINT32
        b'x' => Ok(8), // INT64
        b't' => Ok(8), // UINT64
        b'd' => Ok(8), // DOUBLE
        b's' => Ok(4), // STRING
        b'o' => Ok(4), // OBJECT_PATH
        b'g' => Ok(1), // SIGNATURE
        b'a' => Ok(4), // ARRAY
        b'(' => Ok(8), // STRUCT
        b'v' => Ok(1), // VARIANT
        b'{' => Ok(8), // DICT_ENTRY
        b'h' => Ok(4), // UNIX_FD
        _ => Err(Error::BadSignature {
            signature: (code as char).to_string(),
            reason: "unknown type code",
        }),
    }
}
