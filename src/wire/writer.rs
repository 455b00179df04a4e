use crate::error::{Error, Result};
use crate::message::Message;
use crate::primitives::{write_primitive, BasicValue, Signature};

use super::alignment_of;
use super::builder::{LengthToken, MessageBuilder};

use log::trace;

/// A container to open on a [`WireWriter`].
#[derive(Clone, Debug, PartialEq)]
pub enum Container {
    Struct,
    /// An array whose elements all have the given signature.
    Array(String),
    /// A variant carrying one value of the given signature.
    Variant(String),
}

enum OpenContainer {
    Struct,
    Array { token: LengthToken, element: Vec<u8> },
    Variant { signature: Vec<u8> },
}

/// Appends values to a message body, one container level at a time.
pub struct WireWriter {
    builder: MessageBuilder,
    signature: Vec<u8>,
    open: Vec<OpenContainer>,
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl WireWriter {
    pub fn new() -> Self {
        Self {
            builder: MessageBuilder::new(),
            signature: Vec::new(),
            open: Vec::new(),
        }
    }

    /// Array elements and variant payloads are described by their
    /// container, not by the message signature.
    fn records_signature(&self) -> bool {
        !self.open.iter().any(|open| match open {
            OpenContainer::Struct => false,
            OpenContainer::Array { .. } | OpenContainer::Variant { .. } => true,
        })
    }

    fn check_element(&self, signature: &[u8]) -> Result<()> {
        let expected = match self.open.last() {
            Some(OpenContainer::Array { element, .. }) => element,
            Some(OpenContainer::Variant { signature }) => signature,
            _ => return Ok(()),
        };
        let matches = if signature.len() == 1 {
            expected.first() == signature.first()
        } else {
            expected.as_slice() == signature
        };
        if matches {
            Ok(())
        } else {
            Err(Error::MismatchSignature(
                String::from_utf8_lossy(expected).into_owned(),
                String::from_utf8_lossy(signature).into_owned(),
            ))
        }
    }

    pub fn depth(&self) -> usize {
        self.open.len()
    }

    pub fn append_basic(&mut self, value: &BasicValue) -> Result<()> {
        let code = value.basic_type().code();
        self.check_element(&[code])?;
        value.write(&mut self.builder)?;
        if self.records_signature() {
            self.signature.push(code);
        }
        Ok(())
    }

    pub fn open_container(&mut self, container: Container) -> Result<()> {
        trace!("open {:?} at depth {}", container, self.open.len());
        match container {
            Container::Struct => {
                self.check_element(b"(")?;
                self.builder.align(8);
                if self.records_signature() {
                    self.signature.push(b'(');
                }
                self.open.push(OpenContainer::Struct);
            }
            Container::Array(element) => {
                let element = element.into_bytes();
                let first = match element.first() {
                    Some(first) => *first,
                    None => {
                        return Err(Error::BadSignature {
                            signature: String::new(),
                            reason: "empty signature",
                        })
                    }
                };
                let mut array_sig = vec![b'a'];
                array_sig.extend_from_slice(&element);
                self.check_element(&array_sig)?;
                if self.records_signature() {
                    self.signature.extend_from_slice(&array_sig);
                }
                self.builder.align(4);
                let token = self.builder.start_length();
                self.builder.align(alignment_of(first)?);
                self.open.push(OpenContainer::Array { token, element });
            }
            Container::Variant(signature) => {
                self.check_element(b"v")?;
                write_primitive(&mut self.builder, &Signature(&signature))?;
                if self.records_signature() {
                    self.signature.push(b'v');
                }
                self.open.push(OpenContainer::Variant {
                    signature: signature.into_bytes(),
                });
            }
        }
        Ok(())
    }

    pub fn close_container(&mut self) -> Result<()> {
        match self.open.pop() {
            None => return Err(Error::UnbalancedContainer(0)),
            Some(OpenContainer::Struct) => {
                if self.records_signature() {
                    self.signature.push(b')');
                }
            }
            Some(OpenContainer::Array { token, .. }) => self.builder.finish_length(token),
            Some(OpenContainer::Variant { .. }) => {}
        }
        trace!("closed container, depth now {}", self.open.len());
        Ok(())
    }

    pub fn finish(self) -> Result<Message> {
        if !self.open.is_empty() {
            return Err(Error::UnbalancedContainer(self.open.len()));
        }
        Ok(Message {
            data: self.builder.complete(),
            signature: self.signature,
        })
    }
}
