//! The code-item model the marshalling compiler produces.
//!
//! Generated code is kept as data: procedures made of [`Op`]s over
//! [`Place`]s and message iterators. It is rendered to text by
//! [`crate::emit`] and can be run directly by [`super::machine`].

use crate::model::Direction;
use crate::signature::{BasicType, Type, TypeCode};

use indexmap::IndexMap;
use std::fmt;

/// Each scope sees two message iterators: the one it was handed, and the
/// one it descends into containers with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Iter {
    Outer,
    Inner,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Root {
    /// The value a procedure was called on.
    Param,
    /// A variable declared by an entry point.
    Local(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Member(usize),
    /// The array element at the enclosing loop's index.
    Element,
}

/// An lvalue: a root plus a path of struct members and array elements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Place {
    pub root: Root,
    pub path: Vec<Step>,
}

impl Place {
    pub fn param() -> Self {
        Self {
            root: Root::Param,
            path: Vec::new(),
        }
    }

    pub fn local(name: &str) -> Self {
        Self {
            root: Root::Local(name.to_owned()),
            path: Vec::new(),
        }
    }

    pub fn member(&self, ix: usize) -> Self {
        let mut place = self.clone();
        place.path.push(Step::Member(ix));
        place
    }

    pub fn element(&self) -> Self {
        let mut place = self.clone();
        place.path.push(Step::Element);
        place
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            Root::Param => f.write_str("value")?,
            Root::Local(name) => f.write_str(name)?,
        }
        for step in &self.path {
            match step {
                Step::Member(ix) => write!(f, ".member_{}", ix)?,
                Step::Element => f.write_str("[i]")?,
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    // Encoding
    AppendBasic { iter: Iter, ty: BasicType, value: Place },
    OpenStruct { parent: Iter },
    OpenArray { parent: Iter, element: Type },
    /// Fails the encode unless the variant at `value` is tagged with a
    /// basic type.
    RequireBasicVariant { value: Place },
    OpenVariant { parent: Iter, value: Place },
    AppendVariantPayload { iter: Iter, value: Place },
    CloseContainer { parent: Iter },

    // Decoding
    /// Runs `then` only if the current element has the expected type.
    IfArgType { iter: Iter, expected: TypeCode, then: Vec<Op> },
    Next { iter: Iter },
    ReadBasic { iter: Iter, ty: BasicType, into: Place },
    /// Points the inner iterator at the contents of the outer one's
    /// current element.
    Recurse { parent: Iter },
    /// Walks `iter` to its end, storing the element count in `array`.
    CountElements { iter: Iter, array: Place },
    /// Gives `array` a buffer of as many default elements as its count.
    Allocate { array: Place, element: Type },
    ReadVariant { iter: Iter, into: Place },

    // Releasing
    FreeArray { array: Place },
    FreeVariant { value: Place },

    /// Runs `body` once per element of `array`.
    ForEach { array: Place, body: Vec<Op> },
    Call { procedure: String, iter: Option<Iter>, value: Place },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::AppendBasic { .. } => "append-basic",
            Op::OpenStruct { .. } => "open-struct",
            Op::OpenArray { .. } => "open-array",
            Op::RequireBasicVariant { .. } => "require-basic-variant",
            Op::OpenVariant { .. } => "open-variant",
            Op::AppendVariantPayload { .. } => "append-variant-payload",
            Op::CloseContainer { .. } => "close-container",
            Op::IfArgType { .. } => "if-arg-type",
            Op::Next { .. } => "next",
            Op::ReadBasic { .. } => "read-basic",
            Op::Recurse { .. } => "recurse",
            Op::CountElements { .. } => "count-elements",
            Op::Allocate { .. } => "allocate",
            Op::ReadVariant { .. } => "read-variant",
            Op::FreeArray { .. } => "free-array",
            Op::FreeVariant { .. } => "free-variant",
            Op::ForEach { .. } => "for-each",
            Op::Call { .. } => "call",
        }
    }

    /// Whether this op, or any op nested in it, loops over an array.
    pub fn loops(&self) -> bool {
        match self {
            Op::ForEach { .. } => true,
            Op::IfArgType { then, .. } => then.iter().any(Op::loops),
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Pass {
    Encode,
    Decode,
    Release,
}

impl Pass {
    pub fn verb(self) -> &'static str {
        match self {
            Pass::Encode => "pack",
            Pass::Decode => "unpack",
            Pass::Release => "free",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Pass::Encode => "encode",
            Pass::Decode => "decode",
            Pass::Release => "release",
        }
    }
}

/// A generated procedure working on one compound value.
#[derive(Clone, Debug, PartialEq)]
pub struct Procedure {
    pub name: String,
    pub pass: Pass,
    pub ty: Type,
    /// The field name the procedure was generated for; generated type
    /// names derive from it.
    pub field: String,
    pub body: Vec<Op>,
}

/// A generated structure type.
#[derive(Clone, Debug, PartialEq)]
pub struct StructDecl {
    pub field: String,
    pub members: Vec<(String, Type)>,
}

/// A variable bound to its default before a value is decoded into it.
#[derive(Clone, Debug, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub ty: Type,
    pub direction: Direction,
}

/// The four bodies compiled for one attribute.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledAttribute {
    pub declare: Declaration,
    pub encode: Vec<Op>,
    pub decode: Vec<Op>,
    pub release: Vec<Op>,
    /// Procedures this attribute's bodies call, callees first.
    pub procedures: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EntryKind {
    /// Decodes a call, hands it to the user operation, encodes the reply.
    MethodProxy,
    /// Encodes arguments into a signal on `default_path` unless the
    /// caller names a path.
    SignalEmitter { default_path: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntryPoint {
    /// The interface's and member's names joined, unique in the object.
    pub name: String,
    pub interface: String,
    pub member: String,
    pub kind: EntryKind,
    pub locals: Vec<Declaration>,
    pub decode: Vec<Op>,
    pub encode: Vec<Op>,
    pub release: Vec<Op>,
}

/// Everything compiled for one object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Program {
    pub attributes: IndexMap<String, CompiledAttribute>,
    pub procedures: IndexMap<String, Procedure>,
    pub structs: IndexMap<String, StructDecl>,
    pub entry_points: IndexMap<String, EntryPoint>,
}
