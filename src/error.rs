use crate::signature::TypeCode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Bad signature {signature:?}: {reason}")]
    BadSignature {
        signature: String,
        reason: &'static str,
    },
    #[error("Variant payload tagged {0} is not a basic type")]
    VariantNotBasic(TypeCode),
    #[error("Variant payload does not match its tag {0}")]
    VariantPayload(TypeCode),
    #[error("Expected an element of type {expected}, found {found}")]
    TypeMismatch { expected: TypeCode, found: TypeCode },

    #[error("Interface {0} declared twice on one object")]
    DuplicateInterface(String),
    #[error("Member {member} declared twice in interface {interface}")]
    DuplicateMember { interface: String, member: String },
    #[error("Event {0} arrived outside of its enclosing declaration")]
    UnexpectedEvent(&'static str),

    #[error("Index {0} out of bounds")]
    IndexOutOfBounds(usize),
    #[error("Signature exhausted")]
    SignatureExhausted,
    #[error("Container opened at depth {0} was never closed")]
    UnbalancedContainer(usize),
    #[error("Element of type {0} is not a container")]
    NotAContainer(TypeCode),
    #[error("Element of type {0} is not a basic value")]
    NotABasicValue(TypeCode),
    #[error("Array of {0:?} cannot hold an element of type {1:?}")]
    MismatchSignature(String, String),
    #[error("Array element at offset {0} occupies no bytes")]
    StalledArray(usize),
    #[error("Values nested more than {0} containers deep")]
    NestingTooDeep(usize),
    #[error("Invalid boolean value {0}")]
    InvalidBoolValue(u32),
    #[error("String is not valid UTF-8")]
    Utf8,

    #[error("Operation {0} cannot run in the {1} pass")]
    InvalidOperation(&'static str, &'static str),
    #[error("No procedure named {0}")]
    UnknownProcedure(String),
    #[error("Place {0} does not hold a value of the expected shape")]
    PlaceNotFound(String),
    #[error("Array claims {len} elements but holds {held}")]
    ArrayOverrun { len: usize, held: usize },

    #[error("Generated name {name} would stand for both {first} and {second}")]
    NameCollision {
        name: String,
        first: String,
        second: String,
    },

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::Utf8
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
