/// What the argument tables call each argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgumentNaming {
    /// The name the argument was declared with.
    Declared,
    /// The argument's qualified name, unique across the object.
    Qualified,
}

pub trait EmitterPolicy: Clone {
    /// Prefix of the runtime library's types and of every generated
    /// procedure.
    fn prefix(&self) -> &str;
    fn argument_naming(&self) -> ArgumentNaming;
}

#[derive(Clone, Debug)]
pub struct DefaultEmitterPolicy;

impl EmitterPolicy for DefaultEmitterPolicy {
    fn prefix(&self) -> &str {
        "cdbus"
    }

    fn argument_naming(&self) -> ArgumentNaming {
        ArgumentNaming::Declared
    }
}

#[derive(Clone, Debug)]
pub struct QualifiedTableEmitterPolicy;

impl EmitterPolicy for QualifiedTableEmitterPolicy {
    fn prefix(&self) -> &str {
        "cdbus"
    }

    fn argument_naming(&self) -> ArgumentNaming {
        ArgumentNaming::Qualified
    }
}
