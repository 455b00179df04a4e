//! The declarations an introspection document describes.

use crate::signature::Type;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::In
    }
}

/// One argument of a method or signal.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    /// The argument name as declared.
    pub name: String,
    /// Unique across the whole object: interface, member and argument
    /// names joined together.
    pub qualified_name: String,
    pub direction: Direction,
    pub ty: Type,
}

impl Attribute {
    pub fn new(interface: &str, member: &str, name: &str, direction: Direction, ty: Type) -> Self {
        Self {
            name: name.to_owned(),
            qualified_name: qualify(interface, member, name),
            direction,
            ty,
        }
    }
}

/// `org.example.Foo` becomes `org_example_Foo`.
pub fn c_name(interface: &str) -> String {
    interface.replace('.', "_")
}

pub fn qualify(interface: &str, member: &str, argument: &str) -> String {
    format!("{}_{}_{}", c_name(interface), member, argument)
}

#[derive(Clone, Debug, PartialEq)]
pub struct Method {
    pub name: String,
    pub interface: String,
    pub attributes: Vec<Attribute>,
}

impl Method {
    pub fn inputs(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes
            .iter()
            .filter(|attr| attr.direction == Direction::In)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes
            .iter()
            .filter(|attr| attr.direction == Direction::Out)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Signal {
    pub name: String,
    pub interface: String,
    /// Path the signal is emitted on when the caller gives none.
    pub object_path: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Interface {
    pub name: String,
    pub methods: IndexMap<String, Method>,
    pub signals: IndexMap<String, Signal>,
}

impl Interface {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            methods: IndexMap::new(),
            signals: IndexMap::new(),
        }
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.methods.contains_key(name) || self.signals.contains_key(name)
    }

    pub fn c_name(&self) -> String {
        c_name(&self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Object {
    pub path: String,
    pub interfaces: IndexMap<String, Interface>,
}

impl Object {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_owned(),
            interfaces: IndexMap::new(),
        }
    }

    /// `/org/example/Foo` becomes `org_example_Foo`; the root object is
    /// named `root`.
    pub fn c_name(&self) -> String {
        let name = self.path.trim_start_matches('/').replace('/', "_");
        if name.is_empty() {
            "root".to_owned()
        } else {
            name
        }
    }

    /// Every attribute of every member, in declaration order.
    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.interfaces.values().flat_map(|interface| {
            interface
                .methods
                .values()
                .flat_map(|method| method.attributes.iter())
                .chain(
                    interface
                        .signals
                        .values()
                        .flat_map(|signal| signal.attributes.iter()),
                )
        })
    }
}
