//! The marshalling compiler.
//!
//! Every attribute of an object is compiled into four bodies: a
//! declaration binding it to its default, and encode, decode and release
//! bodies over the message iterator primitives. Compound types get named
//! procedures, generated children first so that a procedure only ever
//! calls procedures that precede it.
//!
//! Names derive from the attribute's qualified name. A structure member
//! appends `__member_<k>` and an array element appends `__elem`. Argument
//! names without a double underscore therefore never reach a derived name,
//! and a name that would be reused for a different type is rejected with
//! [`Error::NameCollision`].

use crate::error::{Error, Result};
use crate::model::{Attribute, Direction, Interface, Method, Object, Signal};
use crate::signature::Type;

use log::trace;

pub mod ir;
pub mod machine;

use ir::{
    CompiledAttribute, Declaration, EntryKind, EntryPoint, Iter, Op, Pass, Place, Procedure,
    Program, StructDecl,
};

pub fn member_field(field: &str, ix: usize) -> String {
    format!("{}__member_{}", field, ix)
}

pub fn element_field(field: &str) -> String {
    format!("{}__elem", field)
}

fn kind(ty: &Type) -> &'static str {
    match ty {
        Type::Primitive(_) => "primitive",
        Type::Array(_) => "array",
        Type::Struct(_) => "struct",
        Type::Variant => "variant",
    }
}

/// The name an interface member's proxy or emitter is generated under.
pub fn entry_name(interface: &Interface, member: &str) -> String {
    format!("{}_{}", interface.c_name(), member)
}

/// `pack_<field>_struct`, `unpack_<field>_array`, `free_<field>_variant`...
pub fn procedure_name(pass: Pass, field: &str, ty: &Type) -> String {
    format!("{}_{}_{}", pass.verb(), field, kind(ty))
}

#[derive(Debug, Default)]
pub struct Compiler {
    program: Program,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn into_program(self) -> Program {
        self.program
    }

    /// Compiles every attribute and entry point of `object`.
    pub fn compile_object(object: &Object) -> Result<Program> {
        let mut compiler = Compiler::new();
        for interface in object.interfaces.values() {
            for method in interface.methods.values() {
                compiler.add_method(interface, method)?;
            }
            for signal in interface.signals.values() {
                compiler.add_signal(interface, signal)?;
            }
        }
        Ok(compiler.into_program())
    }

    /// Compiles one attribute, or returns the bodies already compiled
    /// under its qualified name.
    pub fn compile_attribute(&mut self, attr: &Attribute) -> Result<&CompiledAttribute> {
        let name = &attr.qualified_name;
        if let Some(compiled) = self.program.attributes.get(name) {
            if compiled.declare.ty != attr.ty {
                return Err(collision(name, &compiled.declare.ty, &attr.ty));
            }
            trace!("reusing compiled attribute {}", name);
        } else {
            let mut procedures = Vec::new();
            self.add_procedures(&attr.ty, name, &mut procedures)?;
            let place = Place::local(name);
            let compiled = CompiledAttribute {
                declare: Declaration {
                    name: name.clone(),
                    ty: attr.ty.clone(),
                    direction: attr.direction,
                },
                encode: encode_node(&attr.ty, name, &place, Iter::Outer),
                decode: decode_node(&attr.ty, name, &place, Iter::Outer),
                release: release_node(&attr.ty, name, &place),
                procedures,
            };
            trace!("compiled attribute {} of type {}", name, attr.ty);
            self.program.attributes.insert(name.clone(), compiled);
        }
        Ok(&self.program.attributes[name])
    }

    pub fn add_method(&mut self, interface: &Interface, method: &Method) -> Result<()> {
        let mut entry = self.entry_point(interface, &method.name, EntryKind::MethodProxy);
        for attr in &method.attributes {
            let compiled = self.compile_attribute(attr)?;
            if !entry
                .locals
                .iter()
                .any(|local| local.name == compiled.declare.name)
            {
                entry.locals.push(compiled.declare.clone());
            }
            match attr.direction {
                Direction::In => {
                    entry.decode.extend(compiled.decode.iter().cloned());
                    entry.release.extend(compiled.release.iter().cloned());
                }
                Direction::Out => {
                    entry.encode.extend(compiled.encode.iter().cloned());
                }
            }
        }
        self.register(interface, entry)
    }

    pub fn add_signal(&mut self, interface: &Interface, signal: &Signal) -> Result<()> {
        let kind = EntryKind::SignalEmitter {
            default_path: signal.object_path.clone(),
        };
        let mut entry = self.entry_point(interface, &signal.name, kind);
        for attr in &signal.attributes {
            let compiled = self.compile_attribute(attr)?;
            if !entry
                .locals
                .iter()
                .any(|local| local.name == compiled.declare.name)
            {
                entry.locals.push(compiled.declare.clone());
            }
            entry.encode.extend(compiled.encode.iter().cloned());
        }
        self.register(interface, entry)
    }

    fn entry_point(&self, interface: &Interface, member: &str, kind: EntryKind) -> EntryPoint {
        EntryPoint {
            name: entry_name(interface, member),
            interface: interface.name.clone(),
            member: member.to_owned(),
            kind,
            locals: Vec::new(),
            decode: Vec::new(),
            encode: Vec::new(),
            release: Vec::new(),
        }
    }

    fn register(&mut self, interface: &Interface, entry: EntryPoint) -> Result<()> {
        if self.program.entry_points.contains_key(&entry.name) {
            return Err(Error::DuplicateMember {
                interface: interface.name.clone(),
                member: entry.member,
            });
        }
        trace!("entry point {} with {} locals", entry.name, entry.locals.len());
        self.program.entry_points.insert(entry.name.clone(), entry);
        Ok(())
    }

    /// Generates the procedures for `ty` and everything below it, children
    /// first. `used` collects their names in that order.
    fn add_procedures(&mut self, ty: &Type, field: &str, used: &mut Vec<String>) -> Result<()> {
        match ty {
            Type::Primitive(_) => return Ok(()),
            Type::Array(element) => self.add_procedures(element, &element_field(field), used)?,
            Type::Struct(members) => {
                for (ix, member) in members.iter().enumerate() {
                    self.add_procedures(member, &member_field(field, ix), used)?;
                }
                if let Some(decl) = self.program.structs.get(field) {
                    if decl.members.iter().map(|(_, member)| member).ne(members.iter()) {
                        let existing = Type::Struct(
                            decl.members.iter().map(|(_, member)| member.clone()).collect(),
                        );
                        return Err(collision(field, &existing, ty));
                    }
                } else {
                    let members = members
                        .iter()
                        .enumerate()
                        .map(|(ix, member)| (member_field(field, ix), member.clone()))
                        .collect();
                    self.program.structs.insert(
                        field.to_owned(),
                        StructDecl {
                            field: field.to_owned(),
                            members,
                        },
                    );
                }
            }
            Type::Variant => {}
        }

        for pass in [Pass::Encode, Pass::Decode, Pass::Release].iter().copied() {
            if pass == Pass::Release && !ty.needs_release() {
                continue;
            }
            let name = procedure_name(pass, field, ty);
            if !used.contains(&name) {
                used.push(name.clone());
            }
            if let Some(existing) = self.program.procedures.get(&name) {
                if existing.ty != *ty {
                    return Err(collision(&name, &existing.ty, ty));
                }
                trace!("reusing procedure {}", name);
                continue;
            }
            trace!("generated procedure {}", name);
            let procedure = Procedure {
                name: name.clone(),
                pass,
                ty: ty.clone(),
                field: field.to_owned(),
                body: procedure_body(pass, ty, field),
            };
            self.program.procedures.insert(name, procedure);
        }
        Ok(())
    }
}

fn collision(name: &str, first: &Type, second: &Type) -> Error {
    Error::NameCollision {
        name: name.to_owned(),
        first: first.to_string(),
        second: second.to_string(),
    }
}

/// Appends the value at `place` to `iter`.
fn encode_node(ty: &Type, field: &str, place: &Place, iter: Iter) -> Vec<Op> {
    match ty {
        Type::Primitive(basic) => vec![Op::AppendBasic {
            iter,
            ty: *basic,
            value: place.clone(),
        }],
        Type::Array(_) | Type::Struct(_) | Type::Variant => vec![Op::Call {
            procedure: procedure_name(Pass::Encode, field, ty),
            iter: Some(iter),
            value: place.clone(),
        }],
    }
}

/// Reads the current element of `iter` into `place` if its type matches,
/// then steps past it either way.
fn decode_node(ty: &Type, field: &str, place: &Place, iter: Iter) -> Vec<Op> {
    let read = match ty {
        Type::Primitive(basic) => Op::ReadBasic {
            iter,
            ty: *basic,
            into: place.clone(),
        },
        Type::Array(_) | Type::Struct(_) | Type::Variant => Op::Call {
            procedure: procedure_name(Pass::Decode, field, ty),
            iter: Some(iter),
            value: place.clone(),
        },
    };
    vec![
        Op::IfArgType {
            iter,
            expected: ty.type_code(),
            then: vec![read],
        },
        Op::Next { iter },
    ]
}

fn release_node(ty: &Type, field: &str, place: &Place) -> Vec<Op> {
    if !ty.needs_release() {
        return Vec::new();
    }
    vec![Op::Call {
        procedure: procedure_name(Pass::Release, field, ty),
        iter: None,
        value: place.clone(),
    }]
}

fn procedure_body(pass: Pass, ty: &Type, field: &str) -> Vec<Op> {
    let value = Place::param();
    match (pass, ty) {
        (_, Type::Primitive(_)) => Vec::new(),

        (Pass::Encode, Type::Struct(members)) => {
            let mut body = vec![Op::OpenStruct { parent: Iter::Outer }];
            for (ix, member) in members.iter().enumerate() {
                body.extend(encode_node(
                    member,
                    &member_field(field, ix),
                    &value.member(ix),
                    Iter::Inner,
                ));
            }
            body.push(Op::CloseContainer { parent: Iter::Outer });
            body
        }
        (Pass::Encode, Type::Array(element)) => vec![
            Op::OpenArray {
                parent: Iter::Outer,
                element: (**element).clone(),
            },
            Op::ForEach {
                array: value.clone(),
                body: encode_node(element, &element_field(field), &value.element(), Iter::Inner),
            },
            Op::CloseContainer { parent: Iter::Outer },
        ],
        (Pass::Encode, Type::Variant) => vec![
            Op::RequireBasicVariant {
                value: value.clone(),
            },
            Op::OpenVariant {
                parent: Iter::Outer,
                value: value.clone(),
            },
            Op::AppendVariantPayload {
                iter: Iter::Inner,
                value,
            },
            Op::CloseContainer { parent: Iter::Outer },
        ],

        (Pass::Decode, Type::Struct(members)) => {
            let mut body = vec![Op::Recurse { parent: Iter::Outer }];
            for (ix, member) in members.iter().enumerate() {
                body.extend(decode_node(
                    member,
                    &member_field(field, ix),
                    &value.member(ix),
                    Iter::Inner,
                ));
            }
            body
        }
        // Counted on a first walk, allocated, then decoded on a second.
        (Pass::Decode, Type::Array(element)) => vec![
            Op::Recurse { parent: Iter::Outer },
            Op::CountElements {
                iter: Iter::Inner,
                array: value.clone(),
            },
            Op::Allocate {
                array: value.clone(),
                element: (**element).clone(),
            },
            Op::Recurse { parent: Iter::Outer },
            Op::ForEach {
                array: value.clone(),
                body: decode_node(element, &element_field(field), &value.element(), Iter::Inner),
            },
        ],
        (Pass::Decode, Type::Variant) => vec![
            Op::Recurse { parent: Iter::Outer },
            Op::ReadVariant {
                iter: Iter::Inner,
                into: value,
            },
        ],

        (Pass::Release, Type::Struct(members)) => members
            .iter()
            .enumerate()
            .flat_map(|(ix, member)| {
                release_node(member, &member_field(field, ix), &value.member(ix))
            })
            .collect(),
        (Pass::Release, Type::Array(element)) => {
            let mut body = Vec::new();
            if element.needs_release() {
                body.push(Op::ForEach {
                    array: value.clone(),
                    body: release_node(element, &element_field(field), &value.element()),
                });
            }
            body.push(Op::FreeArray { array: value });
            body
        }
        (Pass::Release, Type::Variant) => vec![Op::FreeVariant { value }],
    }
}
