//! Runs compiled programs against the in-memory wire layer.
//!
//! [`Machine`] executes the same op sequences the C renderer prints, over
//! [`Native`] values standing in for the generated C variables. It counts
//! the buffers decode allocates and release frees, and keeps a log of the
//! elements decode skipped, so generated code can be checked end to end.

use crate::error::{Error, Result};
use crate::message::Message;
use crate::primitives::BasicValue;
use crate::signature::{Type, TypeCode};
use crate::wire::{Container, WireReader, WireWriter};

use super::ir::{Declaration, EntryKind, EntryPoint, Iter, Op, Pass, Place, Program, Root, Step};

use indexmap::IndexMap;
use log::{trace, warn};

/// The value of one generated variable.
#[derive(Clone, Debug, PartialEq)]
pub enum Native {
    Basic(BasicValue),
    /// A buffer of elements and its count. `items` is `None` until the
    /// buffer is allocated.
    Array {
        items: Option<Vec<Native>>,
        len: usize,
    },
    Struct(Vec<Native>),
    /// A payload cell and the type tag of what it holds.
    Variant {
        tag: TypeCode,
        payload: Option<BasicValue>,
    },
}

impl Native {
    /// The value a variable of type `ty` is declared with.
    pub fn declare(ty: &Type) -> Native {
        match ty {
            Type::Primitive(basic) => Native::Basic(BasicValue::default_for(*basic)),
            Type::Array(_) => Native::Array {
                items: None,
                len: 0,
            },
            Type::Struct(members) => Native::Struct(members.iter().map(Native::declare).collect()),
            Type::Variant => Native::Variant {
                tag: TypeCode::Invalid,
                payload: None,
            },
        }
    }

    pub fn array(items: Vec<Native>) -> Native {
        let len = items.len();
        Native::Array {
            items: Some(items),
            len,
        }
    }

    pub fn variant(payload: BasicValue) -> Native {
        Native::Variant {
            tag: payload.type_code(),
            payload: Some(payload),
        }
    }

    pub fn as_basic(&self) -> Option<&BasicValue> {
        match self {
            Native::Basic(value) => Some(value),
            _ => None,
        }
    }

    /// The counted elements of an allocated array.
    pub fn items(&self) -> Option<&[Native]> {
        match self {
            Native::Array {
                items: Some(items),
                len,
            } => items.get(..*len),
            _ => None,
        }
    }
}

impl From<BasicValue> for Native {
    fn from(value: BasicValue) -> Self {
        Native::Basic(value)
    }
}

/// The variables of one entry point, by name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Locals(IndexMap<String, Native>);

impl Locals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every declaration bound to its default.
    pub fn declare(declarations: &[Declaration]) -> Self {
        Locals(
            declarations
                .iter()
                .map(|decl| (decl.name.clone(), Native::declare(&decl.ty)))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&Native> {
        self.0.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Native> {
        self.0.get_mut(name)
    }

    pub fn set(&mut self, name: &str, value: Native) {
        self.0.insert(name.to_owned(), value);
    }
}

/// What a method proxy sends back.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Return(Message),
    Error { name: &'static str, message: String },
}

pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

/// A signal built by an emitter.
#[derive(Clone, Debug, PartialEq)]
pub struct Emission {
    pub path: String,
    pub interface: String,
    pub member: String,
    pub message: Message,
}

/// The root a scope resolves places against: an entry point's variables,
/// or the value a procedure was called on.
enum Scope<'a> {
    Locals(&'a mut Locals),
    Param(&'a mut Native),
}

impl Scope<'_> {
    fn resolve(&mut self, place: &Place, index: Option<usize>) -> Result<&mut Native> {
        let missing = || Error::PlaceNotFound(place.to_string());
        let mut target = match (&place.root, self) {
            (Root::Param, Scope::Param(value)) => &mut **value,
            (Root::Local(name), Scope::Locals(locals)) => {
                locals.get_mut(name).ok_or_else(missing)?
            }
            _ => return Err(missing()),
        };
        for step in &place.path {
            target = match (step, target) {
                (Step::Member(ix), Native::Struct(members)) => {
                    members.get_mut(*ix).ok_or_else(missing)?
                }
                (
                    Step::Element,
                    Native::Array {
                        items: Some(items), ..
                    },
                ) => {
                    let ix = index.ok_or_else(missing)?;
                    items.get_mut(ix).ok_or_else(missing)?
                }
                _ => return Err(missing()),
            };
        }
        Ok(target)
    }
}

/// The two iterators a decoding scope sees.
struct Cursors<'r, 'm> {
    outer: &'r mut WireReader<'m>,
    inner: Option<WireReader<'m>>,
}

impl<'r, 'm> Cursors<'r, 'm> {
    fn get(&mut self, iter: Iter, op: &Op) -> Result<&mut WireReader<'m>> {
        match iter {
            Iter::Outer => Ok(&mut *self.outer),
            Iter::Inner => self
                .inner
                .as_mut()
                .ok_or_else(|| Error::InvalidOperation(op.name(), Pass::Decode.label())),
        }
    }
}

fn array_len(native: &Native, place: &Place) -> Result<usize> {
    match native {
        Native::Array { items, len } => {
            let held = items.as_ref().map_or(0, Vec::len);
            if *len > held {
                Err(Error::ArrayOverrun { len: *len, held })
            } else {
                Ok(*len)
            }
        }
        _ => Err(Error::PlaceNotFound(place.to_string())),
    }
}

fn variant_tag(native: &Native, place: &Place) -> Result<TypeCode> {
    match native {
        Native::Variant { tag, .. } => Ok(*tag),
        _ => Err(Error::PlaceNotFound(place.to_string())),
    }
}

pub struct Machine<'p> {
    program: &'p Program,
    allocations: usize,
    releases: usize,
    skipped: Vec<Error>,
}

impl<'p> Machine<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            allocations: 0,
            releases: 0,
            skipped: Vec::new(),
        }
    }

    /// Buffers allocated by decoding: array buffers and variant cells.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    pub fn releases(&self) -> usize {
        self.releases
    }

    /// Elements decode stepped past without reading, in order.
    pub fn skipped(&self) -> &[Error] {
        &self.skipped
    }

    fn procedure(&self, name: &str, pass: Pass) -> Result<&'p [Op]> {
        let program: &'p Program = self.program;
        match program.procedures.get(name) {
            Some(procedure) if procedure.pass == pass => Ok(procedure.body.as_slice()),
            _ => Err(Error::UnknownProcedure(name.to_owned())),
        }
    }

    fn attribute(&self, name: &str, pass: Pass) -> Result<&'p [Op]> {
        let program: &'p Program = self.program;
        let compiled = program
            .attributes
            .get(name)
            .ok_or_else(|| Error::UnknownProcedure(name.to_owned()))?;
        Ok(match pass {
            Pass::Encode => compiled.encode.as_slice(),
            Pass::Decode => compiled.decode.as_slice(),
            Pass::Release => compiled.release.as_slice(),
        })
    }

    fn entry(&self, name: &str) -> Result<&'p EntryPoint> {
        let program: &'p Program = self.program;
        program
            .entry_points
            .get(name)
            .ok_or_else(|| Error::UnknownProcedure(name.to_owned()))
    }

    pub fn encode_attribute(
        &mut self,
        name: &str,
        locals: &mut Locals,
        writer: &mut WireWriter,
    ) -> Result<()> {
        let body = self.attribute(name, Pass::Encode)?;
        self.encode(body, &mut Scope::Locals(locals), None, writer)
    }

    pub fn decode_attribute(
        &mut self,
        name: &str,
        locals: &mut Locals,
        reader: &mut WireReader<'_>,
    ) -> Result<()> {
        let body = self.attribute(name, Pass::Decode)?;
        let mut cursors = Cursors {
            outer: reader,
            inner: None,
        };
        self.decode(body, &mut Scope::Locals(locals), None, &mut cursors)
    }

    pub fn release_attribute(&mut self, name: &str, locals: &mut Locals) -> Result<()> {
        let body = self.attribute(name, Pass::Release)?;
        self.release(body, &mut Scope::Locals(locals), None)
    }

    /// Runs the method proxy `entry` on a call: decodes the inputs, hands
    /// them to `operation`, encodes the outputs into the reply and releases
    /// the inputs. A failing operation, or outputs that fail to encode, are
    /// answered with an error reply.
    pub fn dispatch<F>(&mut self, entry: &str, call: &Message, operation: F) -> Result<Reply>
    where
        F: FnOnce(&mut Locals) -> Result<()>,
    {
        let entry = self.entry(entry)?;
        if entry.kind != EntryKind::MethodProxy {
            return Err(Error::UnknownProcedure(entry.name.clone()));
        }
        let mut locals = Locals::declare(&entry.locals);
        let mut reader = WireReader::new(call);
        let mut cursors = Cursors {
            outer: &mut reader,
            inner: None,
        };
        self.decode(
            &entry.decode,
            &mut Scope::Locals(&mut locals),
            None,
            &mut cursors,
        )?;

        let reply = operation(&mut locals).and_then(|()| {
            let mut writer = WireWriter::new();
            self.encode(
                &entry.encode,
                &mut Scope::Locals(&mut locals),
                None,
                &mut writer,
            )?;
            writer.finish()
        });
        self.release(&entry.release, &mut Scope::Locals(&mut locals), None)?;
        Ok(match reply {
            Ok(message) => Reply::Return(message),
            Err(err) => {
                warn!("{} failed: {}", entry.name, err);
                Reply::Error {
                    name: ERROR_FAILED,
                    message: "method_call failed".to_owned(),
                }
            }
        })
    }

    /// Runs the signal emitter `entry` over `locals`, on `path` or the
    /// signal's default path.
    pub fn emit_signal(
        &mut self,
        entry: &str,
        path: Option<&str>,
        locals: &mut Locals,
    ) -> Result<Emission> {
        let entry = self.entry(entry)?;
        let default_path = match &entry.kind {
            EntryKind::SignalEmitter { default_path } => default_path,
            EntryKind::MethodProxy => return Err(Error::UnknownProcedure(entry.name.clone())),
        };
        let mut writer = WireWriter::new();
        self.encode(&entry.encode, &mut Scope::Locals(locals), None, &mut writer)?;
        Ok(Emission {
            path: path.unwrap_or(default_path.as_str()).to_owned(),
            interface: entry.interface.clone(),
            member: entry.member.clone(),
            message: writer.finish()?,
        })
    }

    fn encode(
        &mut self,
        ops: &[Op],
        scope: &mut Scope<'_>,
        index: Option<usize>,
        writer: &mut WireWriter,
    ) -> Result<()> {
        for op in ops {
            match op {
                Op::AppendBasic { ty, value, .. } => match scope.resolve(value, index)? {
                    Native::Basic(basic) if basic.basic_type() == *ty => {
                        writer.append_basic(basic)?
                    }
                    _ => return Err(Error::PlaceNotFound(value.to_string())),
                },
                Op::OpenStruct { .. } => writer.open_container(Container::Struct)?,
                Op::OpenArray { element, .. } => {
                    writer.open_container(Container::Array(element.signature()))?
                }
                Op::RequireBasicVariant { value } => {
                    let tag = variant_tag(scope.resolve(value, index)?, value)?;
                    if !tag.is_basic() {
                        return Err(Error::VariantNotBasic(tag));
                    }
                }
                Op::OpenVariant { value, .. } => {
                    let tag = variant_tag(scope.resolve(value, index)?, value)?;
                    let code = tag.code().ok_or(Error::VariantNotBasic(tag))?;
                    writer.open_container(Container::Variant((code as char).to_string()))?;
                }
                Op::AppendVariantPayload { value, .. } => match scope.resolve(value, index)? {
                    Native::Variant {
                        tag,
                        payload: Some(payload),
                    } if payload.type_code() == *tag => writer.append_basic(payload)?,
                    Native::Variant { tag, .. } => return Err(Error::VariantPayload(*tag)),
                    _ => return Err(Error::PlaceNotFound(value.to_string())),
                },
                Op::CloseContainer { .. } => writer.close_container()?,
                Op::ForEach { array, body } => {
                    let len = array_len(scope.resolve(array, index)?, array)?;
                    for ix in 0..len {
                        self.encode(body, scope, Some(ix), writer)?;
                    }
                }
                Op::Call {
                    procedure, value, ..
                } => {
                    let body = self.procedure(procedure, Pass::Encode)?;
                    let target = scope.resolve(value, index)?;
                    self.encode(body, &mut Scope::Param(target), None, writer)?;
                }
                other => {
                    return Err(Error::InvalidOperation(
                        other.name(),
                        Pass::Encode.label(),
                    ))
                }
            }
        }
        Ok(())
    }

    fn decode(
        &mut self,
        ops: &[Op],
        scope: &mut Scope<'_>,
        index: Option<usize>,
        cursors: &mut Cursors<'_, '_>,
    ) -> Result<()> {
        for op in ops {
            match op {
                Op::IfArgType {
                    iter,
                    expected,
                    then,
                } => {
                    let found = cursors.get(*iter, op)?.arg_type()?;
                    if found == *expected {
                        self.decode(then, scope, index, cursors)?;
                    } else {
                        warn!("expected {}, found {}: keeping the default", expected, found);
                        self.skipped.push(Error::TypeMismatch {
                            expected: *expected,
                            found,
                        });
                    }
                }
                Op::Next { iter } => {
                    cursors.get(*iter, op)?.next()?;
                }
                Op::ReadBasic { iter, into, .. } => {
                    let value = cursors.get(*iter, op)?.get_basic()?;
                    *scope.resolve(into, index)? = Native::Basic(value);
                }
                Op::Recurse { parent } => {
                    let inner = cursors.get(*parent, op)?.recurse()?;
                    cursors.inner = Some(inner);
                }
                Op::CountElements { iter, array } => {
                    let reader = cursors.get(*iter, op)?;
                    let mut count = 0;
                    while reader.arg_type()? != TypeCode::Invalid {
                        count += 1;
                        reader.next()?;
                    }
                    match scope.resolve(array, index)? {
                        Native::Array { len, .. } => *len = count,
                        _ => return Err(Error::PlaceNotFound(array.to_string())),
                    }
                }
                Op::Allocate { array, element } => match scope.resolve(array, index)? {
                    Native::Array { items, len } => {
                        trace!("allocating {} elements of {} for {}", len, element, array);
                        *items = Some(vec![Native::declare(element); *len]);
                        self.allocations += 1;
                    }
                    _ => return Err(Error::PlaceNotFound(array.to_string())),
                },
                Op::ReadVariant { iter, into } => {
                    let reader = cursors.get(*iter, op)?;
                    let tag = reader.arg_type()?;
                    if tag.is_basic() {
                        let payload = reader.get_basic()?;
                        *scope.resolve(into, index)? = Native::Variant {
                            tag,
                            payload: Some(payload),
                        };
                        self.allocations += 1;
                    } else {
                        warn!("variant of {} left empty", tag);
                        self.skipped.push(Error::VariantNotBasic(tag));
                    }
                }
                Op::ForEach { array, body } => {
                    let len = array_len(scope.resolve(array, index)?, array)?;
                    for ix in 0..len {
                        self.decode(body, scope, Some(ix), cursors)?;
                    }
                }
                Op::Call {
                    procedure,
                    iter: Some(iter),
                    value,
                } => {
                    let body = self.procedure(procedure, Pass::Decode)?;
                    let target = scope.resolve(value, index)?;
                    let mut callee = Cursors {
                        outer: cursors.get(*iter, op)?,
                        inner: None,
                    };
                    self.decode(body, &mut Scope::Param(target), None, &mut callee)?;
                }
                other => {
                    return Err(Error::InvalidOperation(
                        other.name(),
                        Pass::Decode.label(),
                    ))
                }
            }
        }
        Ok(())
    }

    fn release(&mut self, ops: &[Op], scope: &mut Scope<'_>, index: Option<usize>) -> Result<()> {
        for op in ops {
            match op {
                Op::FreeArray { array } => match scope.resolve(array, index)? {
                    Native::Array { items, len } => {
                        if items.take().is_some() {
                            self.releases += 1;
                        }
                        *len = 0;
                    }
                    _ => return Err(Error::PlaceNotFound(array.to_string())),
                },
                Op::FreeVariant { value } => match scope.resolve(value, index)? {
                    Native::Variant { tag, payload } => {
                        if payload.take().is_some() {
                            self.releases += 1;
                        }
                        *tag = TypeCode::Invalid;
                    }
                    _ => return Err(Error::PlaceNotFound(value.to_string())),
                },
                Op::ForEach { array, body } => {
                    let len = array_len(scope.resolve(array, index)?, array)?;
                    for ix in 0..len {
                        self.release(body, scope, Some(ix))?;
                    }
                }
                Op::Call {
                    procedure, value, ..
                } => {
                    let body = self.procedure(procedure, Pass::Release)?;
                    let target = scope.resolve(value, index)?;
                    self.release(body, &mut Scope::Param(target), None)?;
                }
                other => {
                    return Err(Error::InvalidOperation(
                        other.name(),
                        Pass::Release.label(),
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::tests::{arg, assemble, calculator_events, single_method};
    use crate::codegen::Compiler;
    use crate::model::{Attribute, Direction};
    use crate::signature::{parse, BasicType};
    use test_log::test;

    fn compile(attrs: &[(&str, &str)]) -> Result<Program> {
        let mut compiler = Compiler::new();
        for (name, signature) in attrs {
            let attr = Attribute::new("t.T", "M", name, Direction::In, parse(signature)?);
            compiler.compile_attribute(&attr)?;
        }
        Ok(compiler.into_program())
    }

    fn declared(program: &Program) -> Locals {
        let declarations = program
            .attributes
            .values()
            .map(|compiled| compiled.declare.clone())
            .collect::<Vec<_>>();
        Locals::declare(&declarations)
    }

    fn int(value: i32) -> Native {
        Native::Basic(BasicValue::Int32(value))
    }

    fn string(value: &str) -> Native {
        Native::Basic(BasicValue::String(Some(value.to_owned())))
    }

    #[test]
    fn defaults() -> Result<()> {
        assert_eq!(
            Native::declare(&parse("s")?),
            Native::Basic(BasicValue::String(None))
        );
        assert_eq!(
            Native::declare(&parse("(yai)")?),
            Native::Struct(vec![
                Native::Basic(BasicValue::Byte(0)),
                Native::Array {
                    items: None,
                    len: 0
                },
            ])
        );
        assert_eq!(
            Native::declare(&parse("v")?),
            Native::Variant {
                tag: TypeCode::Invalid,
                payload: None
            }
        );
        Ok(())
    }

    #[test]
    fn array_decode_allocates_exactly_its_count() -> Result<()> {
        let program = compile(&[("xs", "ai")])?;
        let mut writer = WireWriter::new();
        writer.open_container(Container::Array("i".to_owned()))?;
        for value in &[4, 8, 15, 16, 23] {
            writer.append_basic(&BasicValue::Int32(*value))?;
        }
        writer.close_container()?;
        let message = writer.finish()?;

        let mut machine = Machine::new(&program);
        let mut locals = declared(&program);
        let mut reader = WireReader::new(&message);
        machine.decode_attribute("t_T_M_xs", &mut locals, &mut reader)?;

        let xs = locals.get("t_T_M_xs").ok_or(Error::SignatureExhausted)?;
        assert_eq!(
            xs,
            &Native::array(vec![int(4), int(8), int(15), int(16), int(23)])
        );
        assert_eq!(machine.allocations(), 1);
        assert!(machine.skipped().is_empty());

        machine.release_attribute("t_T_M_xs", &mut locals)?;
        assert_eq!(machine.releases(), 1);
        assert_eq!(
            locals.get("t_T_M_xs"),
            Some(&Native::Array {
                items: None,
                len: 0
            })
        );
        Ok(())
    }

    #[test]
    fn empty_array_counts_zero() -> Result<()> {
        let program = compile(&[("xs", "as")])?;
        let mut writer = WireWriter::new();
        writer.open_container(Container::Array("s".to_owned()))?;
        writer.close_container()?;
        let message = writer.finish()?;

        let mut machine = Machine::new(&program);
        let mut locals = declared(&program);
        machine.decode_attribute("t_T_M_xs", &mut locals, &mut WireReader::new(&message))?;
        assert_eq!(locals.get("t_T_M_xs"), Some(&Native::array(Vec::new())));
        Ok(())
    }

    #[test]
    fn nested_structures_round_trip() -> Result<()> {
        let program = compile(&[("rows", "a(sav)")])?;
        let rows = Native::array(vec![
            Native::Struct(vec![
                string("first"),
                Native::array(vec![
                    Native::variant(BasicValue::Uint64(1)),
                    Native::variant(BasicValue::String(Some("one".to_owned()))),
                ]),
            ]),
            Native::Struct(vec![string("second"), Native::array(Vec::new())]),
        ]);

        let mut machine = Machine::new(&program);
        let mut locals = Locals::new();
        locals.set("t_T_M_rows", rows.clone());
        let mut writer = WireWriter::new();
        machine.encode_attribute("t_T_M_rows", &mut locals, &mut writer)?;
        let message = writer.finish()?;
        assert_eq!(message.signature_str(), "a(sav)");

        let mut decoded = declared(&program);
        machine.decode_attribute("t_T_M_rows", &mut decoded, &mut WireReader::new(&message))?;
        assert_eq!(decoded.get("t_T_M_rows"), Some(&rows));
        // The outer buffer, two inner buffers and two variant cells.
        assert_eq!(machine.allocations(), 5);

        machine.release_attribute("t_T_M_rows", &mut decoded)?;
        assert_eq!(machine.releases(), machine.allocations());
        Ok(())
    }

    #[test]
    fn variant_keeps_tag_and_value() -> Result<()> {
        let program = compile(&[("v", "v")])?;
        let mut machine = Machine::new(&program);
        let mut locals = Locals::new();
        locals.set("t_T_M_v", Native::variant(BasicValue::Int16(-12)));
        let mut writer = WireWriter::new();
        machine.encode_attribute("t_T_M_v", &mut locals, &mut writer)?;
        let message = writer.finish()?;

        let mut decoded = declared(&program);
        machine.decode_attribute("t_T_M_v", &mut decoded, &mut WireReader::new(&message))?;
        assert_eq!(
            decoded.get("t_T_M_v"),
            Some(&Native::Variant {
                tag: TypeCode::Basic(BasicType::Int16),
                payload: Some(BasicValue::Int16(-12)),
            })
        );
        Ok(())
    }

    #[test]
    fn compound_variant_fails_to_encode() -> Result<()> {
        let program = compile(&[("v", "v")])?;
        let mut machine = Machine::new(&program);
        let mut locals = Locals::new();
        locals.set(
            "t_T_M_v",
            Native::Variant {
                tag: TypeCode::Array,
                payload: None,
            },
        );
        let mut writer = WireWriter::new();
        assert_eq!(
            machine.encode_attribute("t_T_M_v", &mut locals, &mut writer),
            Err(Error::VariantNotBasic(TypeCode::Array))
        );
        Ok(())
    }

    #[test]
    fn compound_variant_is_skipped_on_decode() -> Result<()> {
        let program = compile(&[("v", "v"), ("n", "u")])?;
        let mut writer = WireWriter::new();
        writer.open_container(Container::Variant("ai".to_owned()))?;
        writer.open_container(Container::Array("i".to_owned()))?;
        writer.append_basic(&BasicValue::Int32(1))?;
        writer.close_container()?;
        writer.close_container()?;
        writer.append_basic(&BasicValue::Uint32(77))?;
        let message = writer.finish()?;

        let mut machine = Machine::new(&program);
        let mut locals = declared(&program);
        let mut reader = WireReader::new(&message);
        machine.decode_attribute("t_T_M_v", &mut locals, &mut reader)?;
        machine.decode_attribute("t_T_M_n", &mut locals, &mut reader)?;
        assert_eq!(
            locals.get("t_T_M_v"),
            Some(&Native::declare(&Type::Variant))
        );
        assert_eq!(
            locals.get("t_T_M_n"),
            Some(&Native::Basic(BasicValue::Uint32(77)))
        );
        assert_eq!(machine.skipped(), &[Error::VariantNotBasic(TypeCode::Array)]);
        Ok(())
    }

    #[test]
    fn mismatched_element_keeps_default_and_moves_on() -> Result<()> {
        let program = compile(&[("a", "i"), ("b", "i")])?;
        let mut writer = WireWriter::new();
        writer.append_basic(&BasicValue::String(Some("surprise".to_owned())))?;
        writer.append_basic(&BasicValue::Int32(42))?;
        let message = writer.finish()?;

        let mut machine = Machine::new(&program);
        let mut locals = declared(&program);
        let mut reader = WireReader::new(&message);
        machine.decode_attribute("t_T_M_a", &mut locals, &mut reader)?;
        machine.decode_attribute("t_T_M_b", &mut locals, &mut reader)?;
        assert_eq!(locals.get("t_T_M_a"), Some(&int(0)));
        assert_eq!(locals.get("t_T_M_b"), Some(&int(42)));
        assert_eq!(
            machine.skipped(),
            &[Error::TypeMismatch {
                expected: TypeCode::Basic(BasicType::Int32),
                found: TypeCode::Basic(BasicType::String),
            }]
        );
        Ok(())
    }

    #[test]
    fn mismatched_compounds_keep_defaults_and_move_on() -> Result<()> {
        let program = compile(&[("p", "(ii)"), ("xs", "ai"), ("n", "u")])?;
        let mut writer = WireWriter::new();
        writer.append_basic(&BasicValue::String(Some("one".to_owned())))?;
        writer.append_basic(&BasicValue::String(Some("two".to_owned())))?;
        writer.append_basic(&BasicValue::Uint32(7))?;
        let message = writer.finish()?;

        let mut machine = Machine::new(&program);
        let mut locals = declared(&program);
        let mut reader = WireReader::new(&message);
        for name in &["t_T_M_p", "t_T_M_xs", "t_T_M_n"] {
            machine.decode_attribute(name, &mut locals, &mut reader)?;
        }
        assert_eq!(locals.get("t_T_M_p"), Some(&Native::Struct(vec![int(0), int(0)])));
        assert_eq!(locals.get("t_T_M_xs"), Some(&Native::declare(&parse("ai")?)));
        assert_eq!(locals.get("t_T_M_n"), Some(&Native::Basic(BasicValue::Uint32(7))));
        let found = TypeCode::Basic(BasicType::String);
        assert_eq!(
            machine.skipped(),
            &[
                Error::TypeMismatch {
                    expected: TypeCode::Struct,
                    found,
                },
                Error::TypeMismatch {
                    expected: TypeCode::Array,
                    found,
                },
            ]
        );
        assert_eq!(machine.allocations(), 0);
        Ok(())
    }

    #[test]
    fn mismatched_array_elements_keep_their_slots() -> Result<()> {
        let program = compile(&[("xs", "ai")])?;
        let mut writer = WireWriter::new();
        writer.open_container(Container::Array("s".to_owned()))?;
        for value in &["a", "b", "c"] {
            writer.append_basic(&BasicValue::String(Some((*value).to_owned())))?;
        }
        writer.close_container()?;
        let message = writer.finish()?;

        let mut machine = Machine::new(&program);
        let mut locals = declared(&program);
        machine.decode_attribute("t_T_M_xs", &mut locals, &mut WireReader::new(&message))?;
        assert_eq!(
            locals.get("t_T_M_xs"),
            Some(&Native::array(vec![int(0), int(0), int(0)]))
        );
        assert_eq!(machine.allocations(), 1);
        assert_eq!(machine.skipped().len(), 3);
        Ok(())
    }

    #[test]
    fn suffix_like_argument_names_decode_apart() -> Result<()> {
        let objects = assemble(single_method(vec![
            arg("x", "a(ii)", None),
            arg("x_elem", "(s)", None),
        ]))?;
        let program = Compiler::compile_object(&objects[0])?;

        let mut writer = WireWriter::new();
        writer.open_container(Container::Array("(ii)".to_owned()))?;
        writer.open_container(Container::Struct)?;
        writer.append_basic(&BasicValue::Int32(1))?;
        writer.append_basic(&BasicValue::Int32(2))?;
        writer.close_container()?;
        writer.close_container()?;
        writer.open_container(Container::Struct)?;
        writer.append_basic(&BasicValue::String(Some("hi".to_owned())))?;
        writer.close_container()?;
        let call = writer.finish()?;

        let mut machine = Machine::new(&program);
        let mut seen = Locals::new();
        machine.dispatch("a_B_M", &call, |locals| {
            seen = locals.clone();
            Ok(())
        })?;
        assert_eq!(
            seen.get("a_B_M_x"),
            Some(&Native::array(vec![Native::Struct(vec![int(1), int(2)])]))
        );
        assert_eq!(seen.get("a_B_M_x_elem"), Some(&Native::Struct(vec![string("hi")])));
        assert!(machine.skipped().is_empty());
        Ok(())
    }

    #[test]
    fn overlong_count_is_rejected() -> Result<()> {
        let program = compile(&[("xs", "ai")])?;
        let mut machine = Machine::new(&program);
        let mut locals = Locals::new();
        locals.set(
            "t_T_M_xs",
            Native::Array {
                items: Some(vec![int(1)]),
                len: 3,
            },
        );
        let mut writer = WireWriter::new();
        assert_eq!(
            machine.encode_attribute("t_T_M_xs", &mut locals, &mut writer),
            Err(Error::ArrayOverrun { len: 3, held: 1 })
        );
        Ok(())
    }

    #[test]
    fn method_proxy_answers_calls() -> Result<()> {
        let objects = assemble(calculator_events())?;
        let program = Compiler::compile_object(&objects[0])?;
        let mut machine = Machine::new(&program);

        let mut writer = WireWriter::new();
        writer.append_basic(&BasicValue::Int32(40))?;
        writer.append_basic(&BasicValue::Int32(2))?;
        let call = writer.finish()?;

        let reply = machine.dispatch("org_example_Calc_Add", &call, |locals| {
            let x = locals.get("org_example_Calc_Add_x").cloned();
            let y = locals.get("org_example_Calc_Add_y").cloned();
            match (x, y) {
                (
                    Some(Native::Basic(BasicValue::Int32(x))),
                    Some(Native::Basic(BasicValue::Int32(y))),
                ) => {
                    locals.set("org_example_Calc_Add_sum", int(x + y));
                    Ok(())
                }
                _ => Err(Error::SignatureExhausted),
            }
        })?;

        let mut expected = WireWriter::new();
        expected.append_basic(&BasicValue::Int32(42))?;
        assert_eq!(reply, Reply::Return(expected.finish()?));
        Ok(())
    }

    #[test]
    fn failing_operation_gets_error_reply() -> Result<()> {
        let objects = assemble(calculator_events())?;
        let program = Compiler::compile_object(&objects[0])?;
        let mut machine = Machine::new(&program);
        let reply = machine.dispatch("org_example_Calc_Negate", &Message::default(), |_| {
            Err(Error::SignatureExhausted)
        })?;
        assert!(matches!(reply, Reply::Error { name, .. } if name == ERROR_FAILED));
        Ok(())
    }

    #[test]
    fn unencodable_output_gets_error_reply() -> Result<()> {
        let objects = assemble(single_method(vec![arg("r", "(iv)", Some(Direction::Out))]))?;
        let program = Compiler::compile_object(&objects[0])?;
        let mut machine = Machine::new(&program);
        let reply = machine.dispatch("a_B_M", &Message::default(), |locals| {
            let compound = Native::Variant {
                tag: TypeCode::Struct,
                payload: None,
            };
            locals.set("a_B_M_r", Native::Struct(vec![int(1), compound]));
            Ok(())
        })?;
        assert!(matches!(reply, Reply::Error { name, .. } if name == ERROR_FAILED));
        Ok(())
    }

    #[test]
    fn signal_emitter_uses_default_path() -> Result<()> {
        let objects = assemble(calculator_events())?;
        let program = Compiler::compile_object(&objects[0])?;
        let mut machine = Machine::new(&program);
        let entry = &program.entry_points["org_example_Calc_Overflow"];
        let mut locals = Locals::declare(&entry.locals);
        locals.set(
            "org_example_Calc_Overflow_operands",
            Native::array(vec![Native::Struct(vec![int(i32::MAX), int(1)])]),
        );

        let emission = machine.emit_signal("org_example_Calc_Overflow", None, &mut locals)?;
        assert_eq!(emission.path, "/org/example/Calc");
        assert_eq!(emission.member, "Overflow");
        assert_eq!(emission.message.signature_str(), "sa(ii)");

        let reader = WireReader::new(&emission.message);
        // The null reason goes out as the empty string.
        assert_eq!(
            reader.get_basic()?,
            BasicValue::String(Some(String::new()))
        );

        let moved = machine.emit_signal("org_example_Calc_Overflow", Some("/elsewhere"), &mut locals)?;
        assert_eq!(moved.path, "/elsewhere");
        Ok(())
    }
}
