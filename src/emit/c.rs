//! Renders a compiled object as C against the libdbus message iterator
//! API.
//!
//! Arrays and variants use two carriers shared by every generated type:
//! `<prefix>_array_t`, a buffer and its count, and `<prefix>_variant_t`,
//! a type tag and a pointer to a `DBusBasicValue` cell. Structures get
//! one `struct <field>_t` each.

use crate::codegen::ir::{EntryKind, EntryPoint, Iter, Op, Pass, Place, Procedure, Program, Root, Step};
use crate::codegen::{element_field, entry_name, member_field};
use crate::error::{Error, Result};
use crate::model::{Attribute, Direction, Interface, Method, Object, Signal};
use crate::signature::{BasicType, Type, TypeCode};

use super::emitter_policy::{ArgumentNaming, EmitterPolicy};

const BANNER: &str = "/* Generated by dbus_glue, do not edit */";

pub fn basic_c_type(basic: BasicType) -> &'static str {
    match basic {
        BasicType::Byte => "unsigned char",
        BasicType::Boolean => "dbus_bool_t",
        BasicType::Int16 => "dbus_int16_t",
        BasicType::Uint16 => "dbus_uint16_t",
        BasicType::Int32 => "dbus_int32_t",
        BasicType::Uint32 => "dbus_uint32_t",
        BasicType::Int64 => "dbus_int64_t",
        BasicType::Uint64 => "dbus_uint64_t",
        BasicType::Double => "double",
        BasicType::String | BasicType::ObjectPath | BasicType::Signature => "char *",
        BasicType::UnixFd => "int",
    }
}

/// The `DBusBasicValue` member a basic value is read through.
fn basic_value_member(basic: BasicType) -> &'static str {
    match basic {
        BasicType::Byte => "byt",
        BasicType::Boolean => "bool_val",
        BasicType::Int16 => "i16",
        BasicType::Uint16 => "u16",
        BasicType::Int32 => "i32",
        BasicType::Uint32 => "u32",
        BasicType::Int64 => "i64",
        BasicType::Uint64 => "u64",
        BasicType::Double => "dbl",
        BasicType::String | BasicType::ObjectPath | BasicType::Signature => "str",
        BasicType::UnixFd => "fd",
    }
}

pub fn dbus_type(code: TypeCode) -> &'static str {
    match code {
        TypeCode::Invalid => "DBUS_TYPE_INVALID",
        TypeCode::Basic(basic) => match basic {
            BasicType::Byte => "DBUS_TYPE_BYTE",
            BasicType::Boolean => "DBUS_TYPE_BOOLEAN",
            BasicType::Int16 => "DBUS_TYPE_INT16",
            BasicType::Uint16 => "DBUS_TYPE_UINT16",
            BasicType::Int32 => "DBUS_TYPE_INT32",
            BasicType::Uint32 => "DBUS_TYPE_UINT32",
            BasicType::Int64 => "DBUS_TYPE_INT64",
            BasicType::Uint64 => "DBUS_TYPE_UINT64",
            BasicType::Double => "DBUS_TYPE_DOUBLE",
            BasicType::String => "DBUS_TYPE_STRING",
            BasicType::ObjectPath => "DBUS_TYPE_OBJECT_PATH",
            BasicType::Signature => "DBUS_TYPE_SIGNATURE",
            BasicType::UnixFd => "DBUS_TYPE_UNIX_FD",
        },
        TypeCode::Array => "DBUS_TYPE_ARRAY",
        TypeCode::Struct => "DBUS_TYPE_STRUCT",
        TypeCode::Variant => "DBUS_TYPE_VARIANT",
        TypeCode::DictEntry => "DBUS_TYPE_DICT_ENTRY",
    }
}

pub fn c_type(prefix: &str, ty: &Type, field: &str) -> String {
    match ty {
        Type::Primitive(basic) => basic_c_type(*basic).to_owned(),
        Type::Array(_) => format!("struct {}_array_t", prefix),
        Type::Struct(_) => format!("struct {}_t", field),
        Type::Variant => format!("struct {}_variant_t", prefix),
    }
}

/// `T name`, with pointer spacing kept tidy for `char *`.
fn declarator(c_type: &str, name: &str) -> String {
    if c_type.ends_with('*') {
        format!("{}{}", c_type, name)
    } else {
        format!("{} {}", c_type, name)
    }
}

fn zero(ty: &Type) -> &'static str {
    match ty {
        Type::Primitive(basic) if basic.is_text() => "NULL",
        Type::Primitive(_) => "0",
        Type::Array(_) | Type::Struct(_) | Type::Variant => "{ 0 }",
    }
}

/// Primitive inputs travel by value, everything else by pointer.
fn by_value(attr: &Attribute) -> bool {
    attr.direction == Direction::In && attr.ty.is_primitive()
}

/// Argument names are prefixed so they never shadow the fixed parameters
/// and locals of the generated functions.
fn param_name(attr: &Attribute) -> String {
    format!("arg_{}", attr.name)
}

/// Text with tab indentation.
struct Code {
    out: String,
    depth: usize,
}

impl Code {
    fn new() -> Self {
        Self {
            out: String::new(),
            depth: 0,
        }
    }

    fn line(&mut self, text: &str) {
        if !text.is_empty() {
            for _ in 0..self.depth {
                self.out.push('\t');
            }
            self.out.push_str(text);
        }
        self.out.push('\n');
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }

    /// A single statement under a braceless `if` or `for`.
    fn nested(&mut self, text: &str) {
        self.depth += 1;
        self.line(text);
        self.depth -= 1;
    }

    fn open(&mut self, text: &str) {
        self.line(text);
        self.depth += 1;
    }

    fn close(&mut self, text: &str) {
        self.depth = self.depth.saturating_sub(1);
        self.line(text);
    }

    fn reopen(&mut self, text: &str) {
        self.close(text);
        self.depth += 1;
    }
}

/// What the places and iterators of one function body render as.
struct Frame<'f> {
    prefix: &'f str,
    roots: Vec<(Root, String, Type, String)>,
    outer: &'static str,
    inner: &'static str,
    on_failure: &'static str,
    /// Drops the half-written inner container before failing, where the
    /// body writes through one.
    abandon: Option<&'static str>,
}

impl Frame<'_> {
    fn iter(&self, iter: Iter) -> &'static str {
        match iter {
            Iter::Outer => self.outer,
            Iter::Inner => self.inner,
        }
    }

    /// The C lvalue of `place`, with its type and field name.
    fn place(&self, place: &Place) -> Result<(String, Type, String)> {
        let missing = || Error::PlaceNotFound(place.to_string());
        let (_, expr, ty, field) = self
            .roots
            .iter()
            .find(|(root, ..)| *root == place.root)
            .ok_or_else(missing)?;
        let mut expr = expr.clone();
        let mut ty = ty.clone();
        let mut field = field.clone();
        for step in &place.path {
            let (next_expr, next_ty, next_field) = match (step, &ty) {
                (Step::Member(ix), Type::Struct(members)) => {
                    let member = members.get(*ix).ok_or_else(missing)?;
                    (
                        format!("{}.member_{}", expr, ix),
                        member.clone(),
                        member_field(&field, *ix),
                    )
                }
                (Step::Element, Type::Array(element)) => {
                    let elem_field = element_field(&field);
                    (
                        format!(
                            "(({} *){}.items)[__i]",
                            c_type(self.prefix, element, &elem_field),
                            expr
                        ),
                        (**element).clone(),
                        elem_field,
                    )
                }
                _ => return Err(missing()),
            };
            expr = next_expr;
            ty = next_ty;
            field = next_field;
        }
        Ok((expr, ty, field))
    }

    fn lvalue(&self, place: &Place) -> Result<String> {
        Ok(self.place(place)?.0)
    }
}

/// Renders the declarations artifact and the code artifact of one object.
pub struct Renderer<'a, P: EmitterPolicy> {
    policy: &'a P,
    object: &'a Object,
    program: &'a Program,
}

impl<'a, P: EmitterPolicy> Renderer<'a, P> {
    pub fn new(policy: &'a P, object: &'a Object, program: &'a Program) -> Self {
        Self {
            policy,
            object,
            program,
        }
    }

    fn prefix(&self) -> &str {
        self.policy.prefix()
    }

    fn entry(&self, interface: &Interface, member: &str) -> Result<&'a EntryPoint> {
        let name = entry_name(interface, member);
        let program: &'a Program = self.program;
        program
            .entry_points
            .get(&name)
            .ok_or(Error::UnknownProcedure(name))
    }

    fn param(&self, attr: &Attribute) -> String {
        let ty = c_type(self.prefix(), &attr.ty, &attr.qualified_name);
        if by_value(attr) {
            declarator(&ty, &param_name(attr))
        } else {
            format!("{} *{}", ty, param_name(attr))
        }
    }

    /// `, a, b` for appending to a fixed parameter list.
    fn params(&self, attributes: &[Attribute]) -> String {
        attributes
            .iter()
            .map(|attr| format!(", {}", self.param(attr)))
            .collect()
    }

    fn operation_pointer(&self, method: &Method, suffix: &str, ret: &str) -> String {
        format!(
            "{} (*{}{})(DBusConnection *cnx, DBusMessage *msg, void *data{});",
            ret,
            method.name,
            suffix,
            self.params(&method.attributes)
        )
    }

    fn procedure_signature(&self, procedure: &Procedure) -> String {
        let ty = c_type(self.prefix(), &procedure.ty, &procedure.field);
        match procedure.pass {
            Pass::Encode | Pass::Decode => format!(
                "int {}_{}(DBusMessageIter *iter, {} *value)",
                self.prefix(),
                procedure.name,
                ty
            ),
            Pass::Release => format!("void {}_{}({} *value)", self.prefix(), procedure.name, ty),
        }
    }

    fn signal_signature(&self, entry: &EntryPoint, signal: &Signal) -> String {
        format!(
            "int {}(DBusConnection *cnx, const char *object_path{})",
            entry.name,
            self.params(&signal.attributes)
        )
    }

    fn table_name(&self, entry: &EntryPoint) -> String {
        match entry.kind {
            EntryKind::MethodProxy => format!("{}_method_table", entry.name),
            EntryKind::SignalEmitter { .. } => format!("{}_signal_table", entry.name),
        }
    }

    fn object_table(&self) -> String {
        format!("{}_object_table", self.object.c_name())
    }

    pub fn header(&self) -> Result<String> {
        let prefix = self.prefix();
        let guard = format!("__{}_H", self.object.c_name().to_uppercase());
        let mut code = Code::new();
        code.line(BANNER);
        code.line(&format!("#ifndef {}", guard));
        code.line(&format!("#define {}", guard));
        code.blank();
        code.line(&format!("#include \"lib{}.h\"", prefix));
        code.blank();

        let carriers = format!("__{}_CARRIERS", prefix.to_uppercase());
        code.line(&format!("#ifndef {}", carriers));
        code.line(&format!("#define {}", carriers));
        code.open(&format!("struct {}_array_t {{", prefix));
        code.line("void *items;");
        code.line("int len;");
        code.close("};");
        code.blank();
        code.open(&format!("struct {}_variant_t {{", prefix));
        code.line("int type;");
        code.line("void *value;");
        code.close("};");
        code.line("#endif");
        code.blank();

        code.line("/* Generated types */");
        code.blank();
        for decl in self.program.structs.values() {
            code.open(&format!("struct {}_t {{", decl.field));
            for (ix, (field, ty)) in decl.members.iter().enumerate() {
                let member = format!("member_{}", ix);
                code.line(&format!("{};", declarator(&c_type(prefix, ty, field), &member)));
            }
            code.close("};");
            code.blank();
        }

        code.line("/* Functions implemented by the library user */");
        code.blank();
        for interface in self.object.interfaces.values() {
            if interface.methods.is_empty() {
                continue;
            }
            let ops = format!("{}_ops", interface.c_name());
            code.open(&format!("extern struct {} {{", ops));
            for method in interface.methods.values() {
                code.line(&self.operation_pointer(method, "", "int"));
                code.line(&self.operation_pointer(method, "_free", "void"));
            }
            code.close(&format!("}} {};", ops));
            code.blank();
        }

        code.line("/* Public functions */");
        code.blank();
        for interface in self.object.interfaces.values() {
            for signal in interface.signals.values() {
                let entry = self.entry(interface, &signal.name)?;
                code.line(&format!("{};", self.signal_signature(entry, signal)));
            }
        }
        code.blank();

        code.line("/* Private declarations */");
        code.blank();
        for procedure in self.program.procedures.values() {
            code.line(&format!("{};", self.procedure_signature(procedure)));
        }
        code.blank();
        for interface in self.object.interfaces.values() {
            for method in interface.methods.values() {
                let entry = self.entry(interface, &method.name)?;
                code.line(&format!(
                    "int {}_proxy(DBusConnection *cnx, DBusMessage *msg, void *data);",
                    entry.name
                ));
            }
        }
        code.blank();
        for interface in self.object.interfaces.values() {
            let members = interface
                .methods
                .keys()
                .chain(interface.signals.keys());
            for member in members {
                let entry = self.entry(interface, member)?;
                code.line(&format!(
                    "extern struct {}_arg_entry_t {}[];",
                    prefix,
                    self.table_name(entry)
                ));
            }
            code.line(&format!(
                "extern struct {}_message_entry_t {}_interface_table[];",
                prefix,
                interface.c_name()
            ));
            code.blank();
        }
        code.line(&format!(
            "extern struct {}_interface_entry_t {}[];",
            prefix,
            self.object_table()
        ));
        code.blank();
        code.line("#endif");
        Ok(code.out)
    }

    pub fn source(&self) -> Result<String> {
        let prefix = self.prefix();
        let mut code = Code::new();
        code.line(BANNER);
        code.blank();
        code.line("#include <stdlib.h>");
        code.line(&format!("#include \"{}.h\"", self.object.c_name()));
        code.blank();
        code.line("static char *null_string __attribute__((unused)) = \"\";");
        code.blank();

        for interface in self.object.interfaces.values() {
            for method in interface.methods.values() {
                let entry = self.entry(interface, &method.name)?;
                self.argument_table(&mut code, entry, &method.attributes);
            }
            for signal in interface.signals.values() {
                let entry = self.entry(interface, &signal.name)?;
                self.argument_table(&mut code, entry, &signal.attributes);
            }

            code.open(&format!(
                "struct {}_message_entry_t {}_interface_table[] = {{",
                prefix,
                interface.c_name()
            ));
            for method in interface.methods.values() {
                let entry = self.entry(interface, &method.name)?;
                code.line(&format!(
                    "{{0, \"{}\", {}_proxy, {}}},",
                    method.name,
                    entry.name,
                    self.table_name(entry)
                ));
            }
            for signal in interface.signals.values() {
                let entry = self.entry(interface, &signal.name)?;
                code.line(&format!(
                    "{{1, \"{}\", NULL, {}}},",
                    signal.name,
                    self.table_name(entry)
                ));
            }
            code.line("{0, NULL, NULL, NULL},");
            code.close("};");
            code.blank();
        }

        code.open(&format!(
            "struct {}_interface_entry_t {}[] = {{",
            prefix,
            self.object_table()
        ));
        for interface in self.object.interfaces.values() {
            code.line(&format!(
                "{{\"{}\", {}_interface_table}},",
                interface.name,
                interface.c_name()
            ));
        }
        code.line("{NULL, NULL},");
        code.close("};");
        code.blank();

        for procedure in self.program.procedures.values() {
            self.procedure(&mut code, procedure)?;
            code.blank();
        }

        for interface in self.object.interfaces.values() {
            for method in interface.methods.values() {
                let entry = self.entry(interface, &method.name)?;
                self.method_proxy(&mut code, interface, method, entry)?;
                code.blank();
            }
            for signal in interface.signals.values() {
                let entry = self.entry(interface, &signal.name)?;
                self.signal_emitter(&mut code, signal, entry)?;
                code.blank();
            }
        }
        Ok(code.out)
    }

    fn argument_table(&self, code: &mut Code, entry: &EntryPoint, attributes: &[Attribute]) {
        let prefix = self.prefix();
        code.open(&format!(
            "struct {}_arg_entry_t {}[] = {{",
            prefix,
            self.table_name(entry)
        ));
        for attr in attributes {
            let name = match self.policy.argument_naming() {
                ArgumentNaming::Declared => &attr.name,
                ArgumentNaming::Qualified => &attr.qualified_name,
            };
            let direction = match attr.direction {
                Direction::In => "IN",
                Direction::Out => "OUT",
            };
            code.line(&format!(
                "{{\"{}\", {}_DIRECTION_{}, \"{}\"}},",
                name,
                prefix.to_uppercase(),
                direction,
                attr.ty
            ));
        }
        code.line("{NULL, 0, NULL},");
        code.close("};");
        code.blank();
    }

    fn procedure(&self, code: &mut Code, procedure: &Procedure) -> Result<()> {
        let frame = Frame {
            prefix: self.prefix(),
            roots: vec![(
                Root::Param,
                "(*value)".to_owned(),
                procedure.ty.clone(),
                procedure.field.clone(),
            )],
            outer: "iter",
            inner: "&sub",
            on_failure: "return -1;",
            abandon: Some("dbus_message_iter_abandon_container(iter, &sub);"),
        };
        code.line(&self.procedure_signature(procedure));
        code.open("{");
        if procedure.pass != Pass::Release {
            code.line("DBusMessageIter sub;");
        }
        if procedure.body.iter().any(Op::loops) {
            code.line("int __i;");
        }
        if procedure
            .body
            .iter()
            .any(|op| matches!(op, Op::OpenVariant { .. }))
        {
            code.line("char variant_signature[2] = { 0, 0 };");
        }
        code.blank();
        self.ops(code, &frame, &procedure.body)?;
        if procedure.pass != Pass::Release {
            code.line("return 0;");
        }
        code.close("}");
        Ok(())
    }

    /// A frame over an entry point's variables. Variables the function
    /// received by pointer are reached through it.
    fn entry_frame(&self, attributes: &[Attribute], through_params: bool) -> Frame<'_> {
        let roots = attributes
            .iter()
            .map(|attr| {
                let expr = if !through_params {
                    attr.qualified_name.clone()
                } else if by_value(attr) {
                    param_name(attr)
                } else {
                    format!("(*{})", param_name(attr))
                };
                (
                    Root::Local(attr.qualified_name.clone()),
                    expr,
                    attr.ty.clone(),
                    attr.qualified_name.clone(),
                )
            })
            .collect();
        Frame {
            prefix: self.prefix(),
            roots,
            outer: "&iter",
            inner: "&iter",
            on_failure: "ret = -1;",
            abandon: None,
        }
    }

    fn method_proxy(
        &self,
        code: &mut Code,
        interface: &Interface,
        method: &Method,
        entry: &EntryPoint,
    ) -> Result<()> {
        let ops = format!("{}_ops", interface.c_name());
        let args: String = method
            .attributes
            .iter()
            .map(|attr| {
                if by_value(attr) {
                    format!(", {}", attr.qualified_name)
                } else {
                    format!(", &{}", attr.qualified_name)
                }
            })
            .collect();
        let frame = self.entry_frame(&method.attributes, false);

        code.line(&format!(
            "int {}_proxy(DBusConnection *cnx, DBusMessage *msg, void *data)",
            entry.name
        ));
        code.open("{");
        code.line("int ret = -1;");
        code.line("DBusMessage *reply;");
        code.line("DBusMessageIter iter;");
        for local in &entry.locals {
            let ty = c_type(self.prefix(), &local.ty, &local.name);
            code.line(&format!("{} = {};", declarator(&ty, &local.name), zero(&local.ty)));
        }
        code.blank();
        code.line("dbus_message_iter_init(msg, &iter);");
        self.ops(code, &frame, &entry.decode)?;
        code.blank();
        code.line(&format!("if ({}.{})", ops, method.name));
        code.nested(&format!(
            "ret = {}.{}(cnx, msg, data{});",
            ops, method.name, args
        ));
        code.blank();
        code.open("if (ret < 0) {");
        code.line("reply = dbus_message_new_error(msg, DBUS_ERROR_FAILED, \"method_call failed\");");
        code.reopen("} else {");
        code.line("reply = dbus_message_new_method_return(msg);");
        code.open("if (reply) {");
        code.line("dbus_message_iter_init_append(reply, &iter);");
        self.ops(code, &frame, &entry.encode)?;
        if !entry.encode.is_empty() {
            code.open("if (ret < 0) {");
            code.line("dbus_message_unref(reply);");
            code.line("reply = dbus_message_new_error(msg, DBUS_ERROR_FAILED, \"method_call failed\");");
            code.close("}");
        }
        code.close("}");
        code.line(&format!("if ({}.{}_free)", ops, method.name));
        code.nested(&format!(
            "{}.{}_free(cnx, msg, data{});",
            ops, method.name, args
        ));
        code.close("}");
        code.blank();
        code.open("if (reply) {");
        code.line("dbus_connection_send(cnx, reply, NULL);");
        code.line("dbus_message_unref(reply);");
        code.reopen("} else {");
        code.line("ret = -1;");
        code.close("}");
        code.blank();
        self.ops(code, &frame, &entry.release)?;
        code.line("return ret;");
        code.close("}");
        Ok(())
    }

    fn signal_emitter(&self, code: &mut Code, signal: &Signal, entry: &EntryPoint) -> Result<()> {
        let default_path = match &entry.kind {
            EntryKind::SignalEmitter { default_path } => default_path,
            EntryKind::MethodProxy => return Err(Error::UnknownProcedure(entry.name.clone())),
        };
        let frame = self.entry_frame(&signal.attributes, true);

        code.line(&self.signal_signature(entry, signal));
        code.open("{");
        code.line("int ret = 0;");
        code.line("DBusMessage *msg;");
        code.line("DBusMessageIter iter;");
        code.blank();
        code.line(&format!(
            "msg = dbus_message_new_signal(object_path ? object_path : \"{}\", \"{}\", \"{}\");",
            default_path, entry.interface, entry.member
        ));
        code.line("if (!msg)");
        code.nested("return -1;");
        code.line("dbus_message_iter_init_append(msg, &iter);");
        self.ops(code, &frame, &entry.encode)?;
        code.blank();
        code.line("if (ret == 0)");
        code.nested("dbus_connection_send(cnx, msg, NULL);");
        code.line("dbus_message_unref(msg);");
        code.line("return ret;");
        code.close("}");
        Ok(())
    }

    fn ops(&self, code: &mut Code, frame: &Frame<'_>, ops: &[Op]) -> Result<()> {
        let prefix = self.prefix();
        for op in ops {
            match op {
                Op::AppendBasic { iter, ty, value } => {
                    let value = frame.lvalue(value)?;
                    let arg = if ty.is_text() {
                        format!("{0} ? &{0} : &null_string", value)
                    } else {
                        format!("&{}", value)
                    };
                    code.line(&format!(
                        "dbus_message_iter_append_basic({}, {}, {});",
                        frame.iter(*iter),
                        dbus_type(TypeCode::Basic(*ty)),
                        arg
                    ));
                }
                Op::OpenStruct { parent } => code.line(&format!(
                    "dbus_message_iter_open_container({}, DBUS_TYPE_STRUCT, NULL, &sub);",
                    frame.iter(*parent)
                )),
                Op::OpenArray { parent, element } => code.line(&format!(
                    "dbus_message_iter_open_container({}, DBUS_TYPE_ARRAY, \"{}\", &sub);",
                    frame.iter(*parent),
                    element
                )),
                Op::RequireBasicVariant { value } => {
                    code.line(&format!(
                        "if (!dbus_type_is_basic({}.type))",
                        frame.lvalue(value)?
                    ));
                    code.nested(frame.on_failure);
                }
                Op::OpenVariant { parent, value } => {
                    code.line(&format!(
                        "variant_signature[0] = (char){}.type;",
                        frame.lvalue(value)?
                    ));
                    code.line(&format!(
                        "dbus_message_iter_open_container({}, DBUS_TYPE_VARIANT, variant_signature, &sub);",
                        frame.iter(*parent)
                    ));
                }
                Op::AppendVariantPayload { iter, value } => {
                    let value = frame.lvalue(value)?;
                    code.line(&format!(
                        "dbus_message_iter_append_basic({}, {1}.type, {1}.value);",
                        frame.iter(*iter),
                        value
                    ));
                }
                Op::CloseContainer { parent } => code.line(&format!(
                    "dbus_message_iter_close_container({}, &sub);",
                    frame.iter(*parent)
                )),
                Op::IfArgType {
                    iter,
                    expected,
                    then,
                } => {
                    code.open(&format!(
                        "if (dbus_message_iter_get_arg_type({}) == {}) {{",
                        frame.iter(*iter),
                        dbus_type(*expected)
                    ));
                    self.ops(code, frame, then)?;
                    code.close("}");
                }
                Op::Next { iter } => {
                    code.line(&format!("dbus_message_iter_next({});", frame.iter(*iter)))
                }
                Op::ReadBasic { iter, ty, into } => {
                    code.open("{");
                    code.line("DBusBasicValue val;");
                    code.line(&format!(
                        "dbus_message_iter_get_basic({}, &val);",
                        frame.iter(*iter)
                    ));
                    code.line(&format!(
                        "{} = val.{};",
                        frame.lvalue(into)?,
                        basic_value_member(*ty)
                    ));
                    code.close("}");
                }
                Op::Recurse { parent } => code.line(&format!(
                    "dbus_message_iter_recurse({}, &sub);",
                    frame.iter(*parent)
                )),
                Op::CountElements { iter, array } => {
                    let array = frame.lvalue(array)?;
                    let iter = frame.iter(*iter);
                    code.line(&format!(
                        "for ({}.len = 0; dbus_message_iter_get_arg_type({}) != DBUS_TYPE_INVALID; dbus_message_iter_next({}))",
                        array, iter, iter
                    ));
                    code.nested(&format!("{}.len++;", array));
                }
                Op::Allocate { array, element } => {
                    let (array, _, field) = frame.place(array)?;
                    code.line(&format!(
                        "{0}.items = calloc({0}.len, sizeof({1}));",
                        array,
                        c_type(prefix, element, &element_field(&field))
                    ));
                }
                Op::ReadVariant { iter, into } => {
                    let into = frame.lvalue(into)?;
                    let iter = frame.iter(*iter);
                    code.line(&format!(
                        "{}.type = dbus_message_iter_get_arg_type({});",
                        into, iter
                    ));
                    code.open(&format!("if (dbus_type_is_basic({}.type)) {{", into));
                    code.line(&format!(
                        "{}.value = calloc(1, sizeof(DBusBasicValue));",
                        into
                    ));
                    code.line(&format!(
                        "dbus_message_iter_get_basic({}, {}.value);",
                        iter, into
                    ));
                    code.reopen("} else {");
                    code.line(&format!("{}.type = DBUS_TYPE_INVALID;", into));
                    code.close("}");
                }
                Op::FreeArray { array } => {
                    let array = frame.lvalue(array)?;
                    code.line(&format!("free({}.items);", array));
                    code.line(&format!("{}.items = NULL;", array));
                    code.line(&format!("{}.len = 0;", array));
                }
                Op::FreeVariant { value } => {
                    let value = frame.lvalue(value)?;
                    code.line(&format!("free({}.value);", value));
                    code.line(&format!("{}.value = NULL;", value));
                    code.line(&format!("{}.type = DBUS_TYPE_INVALID;", value));
                }
                Op::ForEach { array, body } => {
                    code.open(&format!(
                        "for (__i = 0; __i < {}.len; __i++) {{",
                        frame.lvalue(array)?
                    ));
                    self.ops(code, frame, body)?;
                    code.close("}");
                }
                Op::Call {
                    procedure,
                    iter,
                    value,
                } => {
                    let pass = self
                        .program
                        .procedures
                        .get(procedure)
                        .map(|procedure| procedure.pass)
                        .ok_or_else(|| Error::UnknownProcedure(procedure.clone()))?;
                    let value = frame.lvalue(value)?;
                    let call = match iter {
                        Some(iter) => format!(
                            "{}_{}({}, &{})",
                            prefix,
                            procedure,
                            frame.iter(*iter),
                            value
                        ),
                        None => format!("{}_{}(&{})", prefix, procedure, value),
                    };
                    match (pass, frame.abandon) {
                        (Pass::Encode, Some(abandon)) if *iter == Some(Iter::Inner) => {
                            code.open(&format!("if ({} < 0) {{", call));
                            code.line(abandon);
                            code.line(frame.on_failure);
                            code.close("}");
                        }
                        (Pass::Encode, _) => {
                            code.line(&format!("if ({} < 0)", call));
                            code.nested(frame.on_failure);
                        }
                        _ => code.line(&format!("{};", call)),
                    }
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
    use crate::assembler::Event;
    use crate::codegen::Compiler;
    use crate::emit::emitter_policy::{DefaultEmitterPolicy, QualifiedTableEmitterPolicy};
    use test_log::test;

    fn inventory() -> Result<Object> {
        let mut objects = assemble(vec![
            Event::ObjectOpen {
                path: "/com/example/Store".to_owned(),
            },
            Event::InterfaceOpen {
                name: "com.example.Store".to_owned(),
            },
            Event::MethodOpen {
                name: "Stock".to_owned(),
            },
            arg("items", "a(sav)", None),
            arg("count", "u", Some(Direction::Out)),
            Event::MethodClose,
            Event::SignalOpen {
                name: "Changed".to_owned(),
            },
            arg("item", "(su)", None),
            Event::SignalClose,
            Event::InterfaceClose,
            Event::ObjectClose,
        ])?;
        objects.pop().ok_or(Error::UnexpectedEvent("object-close"))
    }

    fn render<P: EmitterPolicy>(policy: &P, object: &Object) -> Result<(String, String)> {
        let program = Compiler::compile_object(object)?;
        let renderer = Renderer::new(policy, object, &program);
        Ok((renderer.header()?, renderer.source()?))
    }

    #[test]
    fn header_declares_types_and_tables() -> Result<()> {
        let object = inventory()?;
        let (header, _) = render(&DefaultEmitterPolicy, &object)?;
        assert!(header.contains("#ifndef __COM_EXAMPLE_STORE_H"));
        assert!(header.contains(
            "struct com_example_Store_Stock_items__elem_t {\n\tchar *member_0;\n\tstruct cdbus_array_t member_1;\n};"
        ));
        assert!(header.contains("extern struct com_example_Store_ops {"));
        assert!(header.contains(
            "\tint (*Stock)(DBusConnection *cnx, DBusMessage *msg, void *data, struct cdbus_array_t *arg_items, dbus_uint32_t *arg_count);"
        ));
        assert!(header.contains(
            "int com_example_Store_Changed(DBusConnection *cnx, const char *object_path, struct com_example_Store_Changed_item_t *arg_item);"
        ));
        assert!(header.contains(
            "int cdbus_unpack_com_example_Store_Stock_items_array(DBusMessageIter *iter, struct cdbus_array_t *value);"
        ));
        assert!(header.contains("void cdbus_free_com_example_Store_Stock_items_array(struct cdbus_array_t *value);"));
        assert!(header.contains("extern struct cdbus_interface_entry_t com_example_Store_object_table[];"));
        assert!(header.trim_end().ends_with("#endif"));
        Ok(())
    }

    #[test]
    fn array_decode_is_two_pass() -> Result<()> {
        let object = inventory()?;
        let (_, source) = render(&DefaultEmitterPolicy, &object)?;
        let expected = "\
int cdbus_unpack_com_example_Store_Stock_items_array(DBusMessageIter *iter, struct cdbus_array_t *value)
{
\tDBusMessageIter sub;
\tint __i;

\tdbus_message_iter_recurse(iter, &sub);
\tfor ((*value).len = 0; dbus_message_iter_get_arg_type(&sub) != DBUS_TYPE_INVALID; dbus_message_iter_next(&sub))
\t\t(*value).len++;
\t(*value).items = calloc((*value).len, sizeof(struct com_example_Store_Stock_items__elem_t));
\tdbus_message_iter_recurse(iter, &sub);
\tfor (__i = 0; __i < (*value).len; __i++) {
\t\tif (dbus_message_iter_get_arg_type(&sub) == DBUS_TYPE_STRUCT) {
\t\t\tcdbus_unpack_com_example_Store_Stock_items__elem_struct(&sub, &((struct com_example_Store_Stock_items__elem_t *)(*value).items)[__i]);
\t\t}
\t\tdbus_message_iter_next(&sub);
\t}
\treturn 0;
}
";
        assert!(source.contains(expected), "{}", source);
        Ok(())
    }

    #[test]
    fn variant_encode_checks_its_tag() -> Result<()> {
        let object = inventory()?;
        let (_, source) = render(&DefaultEmitterPolicy, &object)?;
        assert!(source.contains(
            "\tif (!dbus_type_is_basic((*value).type))\n\t\treturn -1;\n\tvariant_signature[0] = (char)(*value).type;\n"
        ));
        assert!(source.contains(
            "\tdbus_message_iter_append_basic(&sub, (*value).type, (*value).value);\n"
        ));
        Ok(())
    }

    #[test]
    fn variant_decode_reads_basic_payloads_only() -> Result<()> {
        let object = inventory()?;
        let (_, source) = render(&DefaultEmitterPolicy, &object)?;
        let expected = "\
int cdbus_unpack_com_example_Store_Stock_items__elem__member_1__elem_variant(DBusMessageIter *iter, struct cdbus_variant_t *value)
{
\tDBusMessageIter sub;

\tdbus_message_iter_recurse(iter, &sub);
\t(*value).type = dbus_message_iter_get_arg_type(&sub);
\tif (dbus_type_is_basic((*value).type)) {
\t\t(*value).value = calloc(1, sizeof(DBusBasicValue));
\t\tdbus_message_iter_get_basic(&sub, (*value).value);
\t} else {
\t\t(*value).type = DBUS_TYPE_INVALID;
\t}
\treturn 0;
}
";
        assert!(source.contains(expected), "{}", source);
        Ok(())
    }

    #[test]
    fn failed_encodes_never_reach_the_connection() -> Result<()> {
        let objects = assemble(single_method(vec![arg("v", "(iv)", Some(Direction::Out))]))?;
        let (_, source) = render(&DefaultEmitterPolicy, &objects[0])?;
        let pack = "\
int cdbus_pack_a_B_M_v_struct(DBusMessageIter *iter, struct a_B_M_v_t *value)
{
\tDBusMessageIter sub;

\tdbus_message_iter_open_container(iter, DBUS_TYPE_STRUCT, NULL, &sub);
\tdbus_message_iter_append_basic(&sub, DBUS_TYPE_INT32, &(*value).member_0);
\tif (cdbus_pack_a_B_M_v__member_1_variant(&sub, &(*value).member_1) < 0) {
\t\tdbus_message_iter_abandon_container(iter, &sub);
\t\treturn -1;
\t}
\tdbus_message_iter_close_container(iter, &sub);
\treturn 0;
}
";
        assert!(source.contains(pack), "{}", source);
        let proxy = "\
\t\treply = dbus_message_new_method_return(msg);
\t\tif (reply) {
\t\t\tdbus_message_iter_init_append(reply, &iter);
\t\t\tif (cdbus_pack_a_B_M_v_struct(&iter, &a_B_M_v) < 0)
\t\t\t\tret = -1;
\t\t\tif (ret < 0) {
\t\t\t\tdbus_message_unref(reply);
\t\t\t\treply = dbus_message_new_error(msg, DBUS_ERROR_FAILED, \"method_call failed\");
\t\t\t}
\t\t}
";
        assert!(source.contains(proxy), "{}", source);
        Ok(())
    }

    #[test]
    fn arguments_never_shadow_fixed_names() -> Result<()> {
        let objects = assemble(single_method(vec![
            arg("cnx", "s", None),
            arg("ret", "ai", Some(Direction::Out)),
        ]))?;
        let (header, source) = render(&DefaultEmitterPolicy, &objects[0])?;
        assert!(header.contains(
            "\tint (*M)(DBusConnection *cnx, DBusMessage *msg, void *data, char *arg_cnx, struct cdbus_array_t *arg_ret);"
        ));
        assert!(source.contains("\tint ret = -1;\n"));
        assert!(source.contains("\tstruct cdbus_array_t a_B_M_ret = { 0 };\n"));
        Ok(())
    }

    #[test]
    fn proxy_decodes_calls_and_releases_inputs() -> Result<()> {
        let object = inventory()?;
        let (_, source) = render(&DefaultEmitterPolicy, &object)?;
        assert!(source.contains("int com_example_Store_Stock_proxy(DBusConnection *cnx, DBusMessage *msg, void *data)\n{"));
        assert!(source.contains("\tstruct cdbus_array_t com_example_Store_Stock_items = { 0 };\n"));
        assert!(source.contains("\tdbus_uint32_t com_example_Store_Stock_count = 0;\n"));
        assert!(source.contains(
            "\t\tret = com_example_Store_ops.Stock(cnx, msg, data, &com_example_Store_Stock_items, &com_example_Store_Stock_count);\n"
        ));
        assert!(source.contains(
            "\t\t\tdbus_message_iter_append_basic(&iter, DBUS_TYPE_UINT32, &com_example_Store_Stock_count);\n"
        ));
        assert!(source.contains(
            "\tcdbus_free_com_example_Store_Stock_items_array(&com_example_Store_Stock_items);\n\treturn ret;\n"
        ));
        Ok(())
    }

    #[test]
    fn signal_emitter_reaches_arguments_through_pointers() -> Result<()> {
        let object = inventory()?;
        let (_, source) = render(&DefaultEmitterPolicy, &object)?;
        assert!(source.contains(
            "\tmsg = dbus_message_new_signal(object_path ? object_path : \"/com/example/Store\", \"com.example.Store\", \"Changed\");\n"
        ));
        assert!(source.contains(
            "\tif (cdbus_pack_com_example_Store_Changed_item_struct(&iter, &(*arg_item)) < 0)\n\t\tret = -1;\n"
        ));
        Ok(())
    }

    #[test]
    fn tables_follow_the_naming_policy() -> Result<()> {
        let objects = assemble(calculator_events())?;
        let (_, declared) = render(&DefaultEmitterPolicy, &objects[0])?;
        assert!(declared.contains(
            "struct cdbus_arg_entry_t org_example_Calc_Add_method_table[] = {\n\t{\"x\", CDBUS_DIRECTION_IN, \"i\"},\n"
        ));
        assert!(declared.contains("\t{0, \"Add\", org_example_Calc_Add_proxy, org_example_Calc_Add_method_table},\n"));
        assert!(declared.contains("\t{1, \"Overflow\", NULL, org_example_Calc_Overflow_signal_table},\n"));
        assert!(declared.contains("\t{\"org.example.Calc\", org_example_Calc_interface_table},\n\t{NULL, NULL},\n"));

        let (_, qualified) = render(&QualifiedTableEmitterPolicy, &objects[0])?;
        assert!(qualified.contains("\t{\"org_example_Calc_Add_x\", CDBUS_DIRECTION_IN, \"i\"},\n"));
        Ok(())
    }

    #[test]
    fn null_strings_go_out_empty() -> Result<()> {
        let objects = assemble(calculator_events())?;
        let (_, source) = render(&DefaultEmitterPolicy, &objects[0])?;
        assert!(source.contains(
            "dbus_message_iter_append_basic(&iter, DBUS_TYPE_STRING, arg_reason ? &arg_reason : &null_string);"
        ));
        Ok(())
    }
}
