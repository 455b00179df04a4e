//! Builds [`Object`]s from a stream of introspection events.
//!
//! The events mirror the element structure of an introspection document:
//! an object opens, interfaces open inside it, methods and signals open
//! inside those and receive their arguments, and each of them closes
//! again. Argument signatures are parsed as they arrive; a member is only
//! registered once it closes with all of its arguments parsed.

use crate::error::{Error, Result};
use crate::model::{Attribute, Direction, Interface, Method, Object, Signal};
use crate::signature::{self, Type};

use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ObjectOpen {
        path: String,
    },
    InterfaceOpen {
        name: String,
    },
    MethodOpen {
        name: String,
    },
    SignalOpen {
        name: String,
    },
    Arg {
        #[serde(default)]
        name: Option<String>,
        signature: String,
        #[serde(default)]
        direction: Option<Direction>,
    },
    MethodClose,
    SignalClose,
    InterfaceClose,
    ObjectClose,
}

impl Event {
    fn label(&self) -> &'static str {
        match self {
            Event::ObjectOpen { .. } => "object-open",
            Event::InterfaceOpen { .. } => "interface-open",
            Event::MethodOpen { .. } => "method-open",
            Event::SignalOpen { .. } => "signal-open",
            Event::Arg { .. } => "argument",
            Event::MethodClose => "method-close",
            Event::SignalClose => "signal-close",
            Event::InterfaceClose => "interface-close",
            Event::ObjectClose => "object-close",
        }
    }
}

/// Receives every object once its declaration is complete.
pub trait ObjectSink {
    fn object_complete(&mut self, object: Object) -> Result<()>;
}

impl ObjectSink for Vec<Object> {
    fn object_complete(&mut self, object: Object) -> Result<()> {
        self.push(object);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum MemberKind {
    Method,
    Signal,
}

struct PendingArg {
    name: String,
    direction: Direction,
    ty: Type,
}

struct PendingMember {
    kind: MemberKind,
    name: String,
    args: Vec<PendingArg>,
}

pub struct Assembler<S: ObjectSink> {
    sink: S,
    object: Option<Object>,
    interface: Option<Interface>,
    member: Option<PendingMember>,
}

impl<S: ObjectSink> Assembler<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            object: None,
            interface: None,
            member: None,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Feeds a whole event stream, stopping at the first failure.
    pub fn feed_all<I: IntoIterator<Item = Event>>(&mut self, events: I) -> Result<()> {
        for event in events {
            self.feed(event)?;
        }
        Ok(())
    }

    pub fn feed(&mut self, event: Event) -> Result<()> {
        let label = event.label();
        match event {
            Event::ObjectOpen { path } => {
                if self.object.is_some() {
                    return Err(Error::UnexpectedEvent(label));
                }
                self.object = Some(Object::new(&path));
            }
            Event::InterfaceOpen { name } => {
                if self.object.is_none() || self.interface.is_some() {
                    return Err(Error::UnexpectedEvent(label));
                }
                self.interface = Some(Interface::new(&name));
            }
            Event::MethodOpen { name } => self.open_member(MemberKind::Method, name, label)?,
            Event::SignalOpen { name } => self.open_member(MemberKind::Signal, name, label)?,
            Event::Arg {
                name,
                signature,
                direction,
            } => {
                if self.member.is_none() {
                    return Err(Error::UnexpectedEvent(label));
                }
                let ty = match signature::parse(&signature) {
                    Ok(ty) => ty,
                    Err(err) => {
                        // The member is dropped as a whole.
                        self.member = None;
                        return Err(err);
                    }
                };
                let member = self
                    .member
                    .as_mut()
                    .ok_or(Error::UnexpectedEvent(label))?;
                let name = name.unwrap_or_else(|| format!("arg{}", member.args.len()));
                let direction = match member.kind {
                    MemberKind::Signal => Direction::In,
                    MemberKind::Method => direction.unwrap_or_default(),
                };
                member.args.push(PendingArg {
                    name,
                    direction,
                    ty,
                });
            }
            Event::MethodClose => self.close_member(MemberKind::Method, label)?,
            Event::SignalClose => self.close_member(MemberKind::Signal, label)?,
            Event::InterfaceClose => {
                if self.member.is_some() {
                    return Err(Error::UnexpectedEvent(label));
                }
                let interface = self.interface.take().ok_or(Error::UnexpectedEvent(label))?;
                let object = self.object.as_mut().ok_or(Error::UnexpectedEvent(label))?;
                if object.interfaces.contains_key(&interface.name) {
                    return Err(Error::DuplicateInterface(interface.name));
                }
                debug!(
                    "registered interface {} on {} ({} methods, {} signals)",
                    interface.name,
                    object.path,
                    interface.methods.len(),
                    interface.signals.len()
                );
                object.interfaces.insert(interface.name.clone(), interface);
            }
            Event::ObjectClose => {
                if self.interface.is_some() || self.member.is_some() {
                    return Err(Error::UnexpectedEvent(label));
                }
                let object = self.object.take().ok_or(Error::UnexpectedEvent(label))?;
                debug!("object {} complete", object.path);
                self.sink.object_complete(object)?;
            }
        }
        Ok(())
    }

    fn open_member(&mut self, kind: MemberKind, name: String, label: &'static str) -> Result<()> {
        if self.interface.is_none() || self.member.is_some() {
            return Err(Error::UnexpectedEvent(label));
        }
        self.member = Some(PendingMember {
            kind,
            name,
            args: Vec::new(),
        });
        Ok(())
    }

    fn close_member(&mut self, kind: MemberKind, label: &'static str) -> Result<()> {
        match &self.member {
            Some(member) if member.kind == kind => {}
            _ => return Err(Error::UnexpectedEvent(label)),
        }
        let PendingMember { name, args, .. } =
            self.member.take().ok_or(Error::UnexpectedEvent(label))?;
        let object_path = match &self.object {
            Some(object) => object.path.clone(),
            None => return Err(Error::UnexpectedEvent(label)),
        };
        let interface = self.interface.as_mut().ok_or(Error::UnexpectedEvent(label))?;
        if interface.has_member(&name) {
            return Err(Error::DuplicateMember {
                interface: interface.name.clone(),
                member: name,
            });
        }

        let attributes = args
            .into_iter()
            .map(|arg| Attribute::new(&interface.name, &name, &arg.name, arg.direction, arg.ty))
            .collect::<Vec<_>>();

        debug!(
            "registered {:?} {}.{} with {} arguments",
            kind,
            interface.name,
            name,
            attributes.len()
        );
        match kind {
            MemberKind::Method => {
                let method = Method {
                    name: name.clone(),
                    interface: interface.name.clone(),
                    attributes,
                };
                interface.methods.insert(name, method);
            }
            MemberKind::Signal => {
                let signal = Signal {
                    name: name.clone(),
                    interface: interface.name.clone(),
                    object_path,
                    attributes,
                };
                interface.signals.insert(name, signal);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::signature::BasicType;
    use test_log::test;

    pub(crate) fn arg(name: &str, signature: &str, direction: Option<Direction>) -> Event {
        Event::Arg {
            name: Some(name.to_owned()),
            signature: signature.to_owned(),
            direction,
        }
    }

    /// Object `/o` with interface `a.B` and the one method `M`.
    pub(crate) fn single_method(args: Vec<Event>) -> Vec<Event> {
        let mut events = vec![
            Event::ObjectOpen {
                path: "/o".to_owned(),
            },
            Event::InterfaceOpen {
                name: "a.B".to_owned(),
            },
            Event::MethodOpen {
                name: "M".to_owned(),
            },
        ];
        events.extend(args);
        events.extend(vec![
            Event::MethodClose,
            Event::InterfaceClose,
            Event::ObjectClose,
        ]);
        events
    }

    /// `/org/example/Calc` with interface `org.example.Calc`: methods
    /// `Add(in i x, in i y, out i sum)` and `Negate(in i x, out i result)`,
    /// signal `Overflow(s reason, a(ii) operands)`.
    pub(crate) fn calculator_events() -> Vec<Event> {
        vec![
            Event::ObjectOpen {
                path: "/org/example/Calc".to_owned(),
            },
            Event::InterfaceOpen {
                name: "org.example.Calc".to_owned(),
            },
            Event::MethodOpen {
                name: "Add".to_owned(),
            },
            arg("x", "i", Some(Direction::In)),
            arg("y", "i", Some(Direction::In)),
            arg("sum", "i", Some(Direction::Out)),
            Event::MethodClose,
            Event::MethodOpen {
                name: "Negate".to_owned(),
            },
            arg("x", "i", None),
            arg("result", "i", Some(Direction::Out)),
            Event::MethodClose,
            Event::SignalOpen {
                name: "Overflow".to_owned(),
            },
            arg("reason", "s", Some(Direction::Out)),
            arg("operands", "a(ii)", None),
            Event::SignalClose,
            Event::InterfaceClose,
            Event::ObjectClose,
        ]
    }

    pub(crate) fn assemble(events: Vec<Event>) -> Result<Vec<Object>> {
        let mut assembler = Assembler::new(Vec::new());
        assembler.feed_all(events)?;
        Ok(assembler.into_sink())
    }

    #[test]
    fn assembles_calculator() -> Result<()> {
        let objects = assemble(calculator_events())?;
        assert_eq!(objects.len(), 1);
        let object = &objects[0];
        assert_eq!(object.path, "/org/example/Calc");

        let interface = &object.interfaces["org.example.Calc"];
        assert_eq!(
            interface.methods.keys().collect::<Vec<_>>(),
            vec!["Add", "Negate"]
        );
        let add = &interface.methods["Add"];
        assert_eq!(add.inputs().count(), 2);
        assert_eq!(add.outputs().count(), 1);
        assert_eq!(add.attributes[2].qualified_name, "org_example_Calc_Add_sum");
        assert_eq!(
            add.attributes[0].ty,
            Type::Primitive(BasicType::Int32)
        );

        let overflow = &interface.signals["Overflow"];
        assert_eq!(overflow.object_path, "/org/example/Calc");
        assert!(overflow
            .attributes
            .iter()
            .all(|attr| attr.direction == Direction::In));
        assert_eq!(overflow.attributes[1].ty.to_string(), "a(ii)");
        Ok(())
    }

    #[test]
    fn same_argument_name_in_two_methods() -> Result<()> {
        let objects = assemble(calculator_events())?;
        let interface = &objects[0].interfaces["org.example.Calc"];
        let add_x = &interface.methods["Add"].attributes[0];
        let negate_x = &interface.methods["Negate"].attributes[0];
        assert_eq!(add_x.name, negate_x.name);
        assert_ne!(add_x.qualified_name, negate_x.qualified_name);
        Ok(())
    }

    #[test]
    fn unnamed_arguments_and_default_direction() -> Result<()> {
        let objects = assemble(vec![
            Event::ObjectOpen { path: "/".to_owned() },
            Event::InterfaceOpen { name: "a.B".to_owned() },
            Event::MethodOpen { name: "M".to_owned() },
            Event::Arg {
                name: None,
                signature: "s".to_owned(),
                direction: None,
            },
            Event::Arg {
                name: None,
                signature: "u".to_owned(),
                direction: Some(Direction::Out),
            },
            Event::MethodClose,
            Event::InterfaceClose,
            Event::ObjectClose,
        ])?;
        let method = &objects[0].interfaces["a.B"].methods["M"];
        assert_eq!(method.attributes[0].name, "arg0");
        assert_eq!(method.attributes[0].direction, Direction::In);
        assert_eq!(method.attributes[1].name, "arg1");
        assert_eq!(method.attributes[1].qualified_name, "a_B_M_arg1");
        Ok(())
    }

    #[test]
    fn bad_signature_drops_member() {
        let mut assembler = Assembler::new(Vec::new());
        let events = vec![
            Event::ObjectOpen { path: "/o".to_owned() },
            Event::InterfaceOpen { name: "a.B".to_owned() },
            Event::MethodOpen { name: "M".to_owned() },
            arg("ok", "i", None),
            arg("dict", "a{sv}", None),
        ];
        let err = assembler.feed_all(events).unwrap_err();
        assert!(matches!(err, Error::BadSignature { .. }));
        assert_eq!(
            assembler.feed(Event::MethodClose),
            Err(Error::UnexpectedEvent("method-close"))
        );
        assert!(assembler.sink().is_empty());
    }

    #[test]
    fn member_names_are_unique_across_kinds() {
        let events = vec![
            Event::ObjectOpen { path: "/o".to_owned() },
            Event::InterfaceOpen { name: "a.B".to_owned() },
            Event::MethodOpen { name: "Ping".to_owned() },
            Event::MethodClose,
            Event::SignalOpen { name: "Ping".to_owned() },
            Event::SignalClose,
        ];
        assert_eq!(
            assemble(events),
            Err(Error::DuplicateMember {
                interface: "a.B".to_owned(),
                member: "Ping".to_owned()
            })
        );
    }

    #[test]
    fn interface_names_are_unique() {
        let events = vec![
            Event::ObjectOpen { path: "/o".to_owned() },
            Event::InterfaceOpen { name: "a.B".to_owned() },
            Event::InterfaceClose,
            Event::InterfaceOpen { name: "a.B".to_owned() },
            Event::InterfaceClose,
        ];
        assert_eq!(
            assemble(events),
            Err(Error::DuplicateInterface("a.B".to_owned()))
        );
    }

    #[test]
    fn arguments_need_a_member() {
        let events = vec![
            Event::ObjectOpen { path: "/o".to_owned() },
            arg("x", "i", None),
        ];
        assert_eq!(assemble(events), Err(Error::UnexpectedEvent("argument")));
    }

    #[test]
    fn events_deserialize_from_json() -> Result<()> {
        let json = r#"[
            {"event": "object_open", "path": "/p"},
            {"event": "interface_open", "name": "x.Y"},
            {"event": "method_open", "name": "Get"},
            {"event": "arg", "name": "value", "signature": "v", "direction": "out"},
            {"event": "method_close"},
            {"event": "interface_close"},
            {"event": "object_close"}
        ]"#;
        let events: Vec<Event> = serde_json::from_str(json).expect("valid event stream");
        let objects = assemble(events)?;
        let get = &objects[0].interfaces["x.Y"].methods["Get"];
        assert_eq!(get.attributes[0].direction, Direction::Out);
        assert_eq!(get.attributes[0].ty, Type::Variant);
        Ok(())
    }
}
