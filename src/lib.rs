//! Marshalling glue for DBus introspection data.
//!
//! This crate turns the declarations of a DBus introspection document
//! (objects, interfaces, methods, signals, and the wire-type signature of
//! every argument) into the code that moves those arguments in and out of
//! messages: procedures that encode native values into the DBus wire
//! format, procedures that decode them back, procedures that free what
//! decoding allocated, and the tables that bind it all to member names.
//!
//! The pipeline, leaves first:
//!
//! * [`signature`] parses a signature such as `a(iv)` into a [`Type`]
//!   tree. Dictionary entries are not supported and are rejected.
//! * [`assembler`] consumes a stream of introspection [`Event`]s and
//!   builds [`model::Object`]s, parsing each argument as it arrives.
//! * [`codegen`] compiles every argument into declare, encode, decode and
//!   release bodies over the message iterator primitives, plus a method
//!   proxy or signal emitter per member. The result is a
//!   [`codegen::ir::Program`], which [`codegen::machine`] can run directly
//!   against the in-memory [`wire`] format.
//! * [`emit`] renders programs as a C header and source file against
//!   libdbus. What the output looks like can be configured through the
//!   [`emitter_policy`] module, by calling [`generate_with_policy`]
//!   instead of [`generate`].
//!
//! Decoding is permissive: an element of the wrong type leaves its
//! variable at its default and decoding moves on to the next one.
//! Encoding is strict: a variant holding anything but a basic value
//! fails the encode.
//!
//! [`Type`]: crate::signature::Type
//! [`Event`]: crate::assembler::Event
//! [`emitter_policy`]: crate::emit::emitter_policy
//! [`generate`]: crate::emit::generate()
//! [`generate_with_policy`]: crate::emit::generate_with_policy()

pub mod assembler;
pub mod codegen;
pub mod emit;
pub mod error;
pub mod message;
pub mod model;
mod primitives;
pub mod signature;
pub mod wire;

pub use emit::{generate, generate_with_policy, Artifacts};
pub use primitives::BasicValue;
