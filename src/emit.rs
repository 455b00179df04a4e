use crate::assembler::{Assembler, Event, ObjectSink};
use crate::codegen::Compiler;
use crate::error::Result;
use crate::model::Object;

use log::debug;
use std::fs;
use std::path::Path;

pub mod c;
pub mod emitter_policy;

use c::Renderer;
use emitter_policy::{DefaultEmitterPolicy, EmitterPolicy};

/// The two files generated for one object.
#[derive(Clone, Debug, PartialEq)]
pub struct Artifacts {
    /// The object's C name, which both file names derive from.
    pub name: String,
    pub header: String,
    pub source: String,
}

impl Artifacts {
    pub fn header_file_name(&self) -> String {
        format!("{}.h", self.name)
    }

    pub fn source_file_name(&self) -> String {
        format!("{}.c", self.name)
    }

    /// Writes `<name>.h` and `<name>.c` into `dir`, replacing any earlier
    /// versions.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        fs::write(dir.join(self.header_file_name()), &self.header)?;
        fs::write(dir.join(self.source_file_name()), &self.source)?;
        debug!("wrote {} artifacts to {}", self.name, dir.display());
        Ok(())
    }
}

/// Compiles and renders every object it receives.
#[derive(Clone, Debug)]
pub struct Emitter<P: EmitterPolicy = DefaultEmitterPolicy> {
    policy: P,
    artifacts: Vec<Artifacts>,
}

impl Emitter<DefaultEmitterPolicy> {
    pub fn new() -> Self {
        Self::with_policy(DefaultEmitterPolicy)
    }
}

impl Default for Emitter<DefaultEmitterPolicy> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: EmitterPolicy> Emitter<P> {
    pub fn with_policy(policy: P) -> Self {
        Self {
            policy,
            artifacts: Vec::new(),
        }
    }

    pub fn artifacts(&self) -> &[Artifacts] {
        &self.artifacts
    }

    pub fn into_artifacts(self) -> Vec<Artifacts> {
        self.artifacts
    }

    pub fn emit(&self, object: &Object) -> Result<Artifacts> {
        let program = Compiler::compile_object(object)?;
        let renderer = Renderer::new(&self.policy, object, &program);
        Ok(Artifacts {
            name: object.c_name(),
            header: renderer.header()?,
            source: renderer.source()?,
        })
    }
}

impl<P: EmitterPolicy> ObjectSink for Emitter<P> {
    fn object_complete(&mut self, object: Object) -> Result<()> {
        let artifacts = self.emit(&object)?;
        debug!(
            "rendered {} ({} header lines, {} source lines)",
            object.path,
            artifacts.header.lines().count(),
            artifacts.source.lines().count()
        );
        self.artifacts.push(artifacts);
        Ok(())
    }
}

/// Runs an event stream through the assembler and renders every object
/// it declares under `policy`.
pub fn generate_with_policy<I, P>(events: I, policy: P) -> Result<Vec<Artifacts>>
where
    I: IntoIterator<Item = Event>,
    P: EmitterPolicy,
{
    let mut assembler = Assembler::new(Emitter::with_policy(policy));
    assembler.feed_all(events)?;
    Ok(assembler.into_sink().into_artifacts())
}

/// [`generate_with_policy`] with the [`DefaultEmitterPolicy`].
pub fn generate<I: IntoIterator<Item = Event>>(events: I) -> Result<Vec<Artifacts>> {
    generate_with_policy(events, DefaultEmitterPolicy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::tests::calculator_events;
    use crate::emit::emitter_policy::QualifiedTableEmitterPolicy;
    use tempfile::tempdir;
    use test_log::test;

    #[test]
    fn generates_one_pair_per_object() -> Result<()> {
        let mut events = calculator_events();
        events.extend(vec![
            Event::ObjectOpen { path: "/".to_owned() },
            Event::InterfaceOpen {
                name: "org.example.Root".to_owned(),
            },
            Event::SignalOpen {
                name: "Ready".to_owned(),
            },
            Event::SignalClose,
            Event::InterfaceClose,
            Event::ObjectClose,
        ]);
        let artifacts = generate(events)?;
        assert_eq!(
            artifacts.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            vec!["org_example_Calc", "root"]
        );
        assert_eq!(artifacts[1].header_file_name(), "root.h");
        assert!(artifacts[1].source.contains("#include \"root.h\""));
        // No methods, so no operation table for the user to fill in.
        assert!(!artifacts[1].header.contains("_ops {"));
        Ok(())
    }

    #[test]
    fn policy_reaches_the_renderer() -> Result<()> {
        let artifacts = generate_with_policy(calculator_events(), QualifiedTableEmitterPolicy)?;
        assert!(artifacts[0]
            .source
            .contains("{\"org_example_Calc_Negate_result\", CDBUS_DIRECTION_OUT, \"i\"}"));
        Ok(())
    }

    #[test]
    fn bad_signature_renders_nothing() {
        let mut events = calculator_events();
        events.insert(
            3,
            Event::Arg {
                name: Some("broken".to_owned()),
                signature: "{sv}".to_owned(),
                direction: None,
            },
        );
        assert!(generate(events).is_err());
    }

    #[test]
    fn writes_header_and_source() -> Result<()> {
        let dir = tempdir()?;
        let artifacts = generate(calculator_events())?;
        artifacts[0].write_to(dir.path())?;
        assert_eq!(
            fs::read_to_string(dir.path().join("org_example_Calc.h"))?,
            artifacts[0].header
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("org_example_Calc.c"))?,
            artifacts[0].source
        );
        Ok(())
    }
}
