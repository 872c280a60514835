//! Symbolic codec names bound to factories.
//!
//! Topology configs refer to codecs by name (`<node>.codec = line`); the
//! embedding application registers the factories behind those names. Every
//! connection gets its own codec instance.

use super::line::{LineDecoder, LineGenerator, SequencedLineGenerator, END_OF_STEP_MARKER};
use super::{Decoder, EchoScript, MessageGenerator, Script};
use crate::error::{PipelineError, PipelineResult};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

pub type GeneratorFactory = Arc<dyn Fn() -> Box<dyn MessageGenerator> + Send + Sync>;
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn Decoder> + Send + Sync>;
pub type ScriptFactory = Arc<dyn Fn() -> Box<dyn Script> + Send + Sync>;

#[derive(Clone, Default)]
pub struct CodecRegistry {
    generators: HashMap<String, GeneratorFactory>,
    decoders: HashMap<String, DecoderFactory>,
    scripts: HashMap<String, ScriptFactory>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.names())
            .finish()
    }
}

impl CodecRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `line`, `line-marked`, `seq` and `echo` codecs
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register_generator("line", || Box::new(LineGenerator::new()))
            .register_decoder("line", || Box::new(LineDecoder::new()))
            .register_generator("line-marked", || {
                Box::new(LineGenerator::new().with_end_marker(END_OF_STEP_MARKER))
            })
            .register_decoder("line-marked", || {
                Box::new(LineDecoder::new().with_end_marker(END_OF_STEP_MARKER))
            })
            .register_generator("seq", || Box::new(SequencedLineGenerator::new()))
            .register_decoder("seq", || Box::new(LineDecoder::new()))
            .register_script("echo", || Box::new(EchoScript));
        registry
    }

    pub fn register_generator<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn MessageGenerator> + Send + Sync + 'static,
    {
        self.generators.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_decoder<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Decoder> + Send + Sync + 'static,
    {
        self.decoders.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_script<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Script> + Send + Sync + 'static,
    {
        self.scripts.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn generator(&self, name: &str) -> PipelineResult<Box<dyn MessageGenerator>> {
        self.generators
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| PipelineError::UnknownCodec(name.to_string()))
    }

    /// One generator per connection, in connection order.
    pub fn generators(&self, name: &str, count: usize) -> PipelineResult<Vec<Box<dyn MessageGenerator>>> {
        (0..count).map(|_| self.generator(name)).collect()
    }

    pub fn decoder(&self, name: &str) -> PipelineResult<Box<dyn Decoder>> {
        self.decoders
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| PipelineError::UnknownCodec(name.to_string()))
    }

    pub fn decoders(&self, name: &str, count: usize) -> PipelineResult<Vec<Box<dyn Decoder>>> {
        (0..count).map(|_| self.decoder(name)).collect()
    }

    pub fn script(&self, name: &str) -> PipelineResult<Box<dyn Script>> {
        self.scripts
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| PipelineError::UnknownCodec(name.to_string()))
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.generators
            .keys()
            .chain(self.decoders.keys())
            .chain(self.scripts.keys())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameBuffer;

    #[test]
    fn test_builtins() {
        let registry = CodecRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["echo", "line", "line-marked", "seq"]);
        assert!(registry.generator("seq").is_ok());
        assert!(registry.decoder("line-marked").is_ok());
        assert!(registry.script("echo").is_ok());
    }

    #[test]
    fn test_unknown_codec() {
        let registry = CodecRegistry::new();
        let err = registry.decoder("fix").err().unwrap();
        assert!(matches!(err, PipelineError::UnknownCodec(name) if name == "fix"));
    }

    #[test]
    fn test_generators_are_independent_instances() {
        let registry = CodecRegistry::with_builtins();
        let mut generators = registry.generators("seq", 2).unwrap();
        let mut buf = FrameBuffer::default();

        generators[0].write("a", &mut buf, false).unwrap();
        generators[0].write("b", &mut buf, false).unwrap();
        buf.clear();
        generators[1].write("c", &mut buf, false).unwrap();
        assert_eq!(buf.as_slice(), b"1|c\n");
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = CodecRegistry::new();
        registry.register_generator("upper", || Box::new(LineGenerator::new()));
        assert_eq!(registry.names(), vec!["upper"]);
        assert_eq!(registry.generators("upper", 3).unwrap().len(), 3);
    }
}
