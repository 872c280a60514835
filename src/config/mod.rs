//! Topology configuration.
//!
//! A topology is described by layers (head first), each holding named nodes.
//! Three file formats are accepted, chosen by extension:
//!
//! - `.toml` and `.json` - a serialized [`TopologyConfig`]
//! - anything else - a property file (see [`properties`])
//!
//! Several property files can be layered; later files override earlier keys.
//!
//! # Property keys
//!
//! ```text
//! layers                        = consumers, producers
//! stepSettleMillis              = 0
//! <layer>.nodes                 = c1
//! <layer>.stepSettleMillis      = 0
//! <node>.type                   = producer | consumer | external-process
//! <node>.address                = localhost:9000
//! <node>.clients|connections    = 1
//! <node>.directory              = data/in
//! <node>.files                  = a.txt, b.txt
//! <node>.codec                  = line
//! <node>.sendAtTimestamps       = false
//! <node>.settleMillis           = 0
//! <node>.connectAttempts        = 10
//! <node>.connectBackoffMillis   = 100
//! <node>.pollMillis             = 50
//! <node>.command                = java
//! <node>.args                   = -jar server.jar
//! <node>.workingDirectory       = .
//! <node>.logFile                = logs/server.log.
//! <node>.startupDelayMillis     = 0
//! <node>.shutdownTimeoutMillis  = 5000
//! ```
//!
//! The step list is the `files` list of the first node that declares one.
//!
//! # Example
//!
//! ```ignore
//! use msgpipe_rs::codec::CodecRegistry;
//! use msgpipe_rs::config::TopologyConfig;
//!
//! let config = TopologyConfig::load_all(&["topology.properties", "local.properties"])?;
//! let topology = config.build(&CodecRegistry::with_builtins())?;
//! let report = topology.run();
//! ```

pub mod properties;

pub use properties::Properties;

use crate::codec::CodecRegistry;
use crate::error::{PipelineError, PipelineResult};
use crate::layer::Layer;
use crate::node::{
    AnyNode, ConsumerConfig, ConsumerNode, ExternalProcessNode, ProcessConfig, ProducerConfig,
    ProducerNode,
};
use crate::step::Step;
use crate::topology::Topology;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Codec used when a node does not name one.
pub const DEFAULT_CODEC: &str = "line";

/// Default external process shutdown timeout in milliseconds
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// Whole-run description, layers head first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyConfig {
    /// Settling delay before each step, for layers without their own
    #[serde(default)]
    pub step_settle_millis: u64,

    pub layers: Vec<LayerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_settle_millis: Option<u64>,

    pub nodes: Vec<NodeConfig>,
}

/// One node, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NodeConfig {
    Producer(ProducerSettings),
    Consumer(ConsumerSettings),
    ExternalProcess(ProcessSettings),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSettings {
    pub name: String,
    pub address: String,

    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    #[serde(default, deserialize_with = "string_or_list")]
    pub files: Vec<String>,

    /// Peer count; zero or less means "one per codec"
    #[serde(default)]
    pub clients: i64,

    #[serde(default = "default_codec", deserialize_with = "string_or_list")]
    pub codec: Vec<String>,

    #[serde(default)]
    pub send_at_timestamps: bool,

    #[serde(default)]
    pub settle_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSettings {
    pub name: String,
    pub address: String,

    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    #[serde(default, deserialize_with = "string_or_list")]
    pub files: Vec<String>,

    /// Connection count; zero or less means "one per codec"
    #[serde(default)]
    pub connections: i64,

    #[serde(default = "default_codec", deserialize_with = "string_or_list")]
    pub codec: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_backoff_millis: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_millis: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSettings {
    pub name: String,
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    #[serde(default, deserialize_with = "string_or_list")]
    pub files: Vec<String>,

    #[serde(default)]
    pub startup_delay_millis: u64,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_millis: u64,
}

fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_codec() -> Vec<String> {
    vec![DEFAULT_CODEC.to_string()]
}

fn default_shutdown_timeout() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

/// Accept either `"a, b"` or `["a", "b"]`.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => properties::split_list(&value),
        OneOrMany::Many(values) => values,
    })
}

/// Number of connections for a node: the configured count, or one per codec.
fn connection_count(configured: i64, codecs: usize) -> usize {
    if configured > 0 {
        configured as usize
    } else {
        codecs.max(1)
    }
}

/// Expand a codec list to `count` entries: one name is shared by all
/// connections, otherwise the list must match connection for connection.
fn expand_codecs(node: &str, codecs: &[String], count: usize) -> PipelineResult<Vec<String>> {
    match codecs {
        [] => Ok(vec![DEFAULT_CODEC.to_string(); count]),
        [single] => Ok(vec![single.clone(); count]),
        list if list.len() == count => Ok(list.to_vec()),
        list => Err(PipelineError::Config(format!(
            "Node '{}' has {} connections but {} codecs",
            node,
            count,
            list.len()
        ))),
    }
}

impl NodeConfig {
    pub fn name(&self) -> &str {
        match self {
            NodeConfig::Producer(s) => &s.name,
            NodeConfig::Consumer(s) => &s.name,
            NodeConfig::ExternalProcess(s) => &s.name,
        }
    }

    pub fn files(&self) -> &[String] {
        match self {
            NodeConfig::Producer(s) => &s.files,
            NodeConfig::Consumer(s) => &s.files,
            NodeConfig::ExternalProcess(s) => &s.files,
        }
    }

    /// Instantiate the node, resolving codec names through `registry`.
    pub fn build(&self, registry: &CodecRegistry) -> PipelineResult<AnyNode> {
        match self {
            NodeConfig::Producer(s) => {
                let count = connection_count(s.clients, s.codec.len());
                let generators = expand_codecs(&s.name, &s.codec, count)?
                    .iter()
                    .map(|codec| registry.generator(codec))
                    .collect::<PipelineResult<Vec<_>>>()?;
                let config = ProducerConfig::new(&s.address, &s.directory)
                    .with_send_at_timestamps(s.send_at_timestamps)
                    .with_settle(Duration::from_millis(s.settle_millis));
                Ok(ProducerNode::new(&s.name, config, generators)?.into())
            }
            NodeConfig::Consumer(s) => {
                let count = connection_count(s.connections, s.codec.len());
                let decoders = expand_codecs(&s.name, &s.codec, count)?
                    .iter()
                    .map(|codec| registry.decoder(codec))
                    .collect::<PipelineResult<Vec<_>>>()?;
                let mut config = ConsumerConfig::new(&s.address, &s.directory);
                if let Some(attempts) = s.connect_attempts {
                    config.connect_attempts = attempts;
                }
                if let Some(backoff) = s.connect_backoff_millis {
                    config.connect_backoff = Duration::from_millis(backoff);
                }
                if let Some(poll) = s.poll_millis {
                    config.poll_interval = Duration::from_millis(poll.max(1));
                }
                Ok(ConsumerNode::new(&s.name, config, decoders)?.into())
            }
            NodeConfig::ExternalProcess(s) => {
                let mut config = ProcessConfig::new(&s.command)
                    .with_args(s.args.iter().cloned())
                    .with_shutdown_timeout(Duration::from_millis(s.shutdown_timeout_millis));
                config.working_dir = s.working_directory.clone();
                config.log_file = s.log_file.clone();
                config.startup_delay = Duration::from_millis(s.startup_delay_millis);
                Ok(ExternalProcessNode::new(&s.name, config).into())
            }
        }
    }

    fn from_properties(name: &str, props: &Properties) -> PipelineResult<Self> {
        let key = |suffix: &str| format!("{}.{}", name, suffix);
        let node_type = props.require(&key("type"))?;
        let files = props.list(&key("files"));
        let directory = props
            .get(&key("directory"))
            .map(PathBuf::from)
            .unwrap_or_else(default_directory);
        let codec = match props.list(&key("codec")) {
            codecs if codecs.is_empty() => default_codec(),
            codecs => codecs,
        };

        let node = match node_type {
            "producer" => NodeConfig::Producer(ProducerSettings {
                name: name.to_string(),
                address: props.require(&key("address"))?.to_string(),
                directory,
                files,
                clients: count_key(props, name)?,
                codec,
                send_at_timestamps: props.parsed(&key("sendAtTimestamps"))?.unwrap_or(false),
                settle_millis: props.parsed(&key("settleMillis"))?.unwrap_or(0),
            }),
            "consumer" => NodeConfig::Consumer(ConsumerSettings {
                name: name.to_string(),
                address: props.require(&key("address"))?.to_string(),
                directory,
                files,
                connections: count_key(props, name)?,
                codec,
                connect_attempts: props.parsed(&key("connectAttempts"))?,
                connect_backoff_millis: props.parsed(&key("connectBackoffMillis"))?,
                poll_millis: props.parsed(&key("pollMillis"))?,
            }),
            "external-process" => NodeConfig::ExternalProcess(ProcessSettings {
                name: name.to_string(),
                command: props.require(&key("command"))?.to_string(),
                args: props.words(&key("args")),
                working_directory: props.get(&key("workingDirectory")).map(PathBuf::from),
                log_file: props.get(&key("logFile")).map(PathBuf::from),
                files,
                startup_delay_millis: props.parsed(&key("startupDelayMillis"))?.unwrap_or(0),
                shutdown_timeout_millis: props
                    .parsed(&key("shutdownTimeoutMillis"))?
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            }),
            other => {
                return Err(PipelineError::Config(format!(
                    "Node '{}' has unknown type '{}'",
                    name, other
                )))
            }
        };
        Ok(node)
    }
}

/// `<node>.clients`, falling back to `<node>.connections`.
fn count_key(props: &Properties, name: &str) -> PipelineResult<i64> {
    let clients: Option<i64> = props.parsed(&format!("{}.clients", name))?;
    let connections: Option<i64> = props.parsed(&format!("{}.connections", name))?;
    Ok(clients.or(connections).unwrap_or(0))
}

impl TopologyConfig {
    /// Load one file, dispatching on its extension.
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => {
                let content = read(path)?;
                toml::from_str(&content).map_err(|e| {
                    PipelineError::Config(format!("Failed to parse {:?}: {}", path, e))
                })
            }
            Some("json") => {
                let content = read(path)?;
                serde_json::from_str(&content).map_err(|e| {
                    PipelineError::Config(format!("Failed to parse {:?}: {}", path, e))
                })
            }
            _ => Self::from_properties(&Properties::load(path)?),
        }
    }

    /// Load several files. Property files are merged in order; a TOML or
    /// JSON file must be the only one given.
    pub fn load_all<P: AsRef<Path>>(paths: &[P]) -> PipelineResult<Self> {
        let is_structured = |p: &Path| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("toml") | Some("json")
            )
        };

        match paths {
            [] => Err(PipelineError::Config("No configuration files given".to_string())),
            [single] => Self::load(single),
            many if many.iter().any(|p| is_structured(p.as_ref())) => Err(PipelineError::Config(
                "TOML and JSON topologies cannot be merged with other files".to_string(),
            )),
            many => {
                let mut merged = Properties::new();
                for path in many {
                    let path = path.as_ref();
                    tracing::debug!("Loading properties from {:?}", path);
                    merged.merge(Properties::load(path)?);
                }
                Self::from_properties(&merged)
            }
        }
    }

    pub fn from_properties(props: &Properties) -> PipelineResult<Self> {
        let layers = props
            .list("layers")
            .into_iter()
            .map(|layer| -> PipelineResult<LayerConfig> {
                let nodes = props
                    .list(&format!("{}.nodes", layer))
                    .iter()
                    .map(|node| NodeConfig::from_properties(node, props))
                    .collect::<PipelineResult<Vec<_>>>()?;
                Ok(LayerConfig {
                    step_settle_millis: props.parsed(&format!("{}.stepSettleMillis", layer))?,
                    name: layer,
                    nodes,
                })
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        let config = Self {
            step_settle_millis: props.parsed("stepSettleMillis")?.unwrap_or(0),
            layers,
        };
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not need the codec registry.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.layers.is_empty() {
            return Err(PipelineError::Config("No layers configured".to_string()));
        }
        let mut seen = HashSet::new();
        for layer in &self.layers {
            if layer.nodes.is_empty() {
                return Err(PipelineError::Config(format!(
                    "Layer '{}' has no nodes",
                    layer.name
                )));
            }
            for node in &layer.nodes {
                if !seen.insert(node.name()) {
                    return Err(PipelineError::Config(format!(
                        "Duplicate node name '{}'",
                        node.name()
                    )));
                }
            }
        }
        self.steps().map(|_| ())
    }

    /// The run's step sequence.
    pub fn steps(&self) -> PipelineResult<Vec<Step>> {
        let mut declared = self
            .layers
            .iter()
            .flat_map(|layer| &layer.nodes)
            .filter(|node| !node.files().is_empty());

        let Some(first) = declared.next() else {
            return Ok(Vec::new());
        };
        if let Some(other) = declared.find(|node| node.files() != first.files()) {
            return Err(PipelineError::Config(format!(
                "Nodes '{}' and '{}' declare different file lists",
                first.name(),
                other.name()
            )));
        }
        Ok(first.files().iter().map(|f| Step::new(f.as_str())).collect())
    }

    /// Build a runnable topology.
    pub fn build(&self, registry: &CodecRegistry) -> PipelineResult<Topology> {
        self.validate()?;
        let steps = self.steps()?;

        let layers = self
            .layers
            .iter()
            .map(|layer| -> PipelineResult<Layer> {
                let nodes = layer
                    .nodes
                    .iter()
                    .map(|node| node.build(registry))
                    .collect::<PipelineResult<Vec<_>>>()?;
                let settle = layer.step_settle_millis.unwrap_or(self.step_settle_millis);
                Ok(Layer::new(&layer.name, nodes).with_settle(Duration::from_millis(settle)))
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        tracing::info!(
            "Built topology: {} layers, {} steps",
            layers.len(),
            steps.len()
        );
        Topology::new(layers, steps)
    }
}

fn read(path: &Path) -> PipelineResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Config(format!("Failed to read {:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
layers = consumers, producers
stepSettleMillis = 5
consumers.nodes = c1
consumers.stepSettleMillis = 0
producers.nodes = p1
c1.type = consumer
c1.address = localhost:9000
c1.directory = out
c1.files = a.txt, b.txt
p1.type = producer
p1.address = localhost:9000
p1.directory = in
p1.clients = 2
p1.codec = seq, line
p1.files = a.txt, b.txt
p1.unknownKey = ignored
";

    #[test]
    fn test_properties_to_config() {
        let config = TopologyConfig::from_properties(&Properties::parse(SAMPLE)).unwrap();
        assert_eq!(config.step_settle_millis, 5);
        assert_eq!(config.layers.len(), 2);
        assert_eq!(config.layers[0].step_settle_millis, Some(0));
        assert_eq!(config.layers[1].step_settle_millis, None);

        match &config.layers[1].nodes[0] {
            NodeConfig::Producer(p) => {
                assert_eq!(p.clients, 2);
                assert_eq!(p.codec, vec!["seq", "line"]);
                assert_eq!(p.directory, PathBuf::from("in"));
            }
            other => panic!("unexpected node {:?}", other),
        }
        assert_eq!(
            config.steps().unwrap(),
            vec![Step::new("a.txt"), Step::new("b.txt")]
        );
    }

    #[test]
    fn test_mismatched_file_lists() {
        let mut props = Properties::parse(SAMPLE);
        props.set("c1.files", "a.txt");
        let err = TopologyConfig::from_properties(&props).unwrap_err();
        assert!(err.to_string().contains("different file lists"));
    }

    #[test]
    fn test_unknown_type() {
        let mut props = Properties::parse(SAMPLE);
        props.set("c1.type", "broker");
        assert!(TopologyConfig::from_properties(&props).is_err());
    }

    #[test]
    fn test_connection_count_defaults() {
        assert_eq!(connection_count(0, 1), 1);
        assert_eq!(connection_count(-3, 0), 1);
        assert_eq!(connection_count(-1, 2), 2);
        assert_eq!(connection_count(3, 1), 3);
    }

    #[test]
    fn test_expand_codecs() {
        let one = vec!["seq".to_string()];
        assert_eq!(expand_codecs("p", &one, 2).unwrap(), vec!["seq", "seq"]);
        let two = vec!["seq".to_string(), "line".to_string()];
        assert_eq!(expand_codecs("p", &two, 2).unwrap(), two);
        assert!(expand_codecs("p", &two, 3).is_err());
    }

    #[test]
    fn test_process_keys() {
        let props = Properties::parse(
            "layers = sut\n\
             sut.nodes = jvm\n\
             jvm.type = external-process\n\
             jvm.command = java\n\
             jvm.args = -Xmx1g -jar server.jar\n\
             jvm.logFile = logs/server.log.\n",
        );
        let config = TopologyConfig::from_properties(&props).unwrap();
        match &config.layers[0].nodes[0] {
            NodeConfig::ExternalProcess(p) => {
                assert_eq!(p.args, vec!["-Xmx1g", "-jar", "server.jar"]);
                assert_eq!(p.shutdown_timeout_millis, DEFAULT_SHUTDOWN_TIMEOUT_MS);
                assert_eq!(p.log_file, Some(PathBuf::from("logs/server.log.")));
            }
            other => panic!("unexpected node {:?}", other),
        }
        assert!(config.steps().unwrap().is_empty());
    }

    #[test]
    fn test_toml_topology() {
        let config: TopologyConfig = toml::from_str(
            r#"
            stepSettleMillis = 10

            [[layers]]
            name = "consumers"

            [[layers.nodes]]
            type = "consumer"
            name = "c1"
            address = "127.0.0.1:9100"
            files = "x.txt"

            [[layers]]
            name = "producers"

            [[layers.nodes]]
            type = "producer"
            name = "p1"
            address = "127.0.0.1:9100"
            codec = ["seq", "seq"]
            files = ["x.txt"]
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.steps().unwrap(), vec![Step::new("x.txt")]);
        match &config.layers[1].nodes[0] {
            NodeConfig::Producer(p) => {
                assert_eq!(connection_count(p.clients, p.codec.len()), 2);
                assert_eq!(p.directory, PathBuf::from("."));
            }
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_json_round_trip() {
        let config = TopologyConfig::from_properties(&Properties::parse(SAMPLE)).unwrap();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: TopologyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_build_resolves_codecs() {
        let config = TopologyConfig::from_properties(&Properties::parse(SAMPLE)).unwrap();
        let topology = config.build(&CodecRegistry::with_builtins()).unwrap();
        assert_eq!(topology.layers().len(), 2);
        assert_eq!(topology.steps().len(), 2);

        let err = config.build(&CodecRegistry::new()).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownCodec(_)));
    }
}
