//! Builders for network nodes wired to each other on loopback

use msgpipe_rs::codec::CodecRegistry;
use msgpipe_rs::node::{ConsumerConfig, ConsumerNode, ProducerConfig, ProducerNode};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Builder for a producer bound to an ephemeral loopback port
pub struct ProducerBuilder {
    name: String,
    codecs: Vec<String>,
    send_at_timestamps: bool,
}

impl ProducerBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            codecs: vec!["line".to_string()],
            send_at_timestamps: false,
        }
    }

    /// One peer per codec
    pub fn codecs(mut self, codecs: &[&str]) -> Self {
        self.codecs = codecs.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn send_at_timestamps(mut self, enabled: bool) -> Self {
        self.send_at_timestamps = enabled;
        self
    }

    /// Build with built-in codecs; returns the node and its bound address
    pub fn build(self, directory: &Path) -> (ProducerNode, SocketAddr) {
        self.build_with(directory, &CodecRegistry::with_builtins())
    }

    pub fn build_with(self, directory: &Path, registry: &CodecRegistry) -> (ProducerNode, SocketAddr) {
        let generators = self
            .codecs
            .iter()
            .map(|c| registry.generator(c).expect("known codec"))
            .collect();
        let config = ProducerConfig::new("127.0.0.1:0", directory)
            .with_send_at_timestamps(self.send_at_timestamps);
        let mut node = ProducerNode::new(&self.name, config, generators).expect("producer");
        let addr = node.bind_now().expect("bind producer");
        (node, addr)
    }
}

/// Consumer reading from `address` with fast test timings
pub fn consumer(
    name: &str,
    address: impl ToString,
    out_dir: &Path,
    codec: &str,
    connections: usize,
) -> ConsumerNode {
    let decoders = CodecRegistry::with_builtins()
        .decoders(codec, connections)
        .expect("known codec");
    let config = ConsumerConfig::new(address.to_string(), out_dir)
        .with_connect(20, Duration::from_millis(10))
        .with_poll_interval(Duration::from_millis(50));
    ConsumerNode::new(name, config, decoders).expect("consumer")
}
