//! # msgpipe-rs: Staged Message Replay Pipeline
//!
//! A test harness that replays recorded message streams from disk into TCP
//! services and captures their responses, one replay file (a *step*) at a
//! time. Every part of the pipeline advances through the steps in lockstep,
//! so each step has a well-defined start and end for measurement and
//! comparison.
//!
//! ## Architecture
//!
//! - **Topology**: the driver thread; walks the step list through an ordered
//!   chain of layers
//! - **Layer**: a group of nodes sharing a `batchStart` / `batchEnd` barrier
//!   pair
//! - **Node**: one worker thread per node - producer (replays files into
//!   accepted peers), consumer (captures responses into per-step files) or
//!   external process (a service under test kept alive for the run)
//! - **Codec**: message framing supplied by the embedding application through
//!   a [`CodecRegistry`]
//! - **Communication**: crossbeam channels for step queues and node faults
//!
//! ## Step protocol
//!
//! For each step the driver admits the step head to tail (queue on every node,
//! arrive at `batchStart`) and then releases it tail to head (signal step end,
//! arrive at `batchEnd`). The head layer's step window therefore encloses all
//! others. Put the layer that has to see the whole step's traffic at the head:
//!
//! ```text
//! consumers (head) ─► service under test ─► producers (tail)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use msgpipe_rs::{CodecRegistry, TopologyConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = TopologyConfig::load("topology.toml")?;
//!     let topology = config.build(&CodecRegistry::with_builtins())?;
//!
//!     let report = topology.run();
//!     println!("{}", serde_json::to_string_pretty(&report)?);
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod layer;
pub mod node;
pub mod step;
pub mod sync;
pub mod topology;

// Re-export commonly used types
pub use codec::{CodecRegistry, Decoder, FrameBuffer, MessageGenerator, Script};
pub use config::TopologyConfig;
pub use error::{PipelineError, PipelineResult, ResultExt};
pub use layer::Layer;
pub use node::{AnyNode, NodePlugin, NodeReport};
pub use step::Step;
pub use sync::StepBarrier;
pub use topology::{FinishHandle, RunReport, Topology};
