//! Node abstraction for the pipeline.
//!
//! Two-layer design:
//! - **`NodePlugin` trait** - for nodes supplied by the embedding application
//!   (and test doubles).
//! - **`BuiltinNode` enum** - producer, consumer and external process, with
//!   match-arm dispatch instead of a trait object.
//!
//! `AnyNode` wraps either variant so layers handle both uniformly.
//!
//! Nodes only implement lifecycle hooks. Barrier participation belongs to the
//! [`NodeRunner`], so no hook can skip an arrival:
//!
//! ```text
//! on_start ─► [ before_step ─► batchStart ─► on_step ─► batchEnd ─► after_step ]* ─► on_finish
//! ```

pub mod consumer;
pub mod process;
pub mod producer;
pub mod runner;

pub use consumer::{ConsumerConfig, ConsumerNode};
pub use process::{ExternalProcessNode, ProcessConfig};
pub use producer::{ProducerConfig, ProducerNode};
pub use runner::{FaultScope, NodeFault, NodeRunner};

use crate::error::PipelineResult;
use crate::step::Step;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Context passed to node-level hooks.
pub struct NodeContext<'a> {
    pub node: &'a str,
    /// Cleared when the run is being torn down.
    pub running: &'a Arc<AtomicBool>,
}

impl NodeContext<'_> {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Context passed to per-step hooks.
pub struct StepContext<'a> {
    pub node: &'a str,
    pub step: &'a Step,
    /// Position of the step in the run (0-based).
    pub index: usize,
    /// Set by the layer once the step's work should wrap up.
    pub step_end: &'a AtomicBool,
    pub running: &'a Arc<AtomicBool>,
}

impl StepContext<'_> {
    pub fn step_end_signaled(&self) -> bool {
        self.step_end.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Trait for nodes supplied by the embedding application.
pub trait NodePlugin: Send {
    /// Stable name of this node.
    fn name(&self) -> &str;

    /// Called once on the node's thread before the first step.
    fn on_start(&mut self, _ctx: &NodeContext) -> PipelineResult<()> {
        Ok(())
    }

    /// Called before `batchStart`. An error here is fatal for the run.
    fn before_step(&mut self, _ctx: &StepContext) -> PipelineResult<()> {
        Ok(())
    }

    /// The step's work, between `batchStart` and `batchEnd`.
    fn on_step(&mut self, ctx: &StepContext) -> PipelineResult<()>;

    /// Called after `batchEnd`.
    fn after_step(&mut self, _ctx: &StepContext) {}

    /// Called once when the run loop exits, also after failures.
    fn on_finish(&mut self, _ctx: &NodeContext) -> PipelineResult<()> {
        Ok(())
    }
}

/// Enum dispatch for built-in nodes.
pub enum BuiltinNode {
    Producer(ProducerNode),
    Consumer(ConsumerNode),
    ExternalProcess(ExternalProcessNode),
}

impl BuiltinNode {
    pub fn name(&self) -> &str {
        match self {
            BuiltinNode::Producer(n) => n.name(),
            BuiltinNode::Consumer(n) => n.name(),
            BuiltinNode::ExternalProcess(n) => n.name(),
        }
    }

    pub fn on_start(&mut self, ctx: &NodeContext) -> PipelineResult<()> {
        match self {
            BuiltinNode::Producer(n) => n.on_start(ctx),
            BuiltinNode::Consumer(n) => n.on_start(ctx),
            BuiltinNode::ExternalProcess(n) => n.on_start(ctx),
        }
    }

    pub fn before_step(&mut self, ctx: &StepContext) -> PipelineResult<()> {
        match self {
            BuiltinNode::Producer(_) | BuiltinNode::Consumer(_) => Ok(()),
            BuiltinNode::ExternalProcess(n) => n.before_step(ctx),
        }
    }

    pub fn on_step(&mut self, ctx: &StepContext) -> PipelineResult<()> {
        match self {
            BuiltinNode::Producer(n) => n.on_step(ctx),
            BuiltinNode::Consumer(n) => n.on_step(ctx),
            BuiltinNode::ExternalProcess(n) => n.on_step(ctx),
        }
    }

    pub fn after_step(&mut self, ctx: &StepContext) {
        match self {
            BuiltinNode::Producer(n) => n.after_step(ctx),
            BuiltinNode::Consumer(_) | BuiltinNode::ExternalProcess(_) => {}
        }
    }

    pub fn on_finish(&mut self, ctx: &NodeContext) -> PipelineResult<()> {
        match self {
            BuiltinNode::Producer(n) => n.on_finish(ctx),
            BuiltinNode::Consumer(n) => n.on_finish(ctx),
            BuiltinNode::ExternalProcess(n) => n.on_finish(ctx),
        }
    }
}

/// Wrapper that holds either a built-in node or a plugin.
pub enum AnyNode {
    Builtin(BuiltinNode),
    Plugin(Box<dyn NodePlugin>),
}

impl AnyNode {
    pub fn name(&self) -> &str {
        match self {
            AnyNode::Builtin(n) => n.name(),
            AnyNode::Plugin(n) => n.name(),
        }
    }

    pub fn on_start(&mut self, ctx: &NodeContext) -> PipelineResult<()> {
        match self {
            AnyNode::Builtin(n) => n.on_start(ctx),
            AnyNode::Plugin(n) => n.on_start(ctx),
        }
    }

    pub fn before_step(&mut self, ctx: &StepContext) -> PipelineResult<()> {
        match self {
            AnyNode::Builtin(n) => n.before_step(ctx),
            AnyNode::Plugin(n) => n.before_step(ctx),
        }
    }

    pub fn on_step(&mut self, ctx: &StepContext) -> PipelineResult<()> {
        match self {
            AnyNode::Builtin(n) => n.on_step(ctx),
            AnyNode::Plugin(n) => n.on_step(ctx),
        }
    }

    pub fn after_step(&mut self, ctx: &StepContext) {
        match self {
            AnyNode::Builtin(n) => n.after_step(ctx),
            AnyNode::Plugin(n) => n.after_step(ctx),
        }
    }

    pub fn on_finish(&mut self, ctx: &NodeContext) -> PipelineResult<()> {
        match self {
            AnyNode::Builtin(n) => n.on_finish(ctx),
            AnyNode::Plugin(n) => n.on_finish(ctx),
        }
    }
}

impl From<ProducerNode> for AnyNode {
    fn from(node: ProducerNode) -> Self {
        AnyNode::Builtin(BuiltinNode::Producer(node))
    }
}

impl From<ConsumerNode> for AnyNode {
    fn from(node: ConsumerNode) -> Self {
        AnyNode::Builtin(BuiltinNode::Consumer(node))
    }
}

impl From<ExternalProcessNode> for AnyNode {
    fn from(node: ExternalProcessNode) -> Self {
        AnyNode::Builtin(BuiltinNode::ExternalProcess(node))
    }
}

impl From<Box<dyn NodePlugin>> for AnyNode {
    fn from(node: Box<dyn NodePlugin>) -> Self {
        AnyNode::Plugin(node)
    }
}

/// What a node thread reports when it is joined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub layer: String,
    pub node: String,
    pub steps_completed: usize,
    /// First error that ended the node, if any.
    pub error: Option<String>,
}

impl NodeReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
