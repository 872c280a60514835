//! A layer: a group of nodes sharing one `batchStart` / `batchEnd` pair.
//!
//! The driver moves a step through a layer in two halves:
//!
//! - [`Layer::admit`] queues the step on every node and arrives at
//!   `batchStart`, releasing the nodes into the step.
//! - [`Layer::release`] signals step end (and finish on the last step) and
//!   arrives at `batchEnd`, which returns once every node is done.
//!
//! The [`Topology`](crate::topology::Topology) calls `admit` head to tail and
//! `release` tail to head.

use crate::error::{PipelineError, PipelineResult};
use crate::node::{AnyNode, NodeFault, NodeReport, NodeRunner};
use crate::step::{step_queue, NodeControl, Step};
use crate::sync::LayerBarriers;
use crossbeam_channel::Sender;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct Layer {
    name: String,
    /// Nodes not yet started
    pending: Vec<AnyNode>,
    node_names: Vec<String>,
    controls: Vec<NodeControl>,
    handles: Vec<(String, JoinHandle<NodeReport>)>,
    barriers: LayerBarriers,
    settle: Duration,
}

impl Layer {
    /// Layer with a fresh barrier pair sized for `nodes`.
    pub fn new(name: impl Into<String>, nodes: Vec<AnyNode>) -> Self {
        let name = name.into();
        let barriers = LayerBarriers::for_layer(&name, nodes.len());
        Self::assemble(name, nodes, barriers)
    }

    /// Layer over caller-supplied barriers, which must have one party per
    /// node plus one for the driver.
    pub fn with_barriers(
        name: impl Into<String>,
        nodes: Vec<AnyNode>,
        barriers: LayerBarriers,
    ) -> PipelineResult<Self> {
        let expected = nodes.len() + 1;
        for barrier in [&barriers.start, &barriers.end] {
            if barrier.parties() != expected {
                return Err(PipelineError::BarrierArity {
                    barrier: barrier.name().to_string(),
                    expected,
                    actual: barrier.parties(),
                });
            }
        }
        Ok(Self::assemble(name.into(), nodes, barriers))
    }

    fn assemble(name: String, nodes: Vec<AnyNode>, barriers: LayerBarriers) -> Self {
        Self {
            node_names: nodes.iter().map(|n| n.name().to_string()).collect(),
            name,
            pending: nodes,
            controls: Vec::new(),
            handles: Vec::new(),
            barriers,
            settle: Duration::ZERO,
        }
    }

    /// Sleep before admitting each step.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_names(&self) -> &[String] {
        &self.node_names
    }

    pub fn len(&self) -> usize {
        self.node_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_names.is_empty()
    }

    pub fn barriers(&self) -> &LayerBarriers {
        &self.barriers
    }

    /// Start one thread per node. Calling it again is a no-op.
    pub fn nodes_start(
        &mut self,
        running: &Arc<AtomicBool>,
        faults: &Sender<NodeFault>,
    ) -> PipelineResult<()> {
        for node in self.pending.drain(..) {
            let name = node.name().to_string();
            let (control, inbox) = step_queue(&name);
            let runner = NodeRunner::new(
                self.name.clone(),
                node,
                inbox,
                self.barriers.clone(),
                running.clone(),
                faults.clone(),
            );
            let handle = runner.spawn()?;
            self.controls.push(control);
            self.handles.push((name, handle));
        }
        tracing::debug!("Layer '{}' started {} nodes", self.name, self.handles.len());
        Ok(())
    }

    /// Queue `step` on every node and open the step window.
    pub fn admit(&self, step: &Step, index: usize) -> PipelineResult<()> {
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
        for control in &self.controls {
            control.add_step(step.clone(), index)?;
        }
        self.barriers.start.wait()?;
        tracing::trace!("Layer '{}' admitted {}", self.name, step);
        Ok(())
    }

    /// Close the step window once every node is done with it.
    pub fn release(&self, is_last: bool) -> PipelineResult<()> {
        for control in &self.controls {
            control.signal_step_end();
        }
        if is_last {
            self.finish_nodes();
        }
        self.barriers.end.wait()?;
        Ok(())
    }

    /// Ask every node to leave its run loop after the current step.
    pub fn finish_nodes(&self) {
        for control in &self.controls {
            control.finish();
        }
    }

    /// Break the barriers and finish every node.
    pub fn abort(&self) {
        tracing::warn!("Aborting layer '{}'", self.name);
        self.barriers.break_all();
        self.finish_nodes();
    }

    /// Wait for every node thread.
    pub fn join(&mut self) -> Vec<NodeReport> {
        self.handles
            .drain(..)
            .map(|(node, handle)| {
                handle.join().unwrap_or_else(|_| {
                    tracing::error!("Node '{}' panicked", node);
                    NodeReport {
                        layer: self.name.clone(),
                        error: Some(PipelineError::NodePanicked(node.clone()).to_string()),
                        node,
                        steps_completed: 0,
                    }
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.name)
            .field("nodes", &self.node_names)
            .field("settle", &self.settle)
            .finish()
    }
}
