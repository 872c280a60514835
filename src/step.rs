//! Steps and the per-node step queue.
//!
//! A step is an opaque name (usually a replay file name) chosen by the driver.
//! Each node owns a small FIFO of pending steps: the layer thread appends, the
//! node thread drains. The queue is split into a [`NodeControl`] kept by the
//! layer and a [`NodeInbox`] moved into the node's thread.

use crate::error::{PipelineError, PipelineResult};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Worst case is one pending step plus a finish marker.
pub const STEP_QUEUE_CAPACITY: usize = 4;

/// Identifier of one replay step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Step(String);

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Step {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Step {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Entry in a node's step queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepSignal {
    /// Execute `step`, the `index`-th of the run
    Run { step: Step, index: usize },
    /// Leave the run loop
    Finish,
}

/// Layer-side handle on a node: the four contract operations.
#[derive(Debug)]
pub struct NodeControl {
    name: String,
    steps_tx: Sender<StepSignal>,
    step_end: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

/// Node-side end of the step queue.
#[derive(Debug)]
pub struct NodeInbox {
    steps_rx: Receiver<StepSignal>,
    step_end: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

/// Create the control/inbox pair for a node.
pub fn step_queue(name: impl Into<String>) -> (NodeControl, NodeInbox) {
    let (steps_tx, steps_rx) = bounded(STEP_QUEUE_CAPACITY);
    let step_end = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    (
        NodeControl {
            name: name.into(),
            steps_tx,
            step_end: step_end.clone(),
            finished: finished.clone(),
        },
        NodeInbox {
            steps_rx,
            step_end,
            finished,
        },
    )
}

impl NodeControl {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a step. Clears the step-end hint for the new step.
    pub fn add_step(&self, step: Step, index: usize) -> PipelineResult<()> {
        self.step_end.store(false, Ordering::SeqCst);
        self.steps_tx
            .send(StepSignal::Run { step, index })
            .map_err(|_| PipelineError::NodeGone(self.name.clone()))
    }

    /// Advisory: the current step's work should wrap up.
    pub fn signal_step_end(&self) {
        self.step_end.store(true, Ordering::SeqCst);
    }

    /// Mark the node as terminating after the current step.
    ///
    /// Returns `true` on the first call; later calls are no-ops.
    pub fn finish(&self) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Wakes a node blocked on an empty queue. A full or closed queue means
        // the node is busy or gone, and it checks the flag after the step.
        if let Err(TrySendError::Full(_)) = self.steps_tx.try_send(StepSignal::Finish) {
            tracing::trace!("Step queue of '{}' full, finish flag only", self.name);
        }
        true
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl NodeInbox {
    /// Block for the next queued entry. A dropped control counts as finish.
    pub fn next(&self) -> StepSignal {
        self.steps_rx.recv().unwrap_or(StepSignal::Finish)
    }

    pub fn step_end(&self) -> &AtomicBool {
        &self.step_end
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}
