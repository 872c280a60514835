//! The driver: an ordered chain of layers advancing through the step list.
//!
//! Layers are held head-first. Each step is admitted head to tail and
//! released tail to head, so an upstream layer never leaves a step before
//! every downstream layer has entered it:
//!
//! ```text
//! admit:    L0.batchStart ─► L1.batchStart ─► L2.batchStart
//! release:  L0.batchEnd   ◄─ L1.batchEnd   ◄─ L2.batchEnd
//! ```
//!
//! The chain is about step windows, not data flow. A layer's window
//! encloses the windows of every layer after it, so the layer that must
//! observe everything the others do in a step (typically the consumers)
//! belongs at the head.
//!
//! # Failure handling
//!
//! - A step-scoped node fault lets the current step complete at both
//!   barriers; the remaining steps are skipped and every node is finished.
//! - A broken barrier or a lost node aborts the run: `running` is cleared,
//!   all barriers are broken and all nodes are finished.
//!
//! Either way every node thread is joined before [`Topology::run`] returns.

use crate::error::{PipelineError, PipelineResult};
use crate::layer::Layer;
use crate::node::{FaultScope, NodeFault, NodeReport};
use crate::step::Step;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Requests an early, clean end of the run from another thread.
#[derive(Debug, Clone, Default)]
pub struct FinishHandle(Arc<AtomicBool>);

impl FinishHandle {
    /// End the run after the step in progress (or the next one, between
    /// steps). Nodes still complete that step at both barriers.
    pub fn request(&self) {
        if !self.0.swap(true, Ordering::SeqCst) {
            tracing::info!("Finish requested");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Admitted,
    Released,
}

/// One barrier crossing by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEvent {
    pub layer: String,
    pub step: Step,
    pub index: usize,
    pub phase: StepPhase,
    /// Milliseconds since the run started
    pub offset_ms: u64,
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub steps: Vec<Step>,
    pub steps_completed: usize,
    pub nodes: Vec<NodeReport>,
    pub timeline: Vec<StepEvent>,
    pub faults: Vec<NodeFault>,
    /// Driver-level failures
    pub failures: Vec<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
            && self.faults.is_empty()
            && self.nodes.iter().all(NodeReport::is_success)
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Timeline entries of one layer.
    pub fn events_for<'a>(&'a self, layer: &'a str) -> impl Iterator<Item = &'a StepEvent> + 'a {
        self.timeline.iter().filter(move |e| e.layer == layer)
    }
}

pub struct Topology {
    layers: Vec<Layer>,
    steps: Vec<Step>,
    running: Arc<AtomicBool>,
    finish: FinishHandle,
    faults_tx: Sender<NodeFault>,
    faults_rx: Receiver<NodeFault>,
    timeline: Vec<StepEvent>,
    clock: Instant,
}

impl Topology {
    /// Chain `layers` (head first) over `steps`.
    pub fn new(layers: Vec<Layer>, steps: Vec<Step>) -> PipelineResult<Self> {
        Self::with_finish_handle(layers, steps, FinishHandle::default())
    }

    /// Like [`Topology::new`], with a finish handle created up front so that
    /// nodes can hold it.
    pub fn with_finish_handle(
        layers: Vec<Layer>,
        steps: Vec<Step>,
        finish: FinishHandle,
    ) -> PipelineResult<Self> {
        if layers.is_empty() {
            return Err(PipelineError::Config("Topology has no layers".to_string()));
        }
        let (faults_tx, faults_rx) = unbounded();
        Ok(Self {
            layers,
            steps,
            running: Arc::new(AtomicBool::new(true)),
            finish,
            faults_tx,
            faults_rx,
            timeline: Vec::new(),
            clock: Instant::now(),
        })
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn finish_handle(&self) -> FinishHandle {
        self.finish.clone()
    }

    /// Cleared once the run is torn down.
    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Start every node of every layer, head first.
    pub fn nodes_start(&mut self) -> PipelineResult<()> {
        for layer in &mut self.layers {
            layer.nodes_start(&self.running, &self.faults_tx)?;
        }
        Ok(())
    }

    /// Drive one step through the whole chain.
    ///
    /// Returns whether the step was delivered as the last one.
    pub fn step(&mut self, step: &Step, index: usize, is_last: bool) -> PipelineResult<bool> {
        for layer in &self.layers {
            layer.admit(step, index)?;
            self.timeline.push(StepEvent {
                layer: layer.name().to_string(),
                step: step.clone(),
                index,
                phase: StepPhase::Admitted,
                offset_ms: self.clock.elapsed().as_millis() as u64,
            });
        }

        let is_last = is_last || self.finish.is_requested();
        for layer in self.layers.iter().rev() {
            layer.release(is_last)?;
            self.timeline.push(StepEvent {
                layer: layer.name().to_string(),
                step: step.clone(),
                index,
                phase: StepPhase::Released,
                offset_ms: self.clock.elapsed().as_millis() as u64,
            });
        }
        Ok(is_last)
    }

    /// Finish every node without another step.
    pub fn finish_nodes(&self) {
        for layer in &self.layers {
            layer.finish_nodes();
        }
    }

    /// Tear the run down from any state.
    pub fn abort(&self) {
        self.running.store(false, Ordering::SeqCst);
        for layer in &self.layers {
            layer.abort();
        }
    }

    /// Start, drive every step, and join.
    pub fn run(mut self) -> RunReport {
        let started_at = Utc::now();
        self.clock = Instant::now();
        let mut failures = Vec::new();
        let mut faults = Vec::new();
        let mut steps_completed = 0;

        tracing::info!(
            "Running {} steps through {} layers",
            self.steps.len(),
            self.layers.len()
        );

        match self.nodes_start() {
            Err(e) => {
                tracing::error!("Failed to start nodes: {}", e);
                failures.push(e.to_string());
                self.abort();
            }
            Ok(()) if self.steps.is_empty() => {
                tracing::warn!("No steps to run");
                self.finish_nodes();
            }
            Ok(()) => {
                let steps = self.steps.clone();
                for (index, step) in steps.iter().enumerate() {
                    let span = tracing::info_span!("step", step = %step, index);
                    let _enter = span.enter();

                    let is_last = index + 1 == steps.len();
                    let delivered_last = match self.step(step, index, is_last) {
                        Ok(last) => last,
                        Err(e) => {
                            let e = PipelineError::Aborted {
                                step: step.to_string(),
                                source: Box::new(e),
                            };
                            tracing::error!("{}", e);
                            failures.push(e.to_string());
                            self.abort();
                            break;
                        }
                    };
                    steps_completed += 1;
                    tracing::info!("Step {}/{} complete", index + 1, steps.len());

                    let step_faults: Vec<_> = self.faults_rx.try_iter().collect();
                    let failed = !step_faults.is_empty();
                    faults.extend(step_faults);
                    if failed {
                        tracing::error!("Node failures in step '{}', skipping remaining steps", step);
                        self.finish_nodes();
                        break;
                    }
                    if delivered_last {
                        break;
                    }
                    // Requested after this step's release decision
                    if self.finish.is_requested() {
                        tracing::info!("Finishing after step '{}'", step);
                        self.finish_nodes();
                        break;
                    }
                }
            }
        }

        let mut nodes = Vec::new();
        for layer in &mut self.layers {
            nodes.extend(layer.join());
        }
        faults.extend(self.faults_rx.try_iter());
        for fault in faults.iter().filter(|f| f.scope == FaultScope::Run) {
            tracing::debug!("Run fault from '{}': {}", fault.node, fault.message);
        }

        let report = RunReport {
            started_at,
            elapsed_ms: self.clock.elapsed().as_millis() as u64,
            steps: self.steps,
            steps_completed,
            nodes,
            timeline: self.timeline,
            faults,
            failures,
        };
        if report.is_success() {
            tracing::info!("Run complete: {} steps in {} ms", steps_completed, report.elapsed_ms);
        } else {
            tracing::warn!("Run failed after {} steps", steps_completed);
        }
        report
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("layers", &self.layers)
            .field("steps", &self.steps)
            .finish()
    }
}
