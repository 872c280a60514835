//! The per-node worker loop.
//!
//! `NodeRunner` is the only place that touches a layer's barriers on behalf
//! of a node. Whatever a hook returns, the runner either arrives at both
//! barriers of the step or breaks them, so the rest of the layer is never
//! left waiting on a party that will not come.

use super::{AnyNode, NodeContext, NodeReport, StepContext};
use crate::error::{PipelineError, PipelineResult};
use crate::step::{NodeInbox, Step, StepSignal};
use crate::sync::{BreakOnPanic, LayerBarriers};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// How far a node failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultScope {
    /// The step completed at both barriers; remaining steps are aborted.
    Step,
    /// The node could not honour the barrier contract.
    Run,
}

/// A failure reported by a node thread to the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeFault {
    pub layer: String,
    pub node: String,
    pub step: Option<Step>,
    pub message: String,
    pub scope: FaultScope,
}

pub struct NodeRunner {
    layer: String,
    node: AnyNode,
    inbox: NodeInbox,
    barriers: LayerBarriers,
    running: Arc<AtomicBool>,
    faults: Sender<NodeFault>,
}

impl NodeRunner {
    pub fn new(
        layer: impl Into<String>,
        node: AnyNode,
        inbox: NodeInbox,
        barriers: LayerBarriers,
        running: Arc<AtomicBool>,
        faults: Sender<NodeFault>,
    ) -> Self {
        Self {
            layer: layer.into(),
            node,
            inbox,
            barriers,
            running,
            faults,
        }
    }

    /// Run on a dedicated thread named after the node.
    pub fn spawn(self) -> PipelineResult<JoinHandle<NodeReport>> {
        let name = self.node.name().to_string();
        thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .map_err(PipelineError::Io)
    }

    /// Drive the node until it is finished or the run breaks.
    pub fn run(mut self) -> NodeReport {
        let _guard = BreakOnPanic::new(self.barriers.clone());
        let name = self.node.name().to_string();
        let span = tracing::info_span!("node", layer = %self.layer, node = %name);
        let _enter = span.enter();

        let mut steps_completed = 0;
        let result = self.step_loop(&name, &mut steps_completed);

        let ctx = NodeContext {
            node: &name,
            running: &self.running,
        };
        let finish = self.node.on_finish(&ctx);
        if let Err(e) = &finish {
            tracing::error!("Shutdown failed: {}", e);
            self.fault(&name, None, e, FaultScope::Run);
        }

        let error = result.and(finish).err().map(|e| e.to_string());
        match &error {
            None => tracing::info!("Done after {} steps", steps_completed),
            Some(e) => tracing::warn!("Stopped after {} steps: {}", steps_completed, e),
        }

        NodeReport {
            layer: self.layer,
            node: name,
            steps_completed,
            error,
        }
    }

    fn step_loop(&mut self, name: &str, steps_completed: &mut usize) -> PipelineResult<()> {
        let ctx = NodeContext {
            node: name,
            running: &self.running,
        };
        if let Err(e) = self.node.on_start(&ctx) {
            tracing::error!("Failed to start: {}", e);
            self.fail_run(name, None, &e);
            return Err(e);
        }

        loop {
            let (step, index) = match self.inbox.next() {
                StepSignal::Run { step, index } => (step, index),
                StepSignal::Finish => return Ok(()),
            };

            self.run_step(name, &step, index)?;
            *steps_completed += 1;

            if self.inbox.is_finished() {
                return Ok(());
            }
        }
    }

    fn run_step(&mut self, name: &str, step: &Step, index: usize) -> PipelineResult<()> {
        let span = tracing::debug_span!("step", step = %step, index);
        let _enter = span.enter();

        let ctx = StepContext {
            node: name,
            step,
            index,
            step_end: self.inbox.step_end(),
            running: &self.running,
        };

        if let Err(e) = self.node.before_step(&ctx) {
            tracing::error!("Not fit for step: {}", e);
            self.fail_run(name, Some(step), &e);
            return Err(e);
        }

        self.barriers.start.wait()?;
        tracing::trace!("Entered step");

        if let Err(e) = self.node.on_step(&ctx) {
            if e.is_run_fatal() {
                tracing::error!("Fatal step failure: {}", e);
                self.fail_run(name, Some(step), &e);
                return Err(e);
            }
            tracing::error!("Step failed: {}", e);
            self.fault(name, Some(step), &e, FaultScope::Step);
        }

        self.barriers.end.wait()?;
        tracing::trace!("Left step");

        self.node.after_step(&ctx);
        Ok(())
    }

    fn fail_run(&self, name: &str, step: Option<&Step>, error: &PipelineError) {
        self.fault(name, step, error, FaultScope::Run);
        self.barriers.break_all();
    }

    fn fault(&self, name: &str, step: Option<&Step>, error: &PipelineError, scope: FaultScope) {
        let fault = NodeFault {
            layer: self.layer.clone(),
            node: name.to_string(),
            step: step.cloned(),
            message: error.to_string(),
            scope,
        };
        if self.faults.send(fault).is_err() {
            tracing::debug!("Fault channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodePlugin;
    use crate::step::step_queue;
    use crossbeam_channel::unbounded;
    use std::sync::Mutex;

    struct Scripted {
        log: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    impl NodePlugin for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn on_step(&mut self, ctx: &StepContext) -> PipelineResult<()> {
            self.log.lock().unwrap().push(ctx.step.to_string());
            if self.fail_on == Some(ctx.step.name()) {
                return Err(PipelineError::MissingInput {
                    path: ctx.step.name().into(),
                });
            }
            Ok(())
        }

        fn on_finish(&mut self, _ctx: &NodeContext) -> PipelineResult<()> {
            self.log.lock().unwrap().push("finish".to_string());
            Ok(())
        }
    }

    fn runner(
        fail_on: Option<&'static str>,
    ) -> (
        NodeRunner,
        crate::step::NodeControl,
        LayerBarriers,
        crossbeam_channel::Receiver<NodeFault>,
        Arc<Mutex<Vec<String>>>,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (control, inbox) = step_queue("scripted");
        let barriers = LayerBarriers::for_layer("test", 1);
        let (faults_tx, faults_rx) = unbounded();
        let node: Box<dyn NodePlugin> = Box::new(Scripted {
            log: log.clone(),
            fail_on,
        });
        let runner = NodeRunner::new(
            "test",
            node.into(),
            inbox,
            barriers.clone(),
            Arc::new(AtomicBool::new(true)),
            faults_tx,
        );
        (runner, control, barriers, faults_rx, log)
    }

    #[test]
    fn test_runs_steps_then_finishes() {
        let (runner, control, barriers, faults, log) = runner(None);
        let handle = runner.spawn().unwrap();

        for (index, step) in ["a", "b"].into_iter().enumerate() {
            control.add_step(step.into(), index).unwrap();
            barriers.start.wait().unwrap();
            control.signal_step_end();
            if index == 1 {
                control.finish();
            }
            barriers.end.wait().unwrap();
        }

        let report = handle.join().unwrap();
        assert!(report.is_success());
        assert_eq!(report.steps_completed, 2);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "finish"]);
        assert!(faults.try_recv().is_err());
        assert_eq!(barriers.start.generation(), 2);
        assert_eq!(barriers.end.generation(), 2);
    }

    #[test]
    fn test_step_failure_still_reaches_batch_end() {
        let (runner, control, barriers, faults, _log) = runner(Some("a"));
        let handle = runner.spawn().unwrap();

        control.add_step("a".into(), 0).unwrap();
        barriers.start.wait().unwrap();
        control.finish();
        barriers.end.wait().unwrap();

        let report = handle.join().unwrap();
        assert!(report.is_success(), "step faults do not fail the node");
        let fault = faults.try_recv().unwrap();
        assert_eq!(fault.scope, FaultScope::Step);
        assert_eq!(fault.step, Some(Step::new("a")));
    }

    #[test]
    fn test_broken_barrier_stops_node() {
        let (runner, control, barriers, _faults, log) = runner(None);
        let handle = runner.spawn().unwrap();

        barriers.break_all();
        control.add_step("a".into(), 0).unwrap();

        let report = handle.join().unwrap();
        assert!(!report.is_success());
        assert_eq!(report.steps_completed, 0);
        assert_eq!(*log.lock().unwrap(), vec!["finish"], "on_finish still runs");
    }
}
