//! Synchronization primitives shared by layers and nodes.

pub mod barrier;

pub use barrier::{BarrierWaitResult, StepBarrier};

use std::sync::Arc;

/// The `batchStart` / `batchEnd` pair of one layer.
///
/// Both barriers have one party per node plus one for the driver.
#[derive(Debug, Clone)]
pub struct LayerBarriers {
    pub start: Arc<StepBarrier>,
    pub end: Arc<StepBarrier>,
}

impl LayerBarriers {
    /// Create a fresh barrier pair for a layer with `nodes` nodes.
    pub fn for_layer(layer: &str, nodes: usize) -> Self {
        Self {
            start: Arc::new(StepBarrier::new(format!("{layer}.batchStart"), nodes + 1)),
            end: Arc::new(StepBarrier::new(format!("{layer}.batchEnd"), nodes + 1)),
        }
    }

    pub fn break_all(&self) {
        self.start.break_barrier();
        self.end.break_barrier();
    }

    pub fn is_broken(&self) -> bool {
        self.start.is_broken() || self.end.is_broken()
    }
}

/// Breaks a barrier pair if the owning thread unwinds.
///
/// A panicking node never reaches its next arrival; without this the rest of
/// its layer would block forever.
pub struct BreakOnPanic {
    barriers: LayerBarriers,
}

impl BreakOnPanic {
    pub fn new(barriers: LayerBarriers) -> Self {
        Self { barriers }
    }
}

impl Drop for BreakOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.barriers.break_all();
        }
    }
}
