//! Cyclic, breakable step barrier.
//!
//! `std::sync::Barrier` cannot be broken, which would leave every party of a
//! layer blocked forever once one of them dies. [`StepBarrier`] adds a broken
//! state: breaking wakes every current waiter with an error and makes every
//! later arrival fail until [`StepBarrier::reset`] is called.

use crate::error::{PipelineError, PipelineResult};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Outcome of a successful [`StepBarrier::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierWaitResult {
    /// Round this arrival belonged to (0-based)
    pub generation: u64,
    /// True for exactly one party per round: the last one to arrive
    pub is_leader: bool,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    broken: bool,
    resets: u64,
}

/// Reusable rendezvous for a fixed number of parties.
#[derive(Debug)]
pub struct StepBarrier {
    name: String,
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl StepBarrier {
    /// Create a barrier for `parties` parties. A zero count behaves as one.
    pub fn new(name: impl Into<String>, parties: usize) -> Self {
        Self {
            name: name.into(),
            parties: parties.max(1),
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Number of parties currently blocked in [`wait`](Self::wait).
    pub fn waiting(&self) -> usize {
        self.lock().arrived
    }

    /// Number of completed rounds.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn is_broken(&self) -> bool {
        self.lock().broken
    }

    /// Block until all parties have arrived.
    ///
    /// Fails immediately on a broken barrier, and fails for every waiter of
    /// the current round if the barrier is broken or reset while waiting.
    pub fn wait(&self) -> PipelineResult<BarrierWaitResult> {
        let mut state = self.lock();
        if state.broken {
            return Err(PipelineError::broken(&self.name));
        }

        let generation = state.generation;
        let resets = state.resets;
        state.arrived += 1;

        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(BarrierWaitResult {
                generation,
                is_leader: true,
            });
        }

        while state.generation == generation && !state.broken && state.resets == resets {
            state = self
                .cvar
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if state.resets != resets || state.generation == generation {
            return Err(PipelineError::broken(&self.name));
        }

        Ok(BarrierWaitResult {
            generation,
            is_leader: false,
        })
    }

    /// Poison the barrier: wake all waiters with an error.
    pub fn break_barrier(&self) {
        let mut state = self.lock();
        if !state.broken {
            tracing::warn!("Breaking barrier '{}' ({} waiting)", self.name, state.arrived);
        }
        state.broken = true;
        self.cvar.notify_all();
    }

    /// Clear the broken state. Parties waiting in the current round fail.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.broken = false;
        state.arrived = 0;
        state.resets += 1;
        self.cvar.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
