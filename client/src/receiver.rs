//! Hand-off point where a finished replacement replaces the predictive
//! timeline.

use crate::coordinator::ReplacementCoordinator;
use shared::{Frame, Predictive, Replacement, SessionError, Simulation, StateHolder, UpdateInput};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// The predictive timeline plus the rolling input prediction it extends each
/// tick.
pub struct PredictiveCore<S: Simulation> {
    pub holder: StateHolder<S, Predictive>,
    pub prediction: UpdateInput<S::ClientInput, S::ServerInput>,
}

/// A replacement replay's private timeline. Lives entirely on the replay
/// thread until swapped in.
pub struct ReplacementCore<S: Simulation> {
    pub holder: StateHolder<S, Replacement>,
    pub prediction: UpdateInput<S::ClientInput, S::ServerInput>,
}

impl<S: Simulation> ReplacementCore<S> {
    /// Starts a replay timeline from an authoritative snapshot, inheriting
    /// the confirmed batch of that frame as its prediction basis.
    pub fn from_snapshot(
        bytes: &[u8],
        frame: Frame,
        prediction: UpdateInput<S::ClientInput, S::ServerInput>,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            holder: StateHolder::from_serialized(bytes, frame)?,
            prediction,
        })
    }
}

/// Owns the predictive timeline and mediates between the tick loop advancing
/// it and replacement replays trying to overwrite it.
pub struct ReplacementReceiver<S: Simulation> {
    core: Mutex<PredictiveCore<S>>,
    /// Frame of the predictive timeline, readable without the core lock.
    predict_frame: AtomicI64,
    initialized: AtomicBool,
}

impl<S: Simulation> ReplacementReceiver<S> {
    pub fn new() -> Self {
        Self {
            core: Mutex::new(PredictiveCore {
                holder: StateHolder::new(),
                prediction: UpdateInput::default(),
            }),
            predict_frame: AtomicI64::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    /// Seeds the predictive timeline from the session's initial snapshot.
    pub fn init(&self, state: S, frame: Frame) {
        let mut core = self.core.lock();
        core.holder.set_from(state, frame);
        core.prediction = UpdateInput::default();
        self.predict_frame.store(frame, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Frame the predictive timeline has reached. Replacement replays chase
    /// this moving target.
    pub fn predict_frame(&self) -> Frame {
        self.predict_frame.load(Ordering::Acquire)
    }

    /// Runs one predictive tick under the core lock.
    pub fn run_tick<R>(&self, f: impl FnOnce(&mut PredictiveCore<S>) -> R) -> R {
        let mut core = self.core.lock();
        let result = f(&mut core);
        self.predict_frame.store(core.holder.frame(), Ordering::Release);
        result
    }

    /// Attempts to install a caught-up replay as the new predictive
    /// timeline. Fails if the predictive frame moved on (caller resumes the
    /// chase) and does nothing when the replay was superseded.
    ///
    /// The core lock is taken before the coordinator's transition lock; the
    /// predictive loop never holds them in the other order.
    pub fn try_swap(
        &self,
        generation: i64,
        replacement: &mut ReplacementCore<S>,
        coordinator: &ReplacementCoordinator,
    ) -> bool {
        let mut core = self.core.lock();
        if core.holder.frame() != replacement.holder.frame() {
            return false;
        }
        coordinator
            .complete(generation, || {
                core.holder.swap(&mut replacement.holder);
                std::mem::swap(&mut core.prediction, &mut replacement.prediction);
            })
            .is_some()
    }

    /// Replaces the predictive timeline outright with an authoritative
    /// snapshot that is already ahead of it. Used when prediction has not
    /// started yet or fell behind the authoritative stream.
    pub fn seed(
        &self,
        bytes: &[u8],
        frame: Frame,
        prediction: UpdateInput<S::ClientInput, S::ServerInput>,
    ) -> Result<(), SessionError> {
        let mut core = self.core.lock();
        core.holder = StateHolder::from_serialized(bytes, frame)?;
        core.prediction = prediction;
        self.predict_frame.store(frame, Ordering::Release);
        Ok(())
    }

    /// Runs `f` against the current predicted state.
    pub fn with_state<R>(&self, f: impl FnOnce(Frame, &S) -> R) -> R {
        let core = self.core.lock();
        f(core.holder.frame(), core.holder.state())
    }
}

impl<S: Simulation> Default for ReplacementReceiver<S> {
    fn default() -> Self {
        Self::new()
    }
}
