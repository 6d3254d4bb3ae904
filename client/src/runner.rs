//! The speculative tick: extends the input prediction and advances the
//! predictive timeline by one frame.

use crate::manager::PredictShared;
use shared::{
    encode_pooled, ClientId, InputPredictor, SessionError, Simulation, UpdateClientInfo,
};
use std::sync::atomic::Ordering;

pub struct Predictors<S: Simulation> {
    pub client: InputPredictor<S::ClientInput>,
    pub server: InputPredictor<S::ServerInput>,
}

/// Derives the next frame's predicted batch from the previous one.
///
/// The local client's entry is replaced with its real sampled input; every
/// other entry is extended by the client predictor in place, which keeps the
/// batch's order identical to the confirmed batch it was derived from.
/// Terminated entries are not carried into predicted frames.
pub(crate) fn advance_prediction<S: Simulation>(
    prediction: &mut shared::UpdateInput<S::ClientInput, S::ServerInput>,
    local_id: ClientId,
    own: &S::ClientInput,
    predictors: &Predictors<S>,
) {
    prediction.client_inputs.retain(|info| !info.terminated);

    let mut found_local = false;
    for info in prediction.client_inputs.iter_mut() {
        if info.id == local_id {
            info.input = own.clone();
            found_local = true;
        } else {
            (predictors.client)(&mut info.input);
        }
    }
    if !found_local {
        prediction.client_inputs.push(UpdateClientInfo {
            id: local_id,
            input: own.clone(),
            terminated: false,
        });
    }

    (predictors.server)(&mut prediction.server_input);
}

/// Drives one speculative frame per clock tick.
pub struct PredictRunner<S: Simulation> {
    provider: Box<dyn FnMut() -> S::ClientInput + Send>,
}

impl<S: Simulation> PredictRunner<S> {
    pub fn new(provider: Box<dyn FnMut() -> S::ClientInput + Send>) -> Self {
        Self { provider }
    }

    /// Samples the local input, records it in history, advances the
    /// predictive timeline, and queues the speculative batch for later
    /// confirmation.
    ///
    /// The history append happens inside the core lock, keyed by the frame
    /// the step is about to produce, so a concurrent snapshot adoption can
    /// never land between the recorded frame and the stepped one.
    pub fn update(&mut self, ctx: &PredictShared<S>) -> Result<(), SessionError> {
        let own = (self.provider)();
        let local_id = ctx.local_id.load(Ordering::Acquire);

        let (frame, bytes) = ctx.receiver.run_tick(|core| {
            let frame = core.holder.frame() + 1;
            {
                let mut history = ctx.history.lock();
                // An adopted snapshot may have moved the predictive frame
                // past the recorded history; everything at or below the
                // snapshot frame is settled, so realign and continue.
                if history.last_frame() != frame - 1 {
                    history.set(frame);
                }
                history.add(own.clone());
            }
            (ctx.on_input)(frame, &own);

            advance_prediction::<S>(&mut core.prediction, local_id, &own, &ctx.predictors);
            let bytes = encode_pooled(&ctx.pool, &core.prediction)?;
            core.holder.update(&core.prediction);
            (ctx.on_frame)(core.holder.frame(), core.holder.state());
            Ok::<_, SessionError>((frame, bytes))
        })?;

        ctx.coordinator.push_live(frame, bytes);
        Ok(())
    }
}
