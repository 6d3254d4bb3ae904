//! Replacement replays: re-simulating from an authoritative snapshot until
//! the replay catches the live predictive timeline.

use crate::manager::PredictShared;
use crate::receiver::ReplacementCore;
use crate::runner::advance_prediction;
use log::{debug, error, warn};
use shared::{encode_pooled, Authoritative, Frame, SessionError, Simulation, StateHolder, UpdateInput};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Starts correcting a mispredicted frame.
///
/// Snapshots the authoritative state at `frame` and spawns a replay thread
/// that re-simulates forward with recorded local inputs until it catches the
/// predictive timeline, then installs itself as the new prediction. If the
/// predictive timeline has not even reached `frame`, the snapshot is adopted
/// directly and no replay is needed.
pub fn begin_replacement<S: Simulation>(
    shared: &Arc<PredictShared<S>>,
    auth: &Arc<Mutex<StateHolder<S, Authoritative>>>,
    frame: Frame,
    confirmed: UpdateInput<S::ClientInput, S::ServerInput>,
) -> Result<(), SessionError> {
    let Some(generation) = shared.coordinator.acquire() else {
        return Ok(());
    };

    let snapshot = auth.lock().serialized()?.to_vec();

    if shared.receiver.predict_frame() < frame {
        warn!("prediction is behind authoritative frame {frame}, adopting snapshot");
        shared.receiver.seed(&snapshot, frame, confirmed)?;
        shared.history.lock().pop(frame);
        shared.coordinator.finish(generation);
        return Ok(());
    }

    let shared = Arc::clone(shared);
    std::thread::Builder::new()
        .name("replacement".into())
        .spawn(move || {
            if let Err(err) = replay(&shared, generation, frame, &snapshot, confirmed) {
                error!("replacement from frame {frame} failed: {err}");
                shared.coordinator.finish(generation);
            }
        })
        .map_err(|err| SessionError::Task(err.to_string()))?;
    Ok(())
}

fn replay<S: Simulation>(
    shared: &Arc<PredictShared<S>>,
    generation: i64,
    frame: Frame,
    snapshot: &[u8],
    confirmed: UpdateInput<S::ClientInput, S::ServerInput>,
) -> Result<(), SessionError> {
    let mut core = ReplacementCore::<S>::from_snapshot(snapshot, frame, confirmed)?;
    // Inputs up to the snapshot frame are settled and never needed again.
    shared.history.lock().pop(frame);
    let local_id = shared.local_id.load(Ordering::Acquire);

    loop {
        if shared.coordinator.is_superseded(generation) {
            return Ok(());
        }

        let target = shared.receiver.predict_frame();
        let current = core.holder.frame();

        if current < target {
            let next = current + 1;
            // The history guard must not outlive this statement; try_swap
            // below takes the core lock, which is never acquired while the
            // history lock is held.
            let own = shared.history.lock().get(next).cloned();
            let Some(own) = own else {
                shared.coordinator.finish(generation);
                return Err(SessionError::Task(format!(
                    "input history lost frame {next} during replacement"
                )));
            };
            advance_prediction::<S>(&mut core.prediction, local_id, &own, &shared.predictors);
            let bytes = encode_pooled(&shared.pool, &core.prediction)?;
            if !shared.coordinator.offer(generation, next, bytes) {
                return Ok(());
            }
            core.holder.update(&core.prediction);
        } else if current == target {
            if shared.receiver.try_swap(generation, &mut core, &shared.coordinator) {
                debug!("replacement from frame {frame} merged at frame {current}");
                return Ok(());
            }
            if shared.coordinator.is_superseded(generation) {
                return Ok(());
            }
            // The predictive timeline advanced between the frame check and
            // the swap attempt; keep chasing.
        } else {
            warn!("replacement overran the predictive timeline at frame {current}");
            shared.coordinator.finish(generation);
            return Ok(());
        }
    }
}
