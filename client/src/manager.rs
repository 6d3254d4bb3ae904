//! Owns the predictive timeline and decides when replacements happen.
//!
//! Lock discipline across the prediction modules: the tick path takes the
//! input history lock only inside the predictive core lock, the core lock is
//! always taken before the coordinator's transition lock, and the core lock
//! is never acquired while the history lock is held.

use crate::coordinator::ReplacementCoordinator;
use crate::receiver::ReplacementReceiver;
use crate::replacer::begin_replacement;
use crate::runner::{PredictRunner, Predictors};
use log::{debug, error, trace};
use parking_lot::Mutex;
use shared::{
    carry_forward, encode_pooled, Authoritative, BufferPool, ClientId, Frame, IndexedQueue,
    InputPredictor, SessionError, Simulation, StateHolder, UpdateInput,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Construction-time parameters for the predictive side.
pub struct PredictConfig<S: Simulation> {
    /// Polled once per predictive tick for the local input.
    pub input_provider: Box<dyn FnMut() -> S::ClientInput + Send>,
    /// Extends a remote client's previous input into the next frame.
    pub client_predictor: InputPredictor<S::ClientInput>,
    /// Extends the server input into the next frame.
    pub server_predictor: InputPredictor<S::ServerInput>,
    /// Observes each sampled local input, e.g. to send it to the server.
    pub on_input: Box<dyn Fn(Frame, &S::ClientInput) + Send + Sync>,
    /// Observes each freshly predicted frame, e.g. to render it.
    pub on_frame: Box<dyn Fn(Frame, &S) + Send + Sync>,
}

impl<S: Simulation> Default for PredictConfig<S> {
    fn default() -> Self {
        Self {
            input_provider: Box::new(|| Default::default()),
            client_predictor: carry_forward(),
            server_predictor: carry_forward(),
            on_input: Box::new(|_, _| {}),
            on_frame: Box::new(|_, _| {}),
        }
    }
}

/// State shared between the tick loop, the network path, and replacement
/// replay threads.
pub struct PredictShared<S: Simulation> {
    /// The local inputs of every not-yet-settled frame.
    pub history: Mutex<IndexedQueue<S::ClientInput>>,
    pub receiver: ReplacementReceiver<S>,
    pub coordinator: ReplacementCoordinator,
    pub pool: BufferPool,
    pub predictors: Predictors<S>,
    pub on_input: Box<dyn Fn(Frame, &S::ClientInput) + Send + Sync>,
    pub on_frame: Box<dyn Fn(Frame, &S) + Send + Sync>,
    pub local_id: AtomicU32,
}

/// Drives speculative execution on the client.
///
/// Every clock tick advances the predictive timeline one frame ahead of the
/// confirmed one. Every arriving authoritative batch is compared against the
/// speculative batch for the same frame; on a byte-level mismatch a
/// replacement replay corrects the predictive timeline in the background
/// while prediction keeps running.
pub struct PredictManager<S: Simulation> {
    shared: Arc<PredictShared<S>>,
    runner: Mutex<PredictRunner<S>>,
    auth: Arc<Mutex<StateHolder<S, Authoritative>>>,
}

impl<S: Simulation> PredictManager<S> {
    pub fn new(
        config: PredictConfig<S>,
        auth: Arc<Mutex<StateHolder<S, Authoritative>>>,
    ) -> Self {
        Self {
            shared: Arc::new(PredictShared {
                history: Mutex::new(IndexedQueue::new()),
                receiver: ReplacementReceiver::new(),
                coordinator: ReplacementCoordinator::new(),
                pool: BufferPool::new(),
                predictors: Predictors {
                    client: config.client_predictor,
                    server: config.server_predictor,
                },
                on_input: config.on_input,
                on_frame: config.on_frame,
                local_id: AtomicU32::new(0),
            }),
            runner: Mutex::new(PredictRunner::new(config.input_provider)),
            auth,
        }
    }

    /// Seeds prediction from the session's initial snapshot. The first
    /// predicted frame is `frame + 1`.
    pub fn init(&self, local_id: ClientId, frame: Frame, snapshot: &[u8]) -> Result<(), SessionError> {
        let state: S = bincode::deserialize(snapshot)?;
        self.shared.local_id.store(local_id, Ordering::Release);
        // History first: ticks only start once the receiver is initialized.
        self.shared.history.lock().set(frame + 1);
        self.shared.receiver.init(state, frame);
        Ok(())
    }

    /// Runs one predictive tick. No-op before `init` or after `stop`.
    pub fn tick(&self) {
        if !self.shared.receiver.is_initialized() || self.shared.coordinator.is_stopped() {
            return;
        }
        let mut runner = self.runner.lock();
        if let Err(err) = runner.update(&self.shared) {
            error!("predictive tick failed: {err}");
        }
    }

    /// Checks an arriving authoritative batch against the speculative batch
    /// for the same frame and starts a replacement on mismatch.
    pub fn inform_auth_input(
        &self,
        frame: Frame,
        input: &UpdateInput<S::ClientInput, S::ServerInput>,
    ) -> Result<(), SessionError> {
        let expected = encode_pooled(&self.shared.pool, input)?;
        match self.shared.coordinator.next_confirmation(frame) {
            Some(speculated) if *speculated == *expected => {
                trace!("frame {frame} confirmed");
                self.shared.history.lock().pop(frame);
                Ok(())
            }
            _ => {
                debug!("frame {frame} mispredicted, starting replacement");
                begin_replacement(&self.shared, &self.auth, frame, input.clone())
            }
        }
    }

    /// Permanently stops prediction and supersedes any running replacement.
    pub fn stop(&self) {
        self.shared.coordinator.stop();
    }

    /// Frame the predictive timeline has reached.
    pub fn predict_frame(&self) -> Frame {
        self.shared.receiver.predict_frame()
    }

    /// Runs `f` against the newest predicted state.
    pub fn with_predicted_state<R>(&self, f: impl FnOnce(Frame, &S) -> R) -> R {
        self.shared.receiver.with_state(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::sample::{Drift, SampleGame, Thrust};
    use shared::UpdateClientInfo;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn batch(entries: &[(ClientId, i8)]) -> UpdateInput<Thrust, Drift> {
        UpdateInput {
            server_input: Drift::default(),
            client_inputs: entries
                .iter()
                .map(|&(id, accel)| UpdateClientInfo {
                    id,
                    input: Thrust { accel },
                    terminated: false,
                })
                .collect(),
        }
    }

    fn manager_with_provider(
        accel: i8,
    ) -> (PredictManager<SampleGame>, Arc<Mutex<StateHolder<SampleGame, Authoritative>>>) {
        let auth = Arc::new(Mutex::new(StateHolder::new()));
        let config = PredictConfig::<SampleGame> {
            input_provider: Box::new(move || Thrust { accel }),
            ..PredictConfig::default()
        };
        let manager = PredictManager::new(config, Arc::clone(&auth));
        let snapshot = bincode::serialize(&SampleGame::default()).unwrap();
        manager.init(1, 0, &snapshot).unwrap();
        (manager, auth)
    }

    fn wait_for_merge(manager: &PredictManager<SampleGame>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.shared.coordinator.is_active() {
            assert!(Instant::now() < deadline, "replacement never finished");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn replay_reference(
        inputs: &[UpdateInput<Thrust, Drift>],
    ) -> SampleGame {
        let mut game = SampleGame::default();
        for input in inputs {
            game.update(input);
        }
        game
    }

    #[test]
    fn test_correct_prediction_needs_no_replacement() {
        let (manager, auth) = manager_with_provider(2);
        manager.tick();

        let confirmed = batch(&[(1, 2)]);
        auth.lock().update(&confirmed);
        manager.inform_auth_input(1, &confirmed).unwrap();

        assert!(!manager.shared.coordinator.is_active());
        assert_eq!(manager.shared.coordinator.current(), 0);
    }

    #[test]
    fn test_misprediction_is_replayed_and_converges() {
        let (manager, auth) = manager_with_provider(2);
        for _ in 0..6 {
            manager.tick();
        }
        assert_eq!(manager.predict_frame(), 6);

        // The server saw accel 3 on frame 1, not the predicted 2.
        let confirmed = batch(&[(1, 3)]);
        auth.lock().update(&confirmed);
        manager.inform_auth_input(1, &confirmed).unwrap();
        wait_for_merge(&manager);

        let mut expected_inputs = vec![batch(&[(1, 3)])];
        expected_inputs.extend((0..5).map(|_| batch(&[(1, 2)])));
        let expected = replay_reference(&expected_inputs);

        manager.with_predicted_state(|frame, state| {
            assert_eq!(frame, 6);
            assert_eq!(*state, expected);
        });
    }

    #[test]
    fn test_newer_replacement_wins() {
        let (manager, auth) = manager_with_provider(2);
        for _ in 0..4 {
            manager.tick();
        }

        let first = batch(&[(1, 3)]);
        auth.lock().update(&first);
        manager.inform_auth_input(1, &first).unwrap();

        let second = batch(&[(1, 4)]);
        auth.lock().update(&second);
        manager.inform_auth_input(2, &second).unwrap();
        wait_for_merge(&manager);

        let mut expected_inputs = vec![batch(&[(1, 3)]), batch(&[(1, 4)])];
        expected_inputs.extend((0..2).map(|_| batch(&[(1, 2)])));
        let expected = replay_reference(&expected_inputs);

        manager.with_predicted_state(|frame, state| {
            assert_eq!(frame, 4);
            assert_eq!(*state, expected);
        });
    }

    #[test]
    fn test_authoritative_ahead_of_prediction_adopts_snapshot() {
        let (manager, auth) = manager_with_provider(2);

        let confirmed = batch(&[(1, 5)]);
        auth.lock().update(&confirmed);
        manager.inform_auth_input(1, &confirmed).unwrap();

        assert!(!manager.shared.coordinator.is_active());
        assert_eq!(manager.predict_frame(), 1);
        manager.with_predicted_state(|_, state| {
            assert_eq!(state.carts[&1].velocity, 5);
        });
    }

    #[test]
    fn test_snapshot_adoption_cannot_split_a_tick() {
        let auth = Arc::new(Mutex::new(StateHolder::new()));
        let hold = Arc::new(AtomicBool::new(false));
        let pause = Arc::clone(&hold);
        let config = PredictConfig::<SampleGame> {
            input_provider: Box::new(|| Thrust { accel: 2 }),
            on_input: Box::new(move |_, _| {
                while pause.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }),
            ..PredictConfig::default()
        };
        let manager = Arc::new(PredictManager::new(config, Arc::clone(&auth)));
        let snapshot = bincode::serialize(&SampleGame::default()).unwrap();
        manager.init(1, 0, &snapshot).unwrap();

        // Park the tick mid-flight inside the input hook, then deliver an
        // authoritative frame that adopts the snapshot because prediction
        // still reads as lagging.
        hold.store(true, Ordering::SeqCst);
        let ticker = Arc::clone(&manager);
        let tick = std::thread::spawn(move || ticker.tick());
        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.shared.history.lock().last_frame() < 1 {
            assert!(Instant::now() < deadline, "tick never reached the input hook");
            std::thread::sleep(Duration::from_millis(1));
        }

        let confirmed = batch(&[(1, 5)]);
        auth.lock().update(&confirmed);
        let informer = {
            let manager = Arc::clone(&manager);
            let confirmed = confirmed.clone();
            std::thread::spawn(move || manager.inform_auth_input(1, &confirmed).unwrap())
        };
        std::thread::sleep(Duration::from_millis(50));
        hold.store(false, Ordering::SeqCst);

        tick.join().unwrap();
        informer.join().unwrap();
        wait_for_merge(&manager);

        assert_eq!(manager.predict_frame(), 1);
        let expected = replay_reference(&[confirmed]);
        manager.with_predicted_state(|_, state| assert_eq!(*state, expected));

        // The next tick continues from the adopted frame with its history
        // aligned to it.
        manager.tick();
        assert_eq!(manager.predict_frame(), 2);
        assert_eq!(manager.shared.history.lock().last_frame(), 2);
    }

    #[test]
    fn test_replacement_succeeds_after_snapshot_adoption() {
        let (manager, auth) = manager_with_provider(2);

        // Authoritative frames arrive before prediction ever ran; both
        // adopt the snapshot directly.
        let first = batch(&[(1, 3)]);
        auth.lock().update(&first);
        manager.inform_auth_input(1, &first).unwrap();
        let second = batch(&[(1, 4)]);
        auth.lock().update(&second);
        manager.inform_auth_input(2, &second).unwrap();
        assert_eq!(manager.predict_frame(), 2);

        for _ in 0..3 {
            manager.tick();
        }
        assert_eq!(manager.predict_frame(), 5);

        // A misprediction after the adoption must find every replayed frame
        // in the recorded history.
        let third = batch(&[(1, 7)]);
        auth.lock().update(&third);
        manager.inform_auth_input(3, &third).unwrap();
        wait_for_merge(&manager);

        let mut expected_inputs = vec![first, second, third];
        expected_inputs.extend((0..2).map(|_| batch(&[(1, 2)])));
        let expected = replay_reference(&expected_inputs);
        manager.with_predicted_state(|frame, state| {
            assert_eq!(frame, 5);
            assert_eq!(*state, expected);
        });
    }

    #[test]
    fn test_stopped_manager_ignores_everything() {
        let (manager, auth) = manager_with_provider(2);
        manager.stop();
        manager.tick();
        assert_eq!(manager.predict_frame(), 0);

        let confirmed = batch(&[(1, 1)]);
        auth.lock().update(&confirmed);
        manager.inform_auth_input(1, &confirmed).unwrap();
        assert_eq!(manager.predict_frame(), 0);
    }
}
