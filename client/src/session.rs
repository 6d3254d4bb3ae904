//! The client session: authoritative mirror, prediction, and clock, glued to
//! a transport.

use crate::clock::SynchronizedClock;
use crate::manager::{PredictConfig, PredictManager};
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex};
use shared::clock::Clock;
use shared::transport::{ClientHandler, ClientTransport};
use shared::wire::{ToClient, ToServer};
use shared::{
    carry_forward, hex_dump, Authoritative, Frame, InputPredictor, SessionError, Simulation,
    StateHolder,
};
use std::sync::Arc;

/// Construction-time parameters for a [`Client`].
pub struct ClientConfig<S: Simulation> {
    /// Polled once per predictive tick for the local input.
    pub input_provider: Box<dyn FnMut() -> S::ClientInput + Send>,
    pub client_predictor: InputPredictor<S::ClientInput>,
    pub server_predictor: InputPredictor<S::ServerInput>,
    /// Observes each freshly predicted frame, e.g. to render it.
    pub on_frame: Box<dyn Fn(Frame, &S) + Send + Sync>,
    /// Compare local authoritative checksums against the server's.
    pub verify_checksum: bool,
    /// Spare delivery margin the clock aims for, in seconds.
    pub target_delay: f64,
}

impl<S: Simulation> Default for ClientConfig<S> {
    fn default() -> Self {
        Self {
            input_provider: Box::new(|| Default::default()),
            client_predictor: carry_forward(),
            server_predictor: carry_forward(),
            on_frame: Box::new(|_, _| {}),
            verify_checksum: true,
            target_delay: 0.05,
        }
    }
}

struct Lifecycle {
    stopped: bool,
    fault: Option<SessionError>,
}

struct ClientInner<S: Simulation> {
    auth: Arc<Mutex<StateHolder<S, Authoritative>>>,
    predict: PredictManager<S>,
    clock: Mutex<SynchronizedClock>,
    transport: Arc<dyn ClientTransport>,
    verify_checksum: bool,
    lifecycle: Mutex<Lifecycle>,
    done: Condvar,
}

/// One client's half of a session.
///
/// Maintains two timelines: the authoritative one, advanced strictly by the
/// server's confirmed batches, and the predictive one running ahead of it on
/// speculated inputs. The predictive timeline is what `on_frame` shows.
pub struct Client<S: Simulation> {
    inner: Arc<ClientInner<S>>,
}

impl<S: Simulation> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S: Simulation> Client<S> {
    pub fn new(config: ClientConfig<S>, transport: Arc<dyn ClientTransport>) -> Self {
        let auth = Arc::new(Mutex::new(StateHolder::new()));

        let send_transport = Arc::clone(&transport);
        let predict_config = PredictConfig::<S> {
            input_provider: config.input_provider,
            client_predictor: config.client_predictor,
            server_predictor: config.server_predictor,
            on_input: Box::new(move |frame, input| match bincode::serialize(input) {
                Ok(payload) => {
                    send_transport.send_unreliable(&ToServer::Input { frame, payload });
                }
                Err(err) => error!("cannot encode input for frame {frame}: {err}"),
            }),
            on_frame: config.on_frame,
        };

        Self {
            inner: Arc::new(ClientInner {
                predict: PredictManager::new(predict_config, Arc::clone(&auth)),
                auth,
                clock: Mutex::new(SynchronizedClock::from_rate(S::TICK_RATE, config.target_delay)),
                transport,
                verify_checksum: config.verify_checksum,
                lifecycle: Mutex::new(Lifecycle { stopped: false, fault: None }),
                done: Condvar::new(),
            }),
        }
    }

    /// Attaches to the transport and blocks until the session ends. Returns
    /// the fault that ended it, if any.
    pub fn run(&self) -> Result<(), SessionError> {
        {
            let ticker = Arc::clone(&self.inner);
            let mut clock = self.inner.clock.lock();
            clock
                .start(Box::new(move || ticker.predict.tick()))
                .map_err(|err| SessionError::Task(err.to_string()))?;
        }
        self.inner.transport.bind(Arc::clone(&self.inner) as Arc<dyn ClientHandler>);

        let mut lifecycle = self.inner.lifecycle.lock();
        while !lifecycle.stopped {
            self.inner.done.wait(&mut lifecycle);
        }
        match lifecycle.fault.take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    /// Ends the session cleanly. Idempotent, callable from any thread.
    pub fn stop(&self) {
        self.inner.finish(None);
    }

    /// Frame of the authoritative timeline.
    pub fn auth_frame(&self) -> Frame {
        self.inner.auth.lock().frame()
    }

    /// Checksum of the newest authoritative state.
    pub fn auth_checksum(&self) -> Result<u32, SessionError> {
        self.inner.auth.lock().checksum()
    }

    /// Frame the predictive timeline has reached.
    pub fn predict_frame(&self) -> Frame {
        self.inner.predict.predict_frame()
    }

    /// Runs `f` against the newest predicted state.
    pub fn with_predicted_state<R>(&self, f: impl FnOnce(Frame, &S) -> R) -> R {
        self.inner.predict.with_predicted_state(f)
    }
}

impl<S: Simulation> ClientInner<S> {
    fn finish(&self, fault: Option<SessionError>) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.stopped {
                return;
            }
            lifecycle.stopped = true;
            lifecycle.fault = fault;
        }
        self.predict.stop();
        self.clock.lock().stop();
        self.transport.disconnect();
        self.done.notify_all();
    }

    fn handle_authoritative(
        &self,
        frame: Frame,
        checksum: Option<u32>,
        input_bytes: &[u8],
    ) -> Result<(), SessionError> {
        let input = bincode::deserialize(input_bytes)?;

        let mut auth = self.auth.lock();
        let expected = auth.frame() + 1;
        if frame != expected {
            return Err(SessionError::FrameOrder { expected, got: frame });
        }

        let output = auth.update(&input);
        if self.verify_checksum {
            if let Some(remote) = checksum {
                let local = auth.checksum()?;
                if local != remote {
                    error!(
                        "desync at frame {frame}: state {} input {}",
                        hex_dump(auth.serialized()?),
                        hex_dump(input_bytes)
                    );
                    return Err(SessionError::Desync { frame, local, remote });
                }
            }
        }
        drop(auth);

        self.predict.inform_auth_input(frame, &input)?;

        if output.shall_stop {
            info!("server ended the session at frame {frame}");
            self.finish(None);
        }
        Ok(())
    }
}

impl<S: Simulation> ClientHandler for ClientInner<S> {
    fn on_message(&self, message: ToClient) {
        if self.lifecycle.lock().stopped {
            return;
        }
        match message {
            ToClient::Initialize { client_id, frame, state } => {
                match StateHolder::from_serialized(&state, frame) {
                    Ok(holder) => *self.auth.lock() = holder,
                    Err(err) => {
                        self.finish(Some(err));
                        return;
                    }
                }
                if let Err(err) = self.predict.init(client_id, frame, &state) {
                    self.finish(Some(err));
                    return;
                }
                self.clock.lock().initialize(frame);
                info!("initialized as client {client_id} at frame {frame}");
            }
            ToClient::AuthoritativeInput { frame, checksum, input } => {
                if let Err(err) = self.handle_authoritative(frame, checksum, &input) {
                    error!("session fault: {err}");
                    self.finish(Some(err));
                }
            }
            ToClient::SetDelay { frame, delay } => {
                self.clock.lock().set_delay(frame, delay);
            }
        }
    }

    fn on_disconnect(&self) {
        if !self.lifecycle.lock().stopped {
            warn!("connection to server lost");
            self.finish(Some(SessionError::Transport("connection lost".into())));
        }
    }
}
