//! The authoritative session engine.

use crate::input_queue::ClientInputQueue;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use shared::clock::{Clock, TickClock};
use shared::transport::{ServerHandler, ServerTransport};
use shared::wire::ToClient;
use shared::{
    carry_forward, Authoritative, ClientId, Frame, InputPredictor, SessionError, Simulation,
    StateHolder, UpdateInput,
};
use std::sync::Arc;

/// Produces the server's own contribution to each tick.
pub type ServerInputProvider<S> = Box<dyn FnMut() -> S + Send>;

/// Construction-time parameters for a [`Server`].
pub struct ServerConfig<S: Simulation> {
    /// Polled once per tick for the server input of the next frame.
    pub server_input: ServerInputProvider<S::ServerInput>,
    /// Extends a client's previous input when its submission missed a frame.
    pub client_predictor: InputPredictor<S::ClientInput>,
    /// Attach a state checksum to every authoritative broadcast.
    pub send_checksum: bool,
}

impl<S: Simulation> Default for ServerConfig<S> {
    fn default() -> Self {
        Self {
            server_input: Box::new(|| Default::default()),
            client_predictor: carry_forward(),
            send_checksum: true,
        }
    }
}

struct Lifecycle {
    stopped: bool,
    clock: Option<TickClock>,
}

struct ServerInner<S: Simulation> {
    // Lock order: queue before holder. Both are held across a tick so a
    // joining client always snapshots a frame no batch has passed.
    queue: Mutex<ClientInputQueue<S::ClientInput>>,
    holder: Mutex<StateHolder<S, Authoritative>>,
    server_input: Mutex<ServerInputProvider<S::ServerInput>>,
    transport: Arc<dyn ServerTransport>,
    send_checksum: bool,
    lifecycle: Mutex<Lifecycle>,
    done: Condvar,
}

/// The authoritative side of a session.
///
/// Owns the only non-speculative timeline. Every clock tick it freezes the
/// input batch for the next frame, steps the simulation, and broadcasts the
/// batch over the reliable channel.
pub struct Server<S: Simulation> {
    inner: Arc<ServerInner<S>>,
}

impl<S: Simulation> Clone for Server<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S: Simulation> Server<S> {
    pub fn new(config: ServerConfig<S>, transport: Arc<dyn ServerTransport>) -> Self {
        Self::with_state(S::default(), config, transport)
    }

    /// Starts the authoritative timeline from a prepared state at frame 0.
    pub fn with_state(
        state: S,
        config: ServerConfig<S>,
        transport: Arc<dyn ServerTransport>,
    ) -> Self {
        let delay_transport = Arc::clone(&transport);
        let queue = ClientInputQueue::new(
            S::TICK_RATE,
            config.client_predictor,
            Box::new(move |client, frame, delay| {
                delay_transport.send_unreliable(client, &ToClient::SetDelay { frame, delay });
            }),
        );

        let mut holder = StateHolder::new();
        holder.set_from(state, 0);

        Self {
            inner: Arc::new(ServerInner {
                queue: Mutex::new(queue),
                holder: Mutex::new(holder),
                server_input: Mutex::new(config.server_input),
                transport,
                send_checksum: config.send_checksum,
                lifecycle: Mutex::new(Lifecycle { stopped: false, clock: None }),
                done: Condvar::new(),
            }),
        }
    }

    /// Binds the transport and starts the tick clock. Returns immediately.
    pub fn start(&self) -> std::io::Result<()> {
        self.inner.transport.bind(Arc::clone(&self.inner) as Arc<dyn ServerHandler>);

        let mut clock = TickClock::from_rate(S::TICK_RATE);
        let inner = Arc::clone(&self.inner);
        clock.start(Box::new(move || inner.tick()))?;

        self.inner.lifecycle.lock().clock = Some(clock);
        info!("server started at {} ticks/s", S::TICK_RATE);
        Ok(())
    }

    /// Blocks until the session stops, then joins the clock thread.
    pub fn wait(&self) {
        let clock = {
            let mut lifecycle = self.inner.lifecycle.lock();
            while !lifecycle.stopped {
                self.inner.done.wait(&mut lifecycle);
            }
            lifecycle.clock.take()
        };
        if let Some(mut clock) = clock {
            clock.stop();
        }
    }

    /// Starts the session and blocks until it stops.
    pub fn run(&self) -> std::io::Result<()> {
        self.start()?;
        self.wait();
        Ok(())
    }

    /// Signals the session to stop. Safe to call from any thread, including
    /// the tick path itself.
    pub fn stop(&self) {
        self.inner.halt();
    }

    /// Frame of the newest authoritative state.
    pub fn frame(&self) -> Frame {
        self.inner.holder.lock().frame()
    }

    /// Runs `f` against the current authoritative state.
    pub fn with_state_now<R>(&self, f: impl FnOnce(Frame, &S) -> R) -> R {
        let holder = self.inner.holder.lock();
        f(holder.frame(), holder.state())
    }
}

impl<S: Simulation> ServerInner<S> {
    fn halt(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if !lifecycle.stopped {
            lifecycle.stopped = true;
            info!("server stopping");
        }
        self.done.notify_all();
    }

    fn tick(&self) {
        if self.lifecycle.lock().stopped {
            return;
        }
        if let Err(err) = self.advance_frame() {
            error!("tick failed: {err}");
        }
    }

    fn advance_frame(&self) -> Result<(), SessionError> {
        let mut queue = self.queue.lock();
        let client_inputs = queue.construct_authoritative_frame();
        let server_input = {
            let mut provider = self.server_input.lock();
            (*provider)()
        };
        let input = UpdateInput { server_input, client_inputs };

        let mut holder = self.holder.lock();
        let output = holder.update(&input);
        let frame = holder.frame();
        let checksum = if self.send_checksum { Some(holder.checksum()?) } else { None };
        drop(holder);

        let message = ToClient::AuthoritativeInput {
            frame,
            checksum,
            input: bincode::serialize(&input)?,
        };
        if let Err(err) = self.transport.broadcast_reliable(&message) {
            warn!("broadcast of frame {frame} failed: {err}");
        }

        for client in output.clients_to_terminate {
            info!("terminating client {client} at frame {frame}");
            self.transport.kick(client);
            queue.remove_client(client);
        }
        drop(queue);

        if output.shall_stop {
            self.halt();
        }
        Ok(())
    }
}

impl<S: Simulation> ServerHandler for ServerInner<S> {
    fn on_join(&self, client: ClientId) {
        let mut queue = self.queue.lock();
        queue.add_client(client);

        let mut holder = self.holder.lock();
        let frame = holder.frame();
        let state = match holder.serialized() {
            Ok(bytes) => bytes.to_vec(),
            Err(err) => {
                error!("cannot snapshot state for client {client}: {err}");
                return;
            }
        };
        drop(holder);

        info!("client {client} joined at frame {frame}");
        // Still holding the queue lock: ticks broadcast under it, so no
        // frame past the snapshot can reach this client first.
        let message = ToClient::Initialize { client_id: client, frame, state };
        if let Err(err) = self.transport.send_reliable(client, &message) {
            warn!("initialize for client {client} failed: {err}");
        }
        drop(queue);
    }

    fn on_input(&self, client: ClientId, frame: Frame, payload: &[u8]) {
        match bincode::deserialize(payload) {
            Ok(input) => self.queue.lock().add_input(client, frame, input),
            Err(err) => debug!("undecodable input from client {client} for frame {frame}: {err}"),
        }
    }

    fn on_leave(&self, client: ClientId) {
        info!("client {client} left");
        self.queue.lock().remove_client(client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::memory::MemoryNetwork;
    use shared::sample::SampleGame;
    use shared::transport::{ClientTransport, TransportError};
    use shared::wire::ToServer;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    struct NullTransport;

    impl ServerTransport for NullTransport {
        fn bind(&self, _handler: Arc<dyn ServerHandler>) {}
        fn send_reliable(&self, _c: ClientId, _m: &ToClient) -> Result<(), TransportError> {
            Ok(())
        }
        fn broadcast_reliable(&self, _m: &ToClient) -> Result<(), TransportError> {
            Ok(())
        }
        fn send_unreliable(&self, _c: ClientId, _m: &ToClient) {}
        fn kick(&self, _c: ClientId) {}
    }

    #[test]
    fn test_join_advances_through_ticks() {
        let server: Server<SampleGame> =
            Server::new(ServerConfig::default(), Arc::new(NullTransport));
        server.inner.on_join(7);
        assert_eq!(server.inner.queue.lock().len(), 1);

        server.inner.on_input(7, 0, &bincode::serialize(&shared::sample::Thrust { accel: 2 }).unwrap());
        server.inner.advance_frame().unwrap();
        assert_eq!(server.frame(), 1);
        server.with_state_now(|_, state| {
            assert_eq!(state.carts[&7].velocity, 2);
        });
    }

    #[test]
    fn test_leave_produces_terminal_frame_then_silence() {
        let server: Server<SampleGame> =
            Server::new(ServerConfig::default(), Arc::new(NullTransport));
        server.inner.on_join(3);
        server.inner.advance_frame().unwrap();
        server.with_state_now(|_, state| assert!(state.carts.contains_key(&3)));

        server.inner.on_leave(3);
        server.inner.advance_frame().unwrap();
        server.with_state_now(|_, state| assert!(!state.carts.contains_key(&3)));
        assert!(server.inner.queue.lock().is_empty());
    }

    #[test]
    fn test_stop_sentinel_stops_the_session() {
        let server: Server<SampleGame> =
            Server::new(ServerConfig::default(), Arc::new(NullTransport));
        server.inner.on_join(1);
        let stop = bincode::serialize(&shared::sample::Thrust {
            accel: shared::sample::STOP_SENTINEL,
        })
        .unwrap();
        server.inner.on_input(1, 0, &stop);

        server.inner.advance_frame().unwrap();
        assert!(server.inner.lifecycle.lock().stopped);
    }

    #[test]
    fn test_runaway_cart_is_kicked() {
        let server: Server<SampleGame> = Server::with_state(
            SampleGame::with_limit(5),
            ServerConfig::default(),
            Arc::new(NullTransport),
        );

        server.inner.on_join(1);
        let full = bincode::serialize(&shared::sample::Thrust { accel: i8::MAX }).unwrap();
        for frame in 0..5 {
            server.inner.on_input(1, frame, &full);
            server.inner.advance_frame().unwrap();
        }
        assert!(server.inner.queue.lock().is_empty());
    }

    #[test]
    fn test_snapshot_is_sent_before_any_later_broadcast() {
        #[derive(Debug)]
        enum Sent {
            Init(ClientId, Frame),
            Broadcast(Frame),
        }

        struct LogTransport {
            log: Mutex<Vec<Sent>>,
        }

        impl ServerTransport for LogTransport {
            fn bind(&self, _handler: Arc<dyn ServerHandler>) {}
            fn send_reliable(&self, c: ClientId, m: &ToClient) -> Result<(), TransportError> {
                if let ToClient::Initialize { frame, .. } = m {
                    self.log.lock().push(Sent::Init(c, *frame));
                }
                Ok(())
            }
            fn broadcast_reliable(&self, m: &ToClient) -> Result<(), TransportError> {
                if let ToClient::AuthoritativeInput { frame, .. } = m {
                    self.log.lock().push(Sent::Broadcast(*frame));
                }
                Ok(())
            }
            fn send_unreliable(&self, _c: ClientId, _m: &ToClient) {}
            fn kick(&self, _c: ClientId) {}
        }

        let transport = Arc::new(LogTransport { log: Mutex::new(Vec::new()) });
        let server: Server<SampleGame> = Server::new(
            ServerConfig::default(),
            Arc::clone(&transport) as Arc<dyn ServerTransport>,
        );

        // Joins race a hammering tick loop; every snapshot must still reach
        // its client before any broadcast of a later frame.
        let running = Arc::new(AtomicBool::new(true));
        let ticker = {
            let server = server.clone();
            let running = Arc::clone(&running);
            std::thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    server.inner.advance_frame().unwrap();
                }
            })
        };
        for client in 1..=200 {
            server.inner.on_join(client);
        }
        running.store(false, Ordering::SeqCst);
        ticker.join().unwrap();

        let log = transport.log.lock();
        let mut latest_broadcast = -1;
        for entry in log.iter() {
            match entry {
                Sent::Broadcast(frame) => latest_broadcast = *frame,
                Sent::Init(client, frame) => assert!(
                    *frame >= latest_broadcast,
                    "client {client} got its snapshot at frame {frame} after \
                     a broadcast of frame {latest_broadcast}"
                ),
            }
        }
        assert!(log.iter().any(|entry| matches!(entry, Sent::Init(_, _))));
    }

    #[test]
    fn test_end_to_end_over_memory_transport() {
        let network = MemoryNetwork::new();
        let server: Server<SampleGame> =
            Server::new(ServerConfig::default(), network.server_transport());
        server.start().unwrap();

        let joined = Arc::new(AtomicU32::new(0));
        struct JoinWatcher {
            joined: Arc<AtomicU32>,
        }
        impl shared::transport::ClientHandler for JoinWatcher {
            fn on_message(&self, message: ToClient) {
                if let ToClient::Initialize { client_id, .. } = message {
                    self.joined.store(client_id, Ordering::SeqCst);
                }
            }
            fn on_disconnect(&self) {}
        }

        let client = network.connect();
        client.bind(Arc::new(JoinWatcher { joined: Arc::clone(&joined) }));
        client.send_unreliable(&ToServer::Input {
            frame: 0,
            payload: bincode::serialize(&shared::sample::Thrust { accel: 1 }).unwrap(),
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while joined.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_ne!(joined.load(Ordering::SeqCst), 0);

        while server.frame() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(server.frame() >= 3);

        server.stop();
        server.wait();
    }
}
