//! In-process transport used by tests and local demos.
//!
//! A [`MemoryNetwork`] is a hub both sides connect through. Reliable and
//! unreliable sends share the same lossless channels, so the only difference
//! from a socket transport is that nothing is ever dropped. Broadcast walks
//! clients in id order, which keeps multi-client tests deterministic.

use crate::transport::{
    ClientHandler, ClientTransport, ServerHandler, ServerTransport, TransportError,
};
use crate::wire::{ToClient, ToServer};
use crate::{ClientId, Frame};
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::error;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

enum ServerEvent {
    Join(ClientId),
    Input(ClientId, Frame, Vec<u8>),
    Leave(ClientId),
}

enum ClientEvent {
    Message(ToClient),
    Disconnect,
}

struct Hub {
    next_id: AtomicU32,
    to_server: Sender<ServerEvent>,
    server_rx: Mutex<Option<Receiver<ServerEvent>>>,
    clients: Mutex<BTreeMap<ClientId, Sender<ClientEvent>>>,
}

impl Hub {
    fn deliver(&self, client: ClientId, event: ClientEvent) -> Result<(), TransportError> {
        let clients = self.clients.lock();
        let tx = clients.get(&client).ok_or(TransportError::Unknown(client))?;
        tx.send(event).map_err(|_| TransportError::Closed)
    }
}

/// Hub connecting one in-process server to any number of in-process clients.
/// Cloning yields another handle to the same hub.
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        let (to_server, server_rx) = unbounded();
        Self {
            hub: Arc::new(Hub {
                next_id: AtomicU32::new(1),
                to_server,
                server_rx: Mutex::new(Some(server_rx)),
                clients: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// The server endpoint. Call once.
    pub fn server_transport(&self) -> Arc<MemoryServerTransport> {
        Arc::new(MemoryServerTransport { hub: Arc::clone(&self.hub) })
    }

    /// Connects a new client and returns its endpoint.
    pub fn connect(&self) -> Arc<MemoryClientTransport> {
        let client_id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        self.hub.clients.lock().insert(client_id, tx);
        Arc::new(MemoryClientTransport {
            hub: Arc::clone(&self.hub),
            client_id,
            rx: Mutex::new(Some(rx)),
        })
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryServerTransport {
    hub: Arc<Hub>,
}

impl ServerTransport for MemoryServerTransport {
    fn bind(&self, handler: Arc<dyn ServerHandler>) {
        let rx = self.hub.server_rx.lock().take();
        let Some(rx) = rx else { return };
        std::thread::Builder::new()
            .name("memory-server".into())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    match event {
                        ServerEvent::Join(id) => handler.on_join(id),
                        ServerEvent::Input(id, frame, payload) => {
                            handler.on_input(id, frame, &payload)
                        }
                        ServerEvent::Leave(id) => handler.on_leave(id),
                    }
                }
            })
            .map_err(|err| error!("cannot spawn memory-server pump: {err}"))
            .ok();
    }

    fn send_reliable(&self, client: ClientId, message: &ToClient) -> Result<(), TransportError> {
        self.hub.deliver(client, ClientEvent::Message(message.clone()))
    }

    fn broadcast_reliable(&self, message: &ToClient) -> Result<(), TransportError> {
        let clients = self.hub.clients.lock();
        for tx in clients.values() {
            tx.send(ClientEvent::Message(message.clone()))
                .map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }

    fn send_unreliable(&self, client: ClientId, message: &ToClient) {
        let _ = self.hub.deliver(client, ClientEvent::Message(message.clone()));
    }

    fn kick(&self, client: ClientId) {
        let tx = self.hub.clients.lock().remove(&client);
        if let Some(tx) = tx {
            let _ = tx.send(ClientEvent::Disconnect);
        }
    }
}

pub struct MemoryClientTransport {
    hub: Arc<Hub>,
    client_id: ClientId,
    rx: Mutex<Option<Receiver<ClientEvent>>>,
}

impl MemoryClientTransport {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }
}

impl ClientTransport for MemoryClientTransport {
    fn bind(&self, handler: Arc<dyn ClientHandler>) {
        let rx = self.rx.lock().take();
        let Some(rx) = rx else { return };
        let client_id = self.client_id;
        let to_server = self.hub.to_server.clone();
        std::thread::Builder::new()
            .name(format!("memory-client-{client_id}"))
            .spawn(move || {
                // Join is announced from the pump thread so the server never
                // sees a client before its message loop is live.
                let _ = to_server.send(ServerEvent::Join(client_id));
                while let Ok(event) = rx.recv() {
                    match event {
                        ClientEvent::Message(message) => handler.on_message(message),
                        ClientEvent::Disconnect => {
                            handler.on_disconnect();
                            break;
                        }
                    }
                }
            })
            .map_err(|err| error!("cannot spawn memory-client pump: {err}"))
            .ok();
    }

    fn send_unreliable(&self, message: &ToServer) {
        let ToServer::Input { frame, payload } = message;
        let _ = self
            .hub
            .to_server
            .send(ServerEvent::Input(self.client_id, *frame, payload.clone()));
    }

    fn disconnect(&self) {
        if self.hub.clients.lock().remove(&self.client_id).is_some() {
            let _ = self.hub.to_server.send(ServerEvent::Leave(self.client_id));
        }
    }
}
