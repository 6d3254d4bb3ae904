//! Socket transport for the server.
//!
//! Reliable traffic runs over TCP with 4-byte little-endian length framing;
//! unreliable traffic over UDP on the same port. A client announces its UDP
//! address with a bare presence datagram after it learns its id from the TCP
//! `Hello`.

use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use shared::transport::{ServerHandler, ServerTransport, TransportError};
use shared::wire::{Datagram, TcpFrame, ToClient, ToServer};
use shared::ClientId;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Peer {
    reliable: mpsc::UnboundedSender<Vec<u8>>,
    udp_addr: Option<SocketAddr>,
    reader: JoinHandle<()>,
}

/// TCP + UDP server transport. Assigns client ids in accept order.
pub struct SocketServerTransport {
    handle: tokio::runtime::Handle,
    listener: Mutex<Option<TcpListener>>,
    udp: Arc<UdpSocket>,
    peers: Arc<Mutex<BTreeMap<ClientId, Peer>>>,
    next_id: Arc<AtomicU32>,
}

impl SocketServerTransport {
    /// Binds both sockets on `addr`. Call from within a tokio runtime.
    pub async fn listen(addr: &str) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let udp = Arc::new(UdpSocket::bind(addr).await?);
        info!("listening on {addr} (tcp+udp)");

        Ok(Arc::new(Self {
            handle: tokio::runtime::Handle::current(),
            listener: Mutex::new(Some(listener)),
            udp,
            peers: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: Arc::new(AtomicU32::new(1)),
        }))
    }

    fn spawn_accept_loop(&self, listener: TcpListener, handler: Arc<dyn ServerHandler>) {
        let peers = Arc::clone(&self.peers);
        let next_id = Arc::clone(&self.next_id);

        self.handle.spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        error!("accept failed: {err}");
                        continue;
                    }
                };
                if let Err(err) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed for {addr}: {err}");
                }

                let client_id = next_id.fetch_add(1, Ordering::Relaxed);
                info!("client {client_id} connected from {addr}");
                let (read_half, mut write_half) = stream.into_split();

                let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
                tokio::spawn(async move {
                    while let Some(bytes) = rx.recv().await {
                        let len = (bytes.len() as u32).to_le_bytes();
                        if write_half.write_all(&len).await.is_err()
                            || write_half.write_all(&bytes).await.is_err()
                        {
                            break;
                        }
                    }
                });

                let hello = match serialize(&TcpFrame::Hello { client_id }) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        error!("cannot encode hello: {err}");
                        continue;
                    }
                };
                if tx.send(hello).is_err() {
                    continue;
                }

                let reader = {
                    let peers = Arc::clone(&peers);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        drain_until_eof(read_half).await;
                        // A kick already removed the peer; only a real
                        // disconnect reports on_leave.
                        if peers.lock().remove(&client_id).is_some() {
                            handler.on_leave(client_id);
                        }
                    })
                };

                peers.lock().insert(client_id, Peer { reliable: tx, udp_addr: None, reader });
                handler.on_join(client_id);
            }
        });
    }

    fn spawn_udp_loop(&self, handler: Arc<dyn ServerHandler>) {
        let udp = Arc::clone(&self.udp);
        let peers = Arc::clone(&self.peers);

        self.handle.spawn(async move {
            let mut buffer = [0u8; 2048];
            loop {
                let (len, addr) = match udp.recv_from(&mut buffer).await {
                    Ok(received) => received,
                    Err(err) => {
                        error!("udp receive failed: {err}");
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        continue;
                    }
                };
                let datagram: Datagram = match deserialize(&buffer[..len]) {
                    Ok(datagram) => datagram,
                    Err(err) => {
                        warn!("undecodable datagram from {addr}: {err}");
                        continue;
                    }
                };

                {
                    let mut peers = peers.lock();
                    let Some(peer) = peers.get_mut(&datagram.client_id) else {
                        debug!("datagram from unknown client {}", datagram.client_id);
                        continue;
                    };
                    peer.udp_addr = Some(addr);
                }

                if let Some(ToServer::Input { frame, payload }) = datagram.message {
                    handler.on_input(datagram.client_id, frame, &payload);
                }
            }
        });
    }
}

async fn drain_until_eof(mut read_half: OwnedReadHalf) {
    let mut buffer = [0u8; 256];
    loop {
        match read_half.read(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

impl ServerTransport for SocketServerTransport {
    fn bind(&self, handler: Arc<dyn ServerHandler>) {
        let listener = self.listener.lock().take();
        let Some(listener) = listener else { return };
        self.spawn_accept_loop(listener, Arc::clone(&handler));
        self.spawn_udp_loop(handler);
    }

    fn send_reliable(&self, client: ClientId, message: &ToClient) -> Result<(), TransportError> {
        let bytes = serialize(&TcpFrame::Message(message.clone()))
            .map_err(|err| TransportError::Io(err.to_string()))?;
        let peers = self.peers.lock();
        let peer = peers.get(&client).ok_or(TransportError::Unknown(client))?;
        peer.reliable.send(bytes).map_err(|_| TransportError::Closed)
    }

    fn broadcast_reliable(&self, message: &ToClient) -> Result<(), TransportError> {
        let bytes = serialize(&TcpFrame::Message(message.clone()))
            .map_err(|err| TransportError::Io(err.to_string()))?;
        let peers = self.peers.lock();
        for (client, peer) in peers.iter() {
            if peer.reliable.send(bytes.clone()).is_err() {
                debug!("reliable channel to client {client} is gone");
            }
        }
        Ok(())
    }

    fn send_unreliable(&self, client: ClientId, message: &ToClient) {
        let addr = {
            let peers = self.peers.lock();
            peers.get(&client).and_then(|peer| peer.udp_addr)
        };
        let Some(addr) = addr else { return };
        let Ok(bytes) = serialize(message) else { return };
        // Losses and full send buffers are both acceptable here.
        let _ = self.udp.try_send_to(&bytes, addr);
    }

    fn kick(&self, client: ClientId) {
        let peer = self.peers.lock().remove(&client);
        if let Some(peer) = peer {
            info!("kicking client {client}");
            peer.reader.abort();
        }
    }
}
