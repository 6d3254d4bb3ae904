//! Socket transport for the client. Mirrors the server's framing: reliable
//! TCP with 4-byte little-endian length prefixes, unreliable UDP alongside.

use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use shared::transport::{ClientHandler, ClientTransport};
use shared::wire::{Datagram, TcpFrame, ToClient, ToServer};
use shared::ClientId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;

pub struct SocketClientTransport {
    handle: tokio::runtime::Handle,
    client_id: ClientId,
    read_half: Mutex<Option<OwnedReadHalf>>,
    /// Held only to keep the connection open; dropped on disconnect.
    write_half: Mutex<Option<OwnedWriteHalf>>,
    udp: Arc<UdpSocket>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl SocketClientTransport {
    /// Connects both sockets and completes the `Hello` handshake.
    pub async fn connect(addr: &str) -> Result<Arc<Self>, Box<dyn std::error::Error>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut read_half, write_half) = stream.into_split();

        let frame = read_frame(&mut read_half).await?;
        let TcpFrame::Hello { client_id } = deserialize(&frame)? else {
            return Err("server did not open with a hello".into());
        };
        info!("connected to {addr} as client {client_id}");

        let udp = UdpSocket::bind("0.0.0.0:0").await?;
        udp.connect(addr).await?;
        // Teach the server our datagram address before any input flows.
        let ping = serialize(&Datagram { client_id, message: None })?;
        udp.send(&ping).await?;

        Ok(Arc::new(Self {
            handle: tokio::runtime::Handle::current(),
            client_id,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(Some(write_half)),
            udp: Arc::new(udp),
            tasks: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }
}

async fn read_frame(read_half: &mut OwnedReadHalf) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    read_half.read_exact(&mut len).await?;
    let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
    read_half.read_exact(&mut bytes).await?;
    Ok(bytes)
}

impl ClientTransport for SocketClientTransport {
    fn bind(&self, handler: Arc<dyn ClientHandler>) {
        let read_half = self.read_half.lock().take();
        let Some(mut read_half) = read_half else { return };
        let mut tasks = self.tasks.lock();

        {
            let handler = Arc::clone(&handler);
            let closed = Arc::clone(&self.closed);
            tasks.push(self.handle.spawn(async move {
                loop {
                    match read_frame(&mut read_half).await {
                        Ok(bytes) => match deserialize::<TcpFrame>(&bytes) {
                            Ok(TcpFrame::Message(message)) => handler.on_message(message),
                            Ok(TcpFrame::Hello { .. }) => {}
                            Err(err) => warn!("undecodable reliable frame: {err}"),
                        },
                        Err(err) => {
                            if !closed.swap(true, Ordering::AcqRel) {
                                debug!("reliable stream ended: {err}");
                                handler.on_disconnect();
                            }
                            return;
                        }
                    }
                }
            }));
        }

        {
            let udp = Arc::clone(&self.udp);
            tasks.push(self.handle.spawn(async move {
                let mut buffer = [0u8; 2048];
                loop {
                    match udp.recv(&mut buffer).await {
                        Ok(len) => match deserialize::<ToClient>(&buffer[..len]) {
                            Ok(message) => handler.on_message(message),
                            Err(err) => warn!("undecodable datagram: {err}"),
                        },
                        Err(err) => {
                            error!("udp receive failed: {err}");
                            return;
                        }
                    }
                }
            }));
        }
    }

    fn send_unreliable(&self, message: &ToServer) {
        let datagram = Datagram { client_id: self.client_id, message: Some(message.clone()) };
        let Ok(bytes) = serialize(&datagram) else { return };
        // Losses and full send buffers are both acceptable here.
        let _ = self.udp.try_send(&bytes);
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::Release);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        // Dropping the write half sends EOF so the server sees a clean leave.
        self.write_half.lock().take();
        self.read_half.lock().take();
    }
}
