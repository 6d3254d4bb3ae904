//! The seam between the session engine and the byte-level network.
//!
//! The server and client orchestrators are written against these traits only.
//! A transport owns client id assignment and must preserve per-peer ordering
//! on its reliable channel; the unreliable channel may drop, duplicate, or
//! reorder freely.

use crate::wire::{ToClient, ToServer};
use crate::{ClientId, Frame};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown client {0}")]
    Unknown(ClientId),

    #[error("transport closed")]
    Closed,

    #[error("io failure: {0}")]
    Io(String),
}

/// Callbacks the server engine registers with its transport.
///
/// The transport must deliver `on_join` for a client before any of its
/// `on_input` calls, and `on_leave` exactly once per joined client.
pub trait ServerHandler: Send + Sync {
    fn on_join(&self, client: ClientId);
    fn on_input(&self, client: ClientId, frame: Frame, payload: &[u8]);
    fn on_leave(&self, client: ClientId);
}

/// Server side of a transport.
pub trait ServerTransport: Send + Sync {
    /// Starts accepting clients and routing their traffic to `handler`.
    fn bind(&self, handler: Arc<dyn ServerHandler>);

    /// Sends on the ordered reliable channel to one client.
    fn send_reliable(&self, client: ClientId, message: &ToClient) -> Result<(), TransportError>;

    /// Sends on the ordered reliable channel to every connected client.
    fn broadcast_reliable(&self, message: &ToClient) -> Result<(), TransportError>;

    /// Fire-and-forget send; losses are acceptable.
    fn send_unreliable(&self, client: ClientId, message: &ToClient);

    /// Forcibly disconnects a client. The transport must not report a
    /// subsequent `on_leave` for it.
    fn kick(&self, client: ClientId);
}

/// Callbacks the client engine registers with its transport.
pub trait ClientHandler: Send + Sync {
    fn on_message(&self, message: ToClient);
    fn on_disconnect(&self);
}

/// Client side of a transport. Created already connected; the assigned client
/// id is known before `bind`.
pub trait ClientTransport: Send + Sync {
    fn bind(&self, handler: Arc<dyn ClientHandler>);

    /// Fire-and-forget send; must not block the tick loop.
    fn send_unreliable(&self, message: &ToServer);

    fn disconnect(&self);
}
