//! Logical messages exchanged between server and client.
//!
//! Simulation payloads (state snapshots, input batches, single inputs) travel
//! as opaque `Vec<u8>` blobs so the protocol itself stays independent of the
//! concrete simulation type. Each side encodes and decodes the blobs against
//! its own `Simulation` parameters.

use crate::{ClientId, Frame};
use serde::{Deserialize, Serialize};

/// Server-to-client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToClient {
    /// Sent once on join. Carries the authoritative state snapshot the
    /// client's timelines start from.
    Initialize {
        client_id: ClientId,
        frame: Frame,
        state: Vec<u8>,
    },
    /// The confirmed input batch for one frame, sent every tick. `input` is a
    /// serialized `UpdateInput`. Frames arrive in order and without gaps on
    /// the reliable channel.
    AuthoritativeInput {
        frame: Frame,
        checksum: Option<u32>,
        input: Vec<u8>,
    },
    /// Measured delivery offset for an input the client sent for `frame`.
    /// Positive means the input arrived with time to spare, negative means it
    /// was late.
    SetDelay { frame: Frame, delay: f64 },
}

/// Client-to-server messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToServer {
    /// The client's input for `frame`. `payload` is a serialized
    /// `Simulation::ClientInput`.
    Input { frame: Frame, payload: Vec<u8> },
}

/// Framing for the reliable stream. The server opens every connection with
/// `Hello` so the client learns its id before any session traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TcpFrame {
    Hello { client_id: ClientId },
    Message(ToClient),
}

/// One unreliable packet from a client. `message: None` is a bare presence
/// ping that teaches the server the client's datagram address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datagram {
    pub client_id: ClientId,
    pub message: Option<ToServer>,
}
