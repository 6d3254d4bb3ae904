//! Core contract shared by the rollback server and client.
//!
//! Both sides of a session run the exact same deterministic step function;
//! only inputs ever travel over the wire. This crate defines that contract
//! (the [`Simulation`] trait and its input/output types) together with the
//! building blocks both peers need:
//!
//! - [`queue::IndexedQueue`] — frame-indexed, contiguous, evictable storage
//! - [`holder::StateHolder`] — role-tagged state with cached snapshots/checksums
//! - [`pool::BufferPool`] — pooled byte buffers returned automatically on drop
//! - [`wire`] — the logical messages exchanged between server and client
//! - [`transport`] — the seam between the engine and the byte-level network
//! - [`memory`] — an in-process transport used by tests
//! - [`clock`] — tick sources driving the deterministic loops
//! - [`sample`] — a small reference simulation for demos and tests

pub mod clock;
pub mod holder;
pub mod memory;
pub mod pool;
pub mod queue;
pub mod sample;
pub mod transport;
pub mod wire;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use holder::{Authoritative, Misc, Predictive, Replacement, Role, StateHolder};
pub use pool::{encode_pooled, BufferPool, PooledBuffer};
pub use queue::IndexedQueue;

/// A 64-bit monotonically increasing tick counter. The sole ordering key for
/// all state and input in a session.
pub type Frame = i64;

/// Identifier the transport assigns to a connected client.
pub type ClientId = u32;

/// Marker bound for per-tick input payloads. Implemented automatically for
/// any type with the required capabilities.
pub trait Input: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Input for T where T: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// The user-supplied deterministic step function.
///
/// `update` must be a pure function of the current state and the given input:
/// no hidden randomness, no wall-clock reads, no iteration over
/// nondeterministically ordered containers. Serialization must be
/// byte-for-byte reproducible — checksums and the byte comparison of
/// predicted against confirmed inputs both rely on it.
pub trait Simulation: Clone + Default + Serialize + DeserializeOwned + Send + 'static {
    type ClientInput: Input;
    type ServerInput: Input;

    /// Ticks per second the session runs at.
    const TICK_RATE: f64;

    fn update(&mut self, input: &UpdateInput<Self::ClientInput, Self::ServerInput>) -> UpdateOutput;
}

/// One client's contribution to a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateClientInfo<C> {
    pub id: ClientId,
    pub input: C,
    /// Set on exactly one final frame after the client disconnected.
    pub terminated: bool,
}

/// The complete input for one deterministic step.
///
/// `client_inputs` keeps the server-side insertion order and is reproduced
/// identically on every replay of the same frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInput<C, S> {
    pub server_input: S,
    pub client_inputs: Vec<UpdateClientInfo<C>>,
}

/// What a step asked the orchestrator to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutput {
    pub clients_to_terminate: Vec<ClientId>,
    pub shall_stop: bool,
}

/// Pluggable input prediction, injected at construction. The default is
/// carry-forward: next tick's input is assumed equal to the previous one.
pub type InputPredictor<I> = Box<dyn Fn(&mut I) + Send + Sync>;

/// Carry-forward predictor: leaves the previous input untouched.
pub fn carry_forward<I: Input>() -> InputPredictor<I> {
    Box::new(|_| {})
}

/// Errors that end or refuse work within a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The authoritative input stream skipped or repeated a frame. A
    /// transport or protocol bug, never recoverable.
    #[error("authoritative input out of order: expected frame {expected}, got {got}")]
    FrameOrder { expected: Frame, got: Frame },

    /// Client and server disagree on the authoritative state.
    #[error("desync at frame {frame}: local checksum {local:#010x}, server checksum {remote:#010x}")]
    Desync { frame: Frame, local: u32, remote: u32 },

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("background task failure: {0}")]
    Task(String),

    #[error("session already stopped")]
    Stopped,
}

/// Textual dump of a byte blob, used by desync diagnostics so a diverged
/// snapshot can be inspected offline.
pub fn hex_dump(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
