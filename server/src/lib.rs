//! Authoritative side of a rollback session.
//!
//! The server owns the only non-speculative timeline. Every tick it merges
//! buffered client inputs into one authoritative batch, steps the simulation,
//! and broadcasts the batch so clients can confirm or correct their
//! predictions.

pub mod input_queue;
pub mod network;
pub mod server;

pub use input_queue::ClientInputQueue;
pub use server::{Server, ServerConfig};
