//! Predictive side of a rollback session.
//!
//! The client mirrors the server's authoritative timeline and runs a second,
//! speculative one ahead of it so local input is felt immediately. Wrong
//! guesses are corrected by replacement replays that re-simulate from the
//! last authoritative snapshot in the background, and an adaptive clock keeps
//! the client's inputs arriving at the server just in time.

pub mod clock;
pub mod coordinator;
pub mod manager;
pub mod network;
pub mod receiver;
pub mod replacer;
pub mod runner;
pub mod session;

pub use manager::{PredictConfig, PredictManager};
pub use session::{Client, ClientConfig};
