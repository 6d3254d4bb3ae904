//! Role-tagged holders for deterministic simulation state.

use crate::{Frame, SessionError, Simulation, UpdateInput, UpdateOutput};
use std::marker::PhantomData;

mod sealed {
    pub trait Sealed {}
}

/// Ownership role of a [`StateHolder`]. The markers are zero-sized and only
/// exist at the type level, so holders for different roles cannot be mixed up
/// while sharing a single implementation.
pub trait Role: sealed::Sealed + Send + 'static {}

/// The server-confirmed, non-speculative timeline.
pub enum Authoritative {}
/// The client's locally advanced, possibly incorrect timeline.
pub enum Predictive {}
/// A transient timeline replayed from a fresh authoritative snapshot.
pub enum Replacement {}
/// Auxiliary copies (inspection, tooling).
pub enum Misc {}

impl sealed::Sealed for Authoritative {}
impl sealed::Sealed for Predictive {}
impl sealed::Sealed for Replacement {}
impl sealed::Sealed for Misc {}
impl Role for Authoritative {}
impl Role for Predictive {}
impl Role for Replacement {}
impl Role for Misc {}

/// Owns one simulation state instance plus its frame number and the lazily
/// computed serialized snapshot and checksum.
///
/// Both caches are invalidated together on every mutation, so a checksum can
/// never describe anything but the current frame.
#[derive(Debug)]
pub struct StateHolder<S: Simulation, R: Role> {
    state: S,
    frame: Frame,
    serialized: Option<Vec<u8>>,
    checksum: Option<u32>,
    _role: PhantomData<R>,
}

impl<S: Simulation, R: Role> StateHolder<S, R> {
    /// A holder at frame 0 with the default-constructed state.
    pub fn new() -> Self {
        Self {
            state: S::default(),
            frame: 0,
            serialized: None,
            checksum: None,
            _role: PhantomData,
        }
    }

    /// Deserializes a snapshot taken at `frame`.
    pub fn from_serialized(bytes: &[u8], frame: Frame) -> Result<Self, SessionError> {
        let state = bincode::deserialize(bytes)?;
        Ok(Self {
            state,
            frame,
            serialized: Some(bytes.to_vec()),
            checksum: None,
            _role: PhantomData,
        })
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Advances by one frame through the user step function.
    pub fn update(&mut self, input: &UpdateInput<S::ClientInput, S::ServerInput>) -> UpdateOutput {
        self.frame += 1;
        self.invalidate();
        self.state.update(input)
    }

    /// Replaces the held state directly, e.g. when seeding from a snapshot.
    pub fn set_from(&mut self, state: S, frame: Frame) {
        self.state = state;
        self.frame = frame;
        self.invalidate();
    }

    /// Serialized snapshot of the current state, cached until the next
    /// mutation.
    pub fn serialized(&mut self) -> Result<&[u8], SessionError> {
        if self.serialized.is_none() {
            self.serialized = Some(bincode::serialize(&self.state)?);
        }
        Ok(self.serialized.as_deref().unwrap_or(&[]))
    }

    /// Fast non-cryptographic checksum of the serialized state, cached until
    /// the next mutation.
    pub fn checksum(&mut self) -> Result<u32, SessionError> {
        if let Some(checksum) = self.checksum {
            return Ok(checksum);
        }
        let checksum = {
            let bytes = self.serialized()?;
            crc32fast::hash(bytes)
        };
        self.checksum = Some(checksum);
        Ok(checksum)
    }

    /// Exchanges the contents of two holders, caches included. Role markers
    /// stay with their holders; only the timelines move.
    pub fn swap<R2: Role>(&mut self, other: &mut StateHolder<S, R2>) {
        std::mem::swap(&mut self.state, &mut other.state);
        std::mem::swap(&mut self.frame, &mut other.frame);
        std::mem::swap(&mut self.serialized, &mut other.serialized);
        std::mem::swap(&mut self.checksum, &mut other.checksum);
    }

    fn invalidate(&mut self) {
        self.serialized = None;
        self.checksum = None;
    }
}

impl<S: Simulation, R: Role> Default for StateHolder<S, R> {
    fn default() -> Self {
        Self::new()
    }
}
