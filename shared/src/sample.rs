//! A small deterministic reference simulation.
//!
//! Each client drives a cart along a one-dimensional track by sending an
//! acceleration every tick; the server contributes a wind term. Everything is
//! integer arithmetic over a `BTreeMap`, so replays and serialized snapshots
//! are byte-for-byte reproducible across machines.

use crate::{ClientId, Simulation, UpdateInput, UpdateOutput};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A cart leaves the session when its position exceeds this magnitude.
pub const TRACK_LIMIT: i64 = 1_000_000;

/// An acceleration of this value requests a server shutdown; used by demos
/// and tests to end a session from the inside.
pub const STOP_SENTINEL: i8 = i8::MIN;

/// Per-tick client input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thrust {
    pub accel: i8,
}

/// Per-tick server input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drift {
    pub wind: i8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub position: i64,
    pub velocity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleGame {
    pub tick: u64,
    pub carts: BTreeMap<ClientId, Cart>,
    pub limit: i64,
}

impl Default for SampleGame {
    fn default() -> Self {
        Self { tick: 0, carts: BTreeMap::new(), limit: TRACK_LIMIT }
    }
}

impl SampleGame {
    /// A game whose carts are kicked after a shorter track, for tests.
    pub fn with_limit(limit: i64) -> Self {
        Self { limit, ..Self::default() }
    }
}

impl Simulation for SampleGame {
    type ClientInput = Thrust;
    type ServerInput = Drift;

    const TICK_RATE: f64 = 30.0;

    fn update(&mut self, input: &UpdateInput<Thrust, Drift>) -> UpdateOutput {
        self.tick += 1;
        let mut output = UpdateOutput::default();

        for info in &input.client_inputs {
            if info.terminated {
                self.carts.remove(&info.id);
                continue;
            }
            if info.input.accel == STOP_SENTINEL {
                output.shall_stop = true;
                continue;
            }
            let cart = self.carts.entry(info.id).or_default();
            cart.velocity += info.input.accel as i64 + input.server_input.wind as i64;
            cart.position += cart.velocity;
            if cart.position.abs() > self.limit {
                output.clients_to_terminate.push(info.id);
            }
        }

        output
    }
}
