//! Tick sources driving the deterministic loops.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Upper bound on any single wait inside a clock thread so `stop` is always
/// observed promptly.
pub const MAX_CLOCK_WAIT: Duration = Duration::from_millis(50);

/// A source of tick callbacks on a dedicated thread.
pub trait Clock: Send {
    /// Starts the clock thread. `on_tick` runs once per tick until `stop`.
    fn start(&mut self, on_tick: Box<dyn FnMut() + Send>) -> std::io::Result<()>;

    /// Stops the clock and joins its thread. Idempotent.
    fn stop(&mut self);
}

struct TickShared {
    running: Mutex<bool>,
    cond: Condvar,
}

/// Fixed-period clock used by the server loop. If a tick callback overruns,
/// missed ticks are skipped rather than bunched up.
pub struct TickClock {
    period: Duration,
    shared: Arc<TickShared>,
    handle: Option<JoinHandle<()>>,
}

impl TickClock {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            shared: Arc::new(TickShared {
                running: Mutex::new(false),
                cond: Condvar::new(),
            }),
            handle: None,
        }
    }

    pub fn from_rate(ticks_per_second: f64) -> Self {
        Self::new(Duration::from_secs_f64(1.0 / ticks_per_second))
    }
}

impl Clock for TickClock {
    fn start(&mut self, mut on_tick: Box<dyn FnMut() + Send>) -> std::io::Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        *self.shared.running.lock() = true;

        let shared = Arc::clone(&self.shared);
        let period = self.period;
        let handle = std::thread::Builder::new().name("tick-clock".into()).spawn(move || {
            let mut next = Instant::now() + period;
            let mut running = shared.running.lock();
            while *running {
                let now = Instant::now();
                if now < next {
                    let wait = (next - now).min(MAX_CLOCK_WAIT);
                    shared.cond.wait_for(&mut running, wait);
                    continue;
                }
                next = now + period;
                MutexGuard::unlocked(&mut running, || on_tick());
            }
        })?;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        {
            let mut running = self.shared.running.lock();
            *running = false;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TickClock {
    fn drop(&mut self) {
        self.stop();
    }
}
