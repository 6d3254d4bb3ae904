//! Adaptive tick source that keeps client inputs arriving at the server just
//! ahead of their frames.
//!
//! The server reports a signed delivery offset for each input it receives.
//! The clock normalizes those samples against its own scheduling drift,
//! tracks the tightest one over a sliding window, and stretches or shrinks
//! its period so the worst case settles at the configured target margin.

use parking_lot::{Condvar, Mutex, MutexGuard};
use shared::clock::{Clock, MAX_CLOCK_WAIT};
use shared::{Frame, IndexedQueue};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Number of delay samples the worst-case estimate looks back over.
const DELAY_WINDOW: usize = 32;

/// Fastest catch-up speed, as a multiple of the nominal tick rate.
const MAX_CATCH_UP: f64 = 16.0;

struct SyncState {
    running: bool,
    initialized: bool,
    period: Duration,
    /// One-shot request to fire immediately instead of waiting a period.
    fire_now: bool,
    origin: Instant,
    base_frame: Frame,
    ticks: u64,
    /// Emission time (seconds since origin) of each not-yet-settled frame.
    emissions: IndexedQueue<f64>,
    window: VecDeque<f64>,
}

struct SyncShared {
    state: Mutex<SyncState>,
    cond: Condvar,
}

pub struct SynchronizedClock {
    tick_rate: f64,
    target_delay: f64,
    shared: Arc<SyncShared>,
    handle: Option<JoinHandle<()>>,
}

impl SynchronizedClock {
    /// `target_delay` is the spare delivery margin to aim for, in seconds.
    pub fn from_rate(tick_rate: f64, target_delay: f64) -> Self {
        Self {
            tick_rate,
            target_delay,
            shared: Arc::new(SyncShared {
                state: Mutex::new(SyncState {
                    running: false,
                    initialized: false,
                    period: Duration::from_secs_f64(1.0 / tick_rate),
                    fire_now: false,
                    origin: Instant::now(),
                    base_frame: 0,
                    ticks: 0,
                    emissions: IndexedQueue::new(),
                    window: VecDeque::new(),
                }),
                cond: Condvar::new(),
            }),
            handle: None,
        }
    }

    /// Anchors the clock to the session's initial frame. The first emission
    /// belongs to `frame + 1`.
    pub fn initialize(&self, frame: Frame) {
        let mut state = self.shared.state.lock();
        state.origin = Instant::now();
        state.base_frame = frame;
        state.ticks = 0;
        state.emissions.set(frame + 1);
        state.window.clear();
        state.period = Duration::from_secs_f64(1.0 / self.tick_rate);
        state.initialized = true;
        self.shared.cond.notify_all();
    }

    /// Feeds one delivery offset reported by the server for `frame` and
    /// retunes the period. Samples for frames already settled are ignored.
    pub fn set_delay(&self, frame: Frame, delay: f64) {
        let mut state = self.shared.state.lock();
        if !state.initialized {
            return;
        }
        let Some(&emitted) = state.emissions.get(frame) else {
            return;
        };
        state.emissions.pop(frame);

        // Subtract the scheduling drift this clock had at emission time, so
        // the sample reflects the network and server alone.
        let ideal = (frame - state.base_frame) as f64 / self.tick_rate;
        let drift_at_emit = ideal - emitted;
        let normalized = delay - drift_at_emit;

        state.window.push_back(normalized);
        while state.window.len() > DELAY_WINDOW {
            state.window.pop_front();
        }
        let worst = state.window.iter().copied().fold(f64::INFINITY, f64::min);

        // Where this clock stands right now relative to its ideal schedule.
        let now_drift = state.ticks as f64 / self.tick_rate - state.origin.elapsed().as_secs_f64();

        let nominal = 1.0 / self.tick_rate;
        let next = nominal + (worst + now_drift - self.target_delay);
        if next <= 0.0 {
            state.period = Duration::from_secs_f64(nominal / MAX_CATCH_UP);
            state.fire_now = true;
            self.shared.cond.notify_all();
        } else {
            state.period = Duration::from_secs_f64(next.max(nominal / MAX_CATCH_UP));
        }
    }

    #[cfg(test)]
    fn current_period(&self) -> Duration {
        self.shared.state.lock().period
    }

    /// Injects an emission as if the thread had fired at `seconds`, moving
    /// the origin so that "now" coincides with the emission.
    #[cfg(test)]
    fn force_emit(&self, seconds: f64) -> Frame {
        let mut state = self.shared.state.lock();
        state.origin = Instant::now() - Duration::from_secs_f64(seconds);
        state.ticks += 1;
        state.emissions.add(seconds)
    }
}

impl Clock for SynchronizedClock {
    fn start(&mut self, mut on_tick: Box<dyn FnMut() + Send>) -> std::io::Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.shared.state.lock().running = true;

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new().name("sync-clock".into()).spawn(move || {
            let mut last_fire = Instant::now();
            let mut state = shared.state.lock();
            while state.running {
                if !state.initialized {
                    shared.cond.wait_for(&mut state, MAX_CLOCK_WAIT);
                    last_fire = Instant::now();
                    continue;
                }

                let now = Instant::now();
                let deadline = last_fire + state.period;
                if !state.fire_now && now < deadline {
                    let wait = (deadline - now).min(MAX_CLOCK_WAIT);
                    shared.cond.wait_for(&mut state, wait);
                    continue;
                }

                state.fire_now = false;
                last_fire = now;
                let emitted = (now - state.origin).as_secs_f64();
                state.emissions.add(emitted);
                state.ticks += 1;
                MutexGuard::unlocked(&mut state, || on_tick());
            }
        })?;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SynchronizedClock {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Period math is exercised without the clock thread: emissions are
    // injected directly and the schedule drift terms cancel by construction.

    #[test]
    fn test_on_target_sample_keeps_the_nominal_period() {
        let clock = SynchronizedClock::from_rate(10.0, 0.05);
        clock.initialize(0);

        // Frame 1 emitted exactly on its ideal schedule.
        let frame = clock.force_emit(0.1);
        assert_eq!(frame, 1);
        clock.set_delay(frame, 0.05);

        assert_approx_eq!(clock.current_period().as_secs_f64(), 0.1, 0.02);
    }

    #[test]
    fn test_excess_margin_slows_the_clock() {
        let clock = SynchronizedClock::from_rate(10.0, 0.05);
        clock.initialize(0);

        let frame = clock.force_emit(0.1);
        clock.set_delay(frame, 0.15);

        // 100ms of extra margin stretches the period by that amount.
        assert_approx_eq!(clock.current_period().as_secs_f64(), 0.2, 0.02);
    }

    #[test]
    fn test_late_arrival_triggers_catch_up() {
        let clock = SynchronizedClock::from_rate(10.0, 0.05);
        clock.initialize(0);

        let frame = clock.force_emit(0.1);
        clock.set_delay(frame, -0.3);

        assert!(clock.shared.state.lock().fire_now);
        assert_approx_eq!(
            clock.current_period().as_secs_f64(),
            0.1 / MAX_CATCH_UP,
            0.001
        );
    }

    #[test]
    fn test_worst_sample_in_window_governs() {
        let clock = SynchronizedClock::from_rate(10.0, 0.05);
        clock.initialize(0);

        let first = clock.force_emit(0.1);
        let second = clock.force_emit(0.2);
        clock.set_delay(first, 0.02);
        clock.set_delay(second, 0.3);

        // The tight 0.02 sample still dominates the generous one.
        assert!(clock.current_period().as_secs_f64() < 0.1);
    }

    #[test]
    fn test_settled_frames_are_ignored() {
        let clock = SynchronizedClock::from_rate(10.0, 0.05);
        clock.initialize(0);

        let first = clock.force_emit(0.1);
        let second = clock.force_emit(0.2);
        clock.set_delay(second, 0.05);
        let period = clock.current_period();

        // A report for an already settled frame changes nothing.
        clock.set_delay(first, -5.0);
        assert_eq!(clock.current_period(), period);
        assert!(!clock.shared.state.lock().fire_now);
    }

    #[test]
    fn test_ticks_only_after_initialize() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        let mut clock = SynchronizedClock::from_rate(100.0, 0.0);
        clock
            .start(Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(ticks.load(Ordering::Relaxed), 0);

        clock.initialize(5);
        std::thread::sleep(Duration::from_millis(200));
        clock.stop();
        assert!(ticks.load(Ordering::Relaxed) >= 5);

        // Emissions were recorded for frames following the anchor.
        let state = clock.shared.state.lock();
        assert_eq!(state.emissions.first_frame(), 6);
        assert!(!state.emissions.is_empty());
    }
}
