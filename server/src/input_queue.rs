//! Merges per-client input submissions into authoritative frame batches.

use log::debug;
use shared::{ClientId, Frame, Input, InputPredictor, UpdateClientInfo};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Frames of lateness bookkeeping kept per client. Reports older than this
/// window may repeat, which only costs a redundant delay sample.
const LATE_REPORT_WINDOW: Frame = 128;

/// Receives a signed delivery offset for a client's input: positive seconds
/// of spare buffering, negative seconds of lateness.
pub type DelayReporter = Box<dyn Fn(ClientId, Frame, f64) + Send + Sync>;

struct ClientRecord<C> {
    id: ClientId,
    /// Input applied on this client's previous frame; the predictor extends
    /// it when no submission arrived in time.
    previous: C,
    pending: HashMap<Frame, (C, Instant)>,
    late_reported: HashSet<Frame>,
    terminated: bool,
}

/// The server-side input buffer for all clients.
///
/// Clients are stored in join order and batches reproduce that order, so a
/// frame's batch is identical on every machine that replays it. An input that
/// arrives after its frame was constructed is dropped and its lateness is
/// reported exactly once.
pub struct ClientInputQueue<C: Input> {
    /// Frame of the most recently constructed batch, -1 before the first.
    frame: Frame,
    tick_rate: f64,
    predictor: InputPredictor<C>,
    on_delay: DelayReporter,
    clients: Vec<ClientRecord<C>>,
    last_construction: Instant,
}

impl<C: Input> ClientInputQueue<C> {
    pub fn new(tick_rate: f64, predictor: InputPredictor<C>, on_delay: DelayReporter) -> Self {
        Self {
            frame: -1,
            tick_rate,
            predictor,
            on_delay,
            clients: Vec::new(),
            last_construction: Instant::now(),
        }
    }

    /// Frame of the most recently constructed batch.
    pub fn frame(&self) -> Frame {
        self.frame
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Registers a client. Inputs from unknown clients are ignored, so this
    /// must precede `add_input`. Re-adding a live client is a no-op.
    pub fn add_client(&mut self, id: ClientId) {
        if self.clients.iter().any(|c| c.id == id && !c.terminated) {
            return;
        }
        self.clients.push(ClientRecord {
            id,
            previous: C::default(),
            pending: HashMap::new(),
            late_reported: HashSet::new(),
            terminated: false,
        });
    }

    /// Marks a client disconnected. Its next batch entry is a final
    /// terminated one; afterwards it disappears from batches entirely.
    pub fn remove_client(&mut self, id: ClientId) {
        if let Some(record) = self.clients.iter_mut().find(|c| c.id == id && !c.terminated) {
            record.terminated = true;
            record.pending.clear();
        }
    }

    /// Buffers a client's input for `frame`. Duplicates for an already
    /// buffered frame are ignored; submissions for already constructed frames
    /// are dropped and reported late once per (client, frame).
    pub fn add_input(&mut self, id: ClientId, frame: Frame, input: C) {
        let constructed = self.frame;
        let tick_rate = self.tick_rate;
        let elapsed = self.last_construction.elapsed().as_secs_f64();

        let Some(record) = self.clients.iter_mut().find(|c| c.id == id && !c.terminated) else {
            debug!("dropping input from unknown client {id} for frame {frame}");
            return;
        };

        if frame <= constructed {
            if record.late_reported.insert(frame) {
                let frames_late = (constructed - frame) as f64;
                let delay = -(frames_late / tick_rate + elapsed);
                (self.on_delay)(id, frame, delay);
            }
            return;
        }

        record.pending.entry(frame).or_insert_with(|| (input, Instant::now()));
    }

    /// Builds the authoritative batch for the next frame.
    ///
    /// Each live client contributes its buffered input for that frame if one
    /// arrived, otherwise the predictor extends its previous input. Buffered
    /// inputs report how long they waited as a positive delay. Terminated
    /// clients contribute one final entry and are then dropped.
    pub fn construct_authoritative_frame(&mut self) -> Vec<UpdateClientInfo<C>> {
        self.frame += 1;
        let frame = self.frame;
        self.last_construction = Instant::now();

        let mut batch = Vec::with_capacity(self.clients.len());
        for record in &mut self.clients {
            if record.terminated {
                batch.push(UpdateClientInfo {
                    id: record.id,
                    input: C::default(),
                    terminated: true,
                });
                continue;
            }

            match record.pending.remove(&frame) {
                Some((input, received)) => {
                    (self.on_delay)(record.id, frame, received.elapsed().as_secs_f64());
                    record.previous = input.clone();
                    batch.push(UpdateClientInfo { id: record.id, input, terminated: false });
                }
                None => {
                    (self.predictor)(&mut record.previous);
                    batch.push(UpdateClientInfo {
                        id: record.id,
                        input: record.previous.clone(),
                        terminated: false,
                    });
                }
            }

            let horizon = frame - LATE_REPORT_WINDOW;
            record.late_reported.retain(|&f| f >= horizon);
        }

        self.clients.retain(|record| !record.terminated);
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::carry_forward;
    use std::sync::{Arc, Mutex};

    type Reports = Arc<Mutex<Vec<(ClientId, Frame, f64)>>>;

    fn queue_with_reports() -> (ClientInputQueue<u8>, Reports) {
        let reports: Reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let queue = ClientInputQueue::new(
            30.0,
            carry_forward(),
            Box::new(move |id, frame, delay| sink.lock().unwrap().push((id, frame, delay))),
        );
        (queue, reports)
    }

    #[test]
    fn test_no_clients_yields_empty_batches() {
        let (mut queue, _) = queue_with_reports();
        assert_eq!(queue.frame(), -1);
        assert!(queue.construct_authoritative_frame().is_empty());
        assert_eq!(queue.frame(), 0);
    }

    #[test]
    fn test_buffered_input_is_consumed_for_its_frame() {
        let (mut queue, reports) = queue_with_reports();
        queue.add_client(1);
        queue.add_input(1, 0, 42);

        let batch = queue.construct_authoritative_frame();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, 1);
        assert_eq!(batch[0].input, 42);
        assert!(!batch[0].terminated);

        // Buffered input reports positive spare time.
        let reported = reports.lock().unwrap().clone();
        assert_eq!(reported.len(), 1);
        assert_eq!((reported[0].0, reported[0].1), (1, 0));
        assert!(reported[0].2 >= 0.0);
    }

    #[test]
    fn test_missing_input_is_predicted_without_report() {
        let (mut queue, reports) = queue_with_reports();
        queue.add_client(1);

        let batch = queue.construct_authoritative_frame();
        assert_eq!(batch[0].input, u8::default());
        assert!(reports.lock().unwrap().is_empty());
    }

    #[test]
    fn test_predictor_extends_last_applied_input() {
        let reports: Reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let mut queue: ClientInputQueue<u8> = ClientInputQueue::new(
            30.0,
            Box::new(|input| *input += 1),
            Box::new(move |id, frame, delay| sink.lock().unwrap().push((id, frame, delay))),
        );
        queue.add_client(1);
        queue.add_input(1, 0, 10);

        assert_eq!(queue.construct_authoritative_frame()[0].input, 10);
        assert_eq!(queue.construct_authoritative_frame()[0].input, 11);
        assert_eq!(queue.construct_authoritative_frame()[0].input, 12);
    }

    #[test]
    fn test_late_input_is_dropped_and_reported_once() {
        let (mut queue, reports) = queue_with_reports();
        queue.add_client(1);
        queue.construct_authoritative_frame();
        queue.construct_authoritative_frame();
        reports.lock().unwrap().clear();

        queue.add_input(1, 0, 9);
        queue.add_input(1, 0, 9);

        let reported = reports.lock().unwrap().clone();
        assert_eq!(reported.len(), 1);
        assert_eq!((reported[0].0, reported[0].1), (1, 0));
        assert!(reported[0].2 < 0.0);

        // The dropped input never shows up in a later batch.
        let batch = queue.construct_authoritative_frame();
        assert_eq!(batch[0].input, u8::default());
    }

    #[test]
    fn test_late_report_dedup_is_bounded_by_the_window() {
        let (mut queue, reports) = queue_with_reports();
        queue.add_client(1);
        queue.construct_authoritative_frame();
        reports.lock().unwrap().clear();

        queue.add_input(1, 0, 9);
        queue.add_input(1, 0, 9);
        assert_eq!(reports.lock().unwrap().len(), 1);

        // Once frame 0 falls out of the bookkeeping window, a repeat
        // submission reports again, but still only once.
        for _ in 0..(LATE_REPORT_WINDOW + 2) {
            queue.construct_authoritative_frame();
        }
        reports.lock().unwrap().clear();

        queue.add_input(1, 0, 9);
        queue.add_input(1, 0, 9);

        let reported = reports.lock().unwrap().clone();
        assert_eq!(reported.len(), 1);
        assert_eq!((reported[0].0, reported[0].1), (1, 0));
        assert!(reported[0].2 < 0.0);
    }

    #[test]
    fn test_duplicate_submission_keeps_the_first() {
        let (mut queue, _) = queue_with_reports();
        queue.add_client(1);
        queue.add_input(1, 0, 5);
        queue.add_input(1, 0, 6);

        assert_eq!(queue.construct_authoritative_frame()[0].input, 5);
    }

    #[test]
    fn test_removed_client_gets_one_terminal_entry() {
        let (mut queue, _) = queue_with_reports();
        queue.add_client(1);
        queue.construct_authoritative_frame();

        queue.remove_client(1);
        let batch = queue.construct_authoritative_frame();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].terminated);

        assert!(queue.construct_authoritative_frame().is_empty());
    }

    #[test]
    fn test_batch_order_follows_join_order() {
        let (mut queue, _) = queue_with_reports();
        queue.add_client(3);
        queue.add_client(1);
        queue.add_client(2);

        let ids: Vec<_> = queue
            .construct_authoritative_frame()
            .iter()
            .map(|info| info.id)
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn test_input_from_unknown_client_is_ignored() {
        let (mut queue, reports) = queue_with_reports();
        queue.add_input(99, 0, 1);
        assert!(queue.construct_authoritative_frame().is_empty());
        assert!(reports.lock().unwrap().is_empty());
    }
}
