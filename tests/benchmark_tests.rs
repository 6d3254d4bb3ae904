//! Coarse performance regression tests. Bounds are deliberately loose so
//! they only catch order-of-magnitude regressions, not machine noise.

use shared::sample::{Drift, SampleGame, Thrust};
use shared::{
    encode_pooled, Authoritative, BufferPool, IndexedQueue, Simulation, StateHolder,
    UpdateClientInfo, UpdateInput,
};
use std::time::{Duration, Instant};

fn eight_cart_input() -> UpdateInput<Thrust, Drift> {
    UpdateInput {
        server_input: Drift { wind: 1 },
        client_inputs: (0..8)
            .map(|id| UpdateClientInfo {
                id,
                input: Thrust { accel: (id % 5) as i8 - 2 },
                terminated: false,
            })
            .collect(),
    }
}

#[test]
fn bench_indexed_queue_add_and_pop() {
    let mut queue = IndexedQueue::new();
    let operations = 1_000_000;

    let start = Instant::now();
    for i in 0..operations {
        queue.add(i);
        if i % 16 == 15 {
            queue.pop(queue.first_frame() + 15);
        }
    }
    let elapsed = start.elapsed();

    println!(
        "queue: {operations} add/pop cycles in {:?} ({:.0} ops/s)",
        elapsed,
        operations as f64 / elapsed.as_secs_f64()
    );
    assert!(elapsed < Duration::from_secs(5), "queue ops took {elapsed:?}");
}

#[test]
fn bench_simulation_updates_with_checksums() {
    let mut holder: StateHolder<SampleGame, Authoritative> = StateHolder::new();
    let input = eight_cart_input();
    let frames = 10_000;

    let start = Instant::now();
    for _ in 0..frames {
        holder.update(&input);
        holder.checksum().unwrap();
    }
    let elapsed = start.elapsed();

    let per_frame = elapsed / frames;
    println!("holder: {frames} update+checksum frames in {elapsed:?} ({per_frame:?}/frame)");
    // A 30 Hz session leaves ~33ms per frame; stay far under it.
    assert!(per_frame < Duration::from_millis(3), "frame cost {per_frame:?}");
}

#[test]
fn bench_pooled_encoding_reuses_buffers() {
    let pool = BufferPool::new();
    let input = eight_cart_input();
    let iterations = 100_000;

    // Warm up so the steady state reuses one buffer.
    drop(encode_pooled(&pool, &input).unwrap());

    let start = Instant::now();
    for _ in 0..iterations {
        let buffer = encode_pooled(&pool, &input).unwrap();
        assert!(!buffer.is_empty());
    }
    let elapsed = start.elapsed();

    println!(
        "pool: {iterations} encodes in {elapsed:?} ({:.0} encodes/s)",
        iterations as f64 / elapsed.as_secs_f64()
    );
    assert_eq!(pool.available(), 1);
    assert!(elapsed < Duration::from_secs(5), "encoding took {elapsed:?}");
}

#[test]
fn bench_replay_catch_up_rate() {
    // A replacement must replay frames much faster than real time produces
    // them, otherwise it can never catch the predictive timeline.
    let mut holder: StateHolder<SampleGame, Authoritative> = StateHolder::new();
    let input = eight_cart_input();
    let frames = 3_000;

    let start = Instant::now();
    for _ in 0..frames {
        holder.update(&input);
    }
    let elapsed = start.elapsed();

    let replayed_per_second = frames as f64 / elapsed.as_secs_f64();
    println!("replay: {replayed_per_second:.0} frames/s");
    assert!(
        replayed_per_second > SampleGame::TICK_RATE * 10.0,
        "replay only manages {replayed_per_second:.0} frames/s"
    );
}
