//! Multi-producer/multi-consumer accounting for the bounded queue.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use infer_core::BoundedQueue;

#[test]
fn produced_equals_consumed_plus_dropped_at_quiescence() {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 3;
    const PER_PRODUCER: u64 = 2_000;

    let queue: Arc<BoundedQueue<u64>> = Arc::new(BoundedQueue::new(16));
    let consumed = Arc::new(AtomicU64::new(0));

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = queue.clone();
            let consumed = consumed.clone();
            thread::spawn(move || {
                loop {
                    match queue.pop(Duration::from_millis(100)) {
                        Some(_) => {
                            consumed.fetch_add(1, Ordering::SeqCst);
                        }
                        None if queue.is_stopped() && queue.is_empty() => break,
                        None => {}
                    }
                }
            })
        })
        .collect();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    assert!(queue.push(p as u64 * PER_PRODUCER + i));
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }

    // Let consumers drain what survived admission, then stop.
    while !queue.is_empty() {
        thread::sleep(Duration::from_millis(10));
    }
    queue.stop();
    for consumer in consumers {
        consumer.join().unwrap();
    }

    let produced = PRODUCERS as u64 * PER_PRODUCER;
    assert_eq!(produced, consumed.load(Ordering::SeqCst) + queue.dropped_count());
}
