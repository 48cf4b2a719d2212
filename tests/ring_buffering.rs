//! Scenario 5 end-to-end: a bounded ring's writer must block once full and
//! resume the instant the reader frees a slot, never reordering or losing
//! an item. `flow-ring`'s own unit tests exercise this at the single-chunk
//! level; this test drives it the way the collector actually does, across
//! real writer/reader threads with a ring sized the way a small probe's
//! source would be.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flow_ring::Ring;

#[test]
fn writer_blocks_until_reader_frees_a_slot() {
    let ring = Arc::new(Ring::create(4).expect("capacity 4 is valid"));

    let writer_ring = Arc::clone(&ring);
    let writer = thread::spawn(move || {
        for i in 0..5u64 {
            writer_ring.push(i).expect("ring not stopped");
        }
    });

    let mut received = Vec::new();
    while received.len() < 5 {
        thread::sleep(Duration::from_millis(10));
        received.push(ring.pop().expect("ring not stopped"));
    }

    writer.join().expect("writer thread panicked");
    assert_eq!(received, vec![0, 1, 2, 3, 4]);
}
