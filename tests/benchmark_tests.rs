//! Performance benchmarks for the hot paths of the synchronization layer

use shared::checklist::ChecklistHistory;
use shared::command::{Command, Message, ToolCmd, WorldStamp};
use shared::tool::{Coord3, ToolCall};
use shared::{Checklist, ExecQueue};
use std::time::Instant;

fn tool_message(step: u32) -> Message {
    Message::new(
        7,
        Command::Tool(ToolCmd {
            stamp: WorldStamp::new(step, 42),
            exec: true,
            check_step: step.saturating_sub(1),
            checklist: Checklist::default(),
            call: ToolCall {
                player: 2,
                tool_id: 1,
                waytype: 0,
                pos: Coord3::new(10, 20, 0),
                param: "3".to_string(),
                init: false,
                flags: 0,
                custom: Vec::new(),
            },
        }),
    )
}

/// Benchmarks the full encode/decode cycle of a tool broadcast, the most
/// frequent frame on a busy server.
#[test]
fn benchmark_message_roundtrip() {
    let iterations = 50_000;
    let start = Instant::now();

    for i in 0..iterations {
        let mut pkt = tool_message(i).encode();
        // Force framing the way the socket path would.
        let bytes = pkt.to_bytes().expect("encode failed").to_vec();
        let mut parsed = shared::Packet::from_bytes(&bytes);
        let msg = Message::decode(&mut parsed).expect("decode failed");
        assert_eq!(msg.sender, 7);
    }

    let duration = start.elapsed();
    println!(
        "Message roundtrip: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2_000);
}

/// Benchmarks ordered insertion and draining of the execution queue under
/// out-of-order arrival.
#[test]
fn benchmark_queue_insert_and_drain() {
    let iterations = 10_000;
    let mut queue = ExecQueue::new();
    let start = Instant::now();

    // Interleave two step streams so every other insert lands mid-queue.
    for i in 0..iterations {
        let step = if i % 2 == 0 { 100 + i } else { 100 + iterations - i };
        queue.enqueue(tool_message(step), 100, 42, true);
    }
    let mut drained = 0;
    let mut step = 100;
    while !queue.is_empty() {
        step += 64;
        drained += queue.drain_due(step).len();
    }

    let duration = start.elapsed();
    println!(
        "Queue insert+drain: {} messages in {:?} ({:.2} ns/msg)",
        drained,
        duration,
        duration.as_nanos() as f64 / drained.max(1) as f64
    );

    assert!(duration.as_millis() < 2_000);
}

/// Benchmarks checklist bookkeeping: one record plus one lookup per
/// simulated step, the per-frame cost of desync detection.
#[test]
fn benchmark_checklist_history() {
    let iterations = 100_000u32;
    let mut history = ChecklistHistory::new();
    let start = Instant::now();

    for step in 0..iterations {
        history.record(
            step,
            Checklist {
                random_seed: step.wrapping_mul(2_654_435_761),
                object_count: step % 513,
                player_mask: 0b10,
                state_hash: step.rotate_left(7),
            },
        );
        // Probe a step that is still inside the retention window.
        let probe = step.saturating_sub(32);
        let _ = history.get(probe);
    }

    let duration = start.elapsed();
    println!(
        "Checklist history: {} record+get pairs in {:?} ({:.2} ns/pair)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2_000);
}
