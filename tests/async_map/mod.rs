// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use quarry::async_map::{AsyncMapConsumer, Logger, Reader};
use quarry::task_system::TaskSystem;

fn ignore_failures() -> Logger {
    Arc::new(|_msg, _fatal| {})
}

fn record_failures(slot: &Arc<Mutex<Vec<String>>>) -> Logger {
    let slot = Arc::clone(slot);
    Arc::new(move |msg, fatal| {
        if fatal {
            slot.lock().push(msg.to_string());
        }
    })
}

#[test]
fn reader_runs_at_most_once_per_key() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let reader: Reader<u64, u64> = {
        let invocations = Arc::clone(&invocations);
        Arc::new(move |_ts, setter, _logger, _subcaller, key| {
            invocations.fetch_add(1, Ordering::SeqCst);
            setter(key * 2);
        })
    };
    let map = AsyncMapConsumer::new(reader);
    let ts = TaskSystem::new(4);
    let sum = Arc::new(AtomicUsize::new(0));
    for _ in 0..64 {
        let sum = Arc::clone(&sum);
        map.consume_after_keys_ready(
            &ts,
            &[21],
            move |values| {
                sum.fetch_add(values[0] as usize, Ordering::SeqCst);
            },
            ignore_failures(),
        );
    }
    ts.finish();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(sum.load(Ordering::SeqCst), 64 * 42);
}

#[test]
fn fan_in_preserves_key_order() {
    let reader: Reader<u64, String> = Arc::new(move |_ts, setter, _logger, _subcaller, key| {
        // Delay small keys so completion order differs from request order.
        std::thread::sleep(std::time::Duration::from_millis(20 - key));
        setter(format!("v{key}"));
    });
    let map = AsyncMapConsumer::new(reader);
    let ts = TaskSystem::new(4);
    let observed = Arc::new(Mutex::new(Vec::new()));
    {
        let observed = Arc::clone(&observed);
        map.consume_after_keys_ready(
            &ts,
            &[3, 1, 2],
            move |values| {
                *observed.lock() = values.to_vec();
            },
            ignore_failures(),
        );
    }
    ts.finish();
    assert_eq!(*observed.lock(), ["v3", "v1", "v2"]);
}

#[test]
fn sub_requests_fan_out_and_join() {
    // Key 0 depends on keys 1..=4 and sums them.
    let reader: Reader<u64, u64> = Arc::new(move |_ts, setter, _logger, subcaller, key| {
        if *key == 0 {
            subcaller.call(
                &[1, 2, 3, 4],
                move |values| setter(values.iter().sum()),
                ignore_failures(),
            );
        } else {
            setter(*key * 10);
        }
    });
    let map = AsyncMapConsumer::new(reader);
    let ts = TaskSystem::new(2);
    let result = Arc::new(AtomicUsize::new(0));
    {
        let result = Arc::clone(&result);
        map.consume_after_keys_ready(
            &ts,
            &[0],
            move |values| {
                result.store(values[0] as usize, Ordering::SeqCst);
            },
            ignore_failures(),
        );
    }
    ts.finish();
    assert_eq!(result.load(Ordering::SeqCst), 100);
}

#[test]
fn failures_propagate_to_consumers() {
    let reader: Reader<u64, u64> = Arc::new(move |_ts, setter, logger, _subcaller, key| {
        if *key == 13 {
            logger("unlucky", true);
        } else {
            setter(*key);
        }
    });
    let map = AsyncMapConsumer::new(reader);
    let ts = TaskSystem::new(2);
    let failures = Arc::new(Mutex::new(Vec::new()));
    let delivered = Arc::new(AtomicUsize::new(0));
    {
        let delivered = Arc::clone(&delivered);
        map.consume_after_keys_ready(
            &ts,
            &[7, 13],
            move |_values| {
                delivered.fetch_add(1, Ordering::SeqCst);
            },
            record_failures(&failures),
        );
    }
    ts.finish();
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("unlucky"));
}

#[test]
fn stored_failures_are_not_retried() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let reader: Reader<u64, u64> = {
        let invocations = Arc::clone(&invocations);
        Arc::new(move |_ts, _setter, logger, _subcaller, _key| {
            invocations.fetch_add(1, Ordering::SeqCst);
            logger("boom", true);
        })
    };
    let map = AsyncMapConsumer::new(reader);
    let ts = TaskSystem::new(2);
    let failures = Arc::new(Mutex::new(Vec::new()));
    map.consume_after_keys_ready(&ts, &[1], |_| {}, record_failures(&failures));
    map.consume_after_keys_ready(&ts, &[1], |_| {}, record_failures(&failures));
    ts.finish();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(failures.lock().len(), 2);
}

#[test]
fn request_cycles_are_detected() {
    // a -> b -> a; both keys must fail and the pool must drain.
    let reader: Reader<String, u64> = Arc::new(move |_ts, setter, logger, subcaller, key| {
        let other = if key == "a" { "b" } else { "a" };
        subcaller.call(
            &[other.to_string()],
            move |values| setter(values[0] + 1),
            logger,
        );
    });
    let map = AsyncMapConsumer::new(reader);
    let ts = TaskSystem::new(2);
    let failures = Arc::new(Mutex::new(Vec::new()));
    let delivered = Arc::new(AtomicUsize::new(0));
    {
        let delivered = Arc::clone(&delivered);
        map.consume_after_keys_ready(
            &ts,
            &["a".to_string()],
            move |_values| {
                delivered.fetch_add(1, Ordering::SeqCst);
            },
            record_failures(&failures),
        );
    }
    ts.finish();
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    let failures = failures.lock();
    assert!(!failures.is_empty());
    assert!(failures.iter().any(|msg| msg.contains("cycle")));
}

#[test]
fn self_cycle_is_detected() {
    let reader: Reader<String, u64> = Arc::new(move |_ts, setter, logger, subcaller, key| {
        subcaller.call(
            &[key.clone()],
            move |values| setter(values[0]),
            logger,
        );
    });
    let map = AsyncMapConsumer::new(reader);
    let ts = TaskSystem::new(2);
    let failures = Arc::new(Mutex::new(Vec::new()));
    map.consume_after_keys_ready(&ts, &["loop".to_string()], |_| {}, record_failures(&failures));
    ts.finish();
    assert!(failures.lock().iter().any(|msg| msg.contains("cycle")));
}

#[test]
fn cancellation_fails_new_requests() {
    let reader: Reader<u64, u64> = Arc::new(move |_ts, setter, _logger, _subcaller, key| {
        setter(*key);
    });
    let map = AsyncMapConsumer::new(reader);
    let ts = TaskSystem::new(2);
    ts.cancel();
    let failures = Arc::new(Mutex::new(Vec::new()));
    map.consume_after_keys_ready(&ts, &[1], |_| {}, record_failures(&failures));
    ts.finish();
    assert_eq!(failures.lock().len(), 1);
}
