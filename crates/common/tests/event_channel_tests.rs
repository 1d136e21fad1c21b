//! Host Event Channel Tests
//!
//! Tests for the channel carrying OS notifications from the host callback
//! thread into the bridge.
//!
//! # Test Scenarios
//! - Events cross threads in order
//! - Closing from either side wakes a blocked receiver
//! - Sends after close fail without panicking
//! - Concurrent producers lose nothing
//!
//! Run with: `cargo test -p common --test event_channel_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, wait_until};
use common::{HostEvent, create_event_channel};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

fn attached(name: &str) -> HostEvent {
    HostEvent::DeviceAttached {
        name: name.to_string(),
    }
}

// ============================================================================
// Cross-thread Delivery
// ============================================================================

#[test]
fn test_events_cross_threads_in_order() {
    let (tx, rx) = create_event_channel();

    let producer = thread::spawn(move || {
        tx.send(attached("dev-a")).unwrap();
        tx.send(HostEvent::PermissionDecision {
            name: "dev-a".to_string(),
            granted: false,
        })
        .unwrap();
        tx.send(HostEvent::DeviceDetached {
            name: "dev-a".to_string(),
        })
        .unwrap();
    });

    assert_eq!(rx.recv().unwrap(), attached("dev-a"));
    assert!(matches!(
        rx.recv().unwrap(),
        HostEvent::PermissionDecision { granted: false, .. }
    ));
    assert!(matches!(rx.recv().unwrap(), HostEvent::DeviceDetached { .. }));

    producer.join().unwrap();

    // All senders dropped: the channel is closed and empty
    assert!(rx.recv().is_err());
}

#[test]
fn test_concurrent_producers() {
    let (tx, rx) = create_event_channel();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    tx.send(attached(&format!("dev-{}-{}", p, i))).unwrap();
                }
            })
        })
        .collect();
    drop(tx);

    for producer in producers {
        producer.join().unwrap();
    }

    let mut names = HashSet::new();
    while let Ok(HostEvent::DeviceAttached { name }) = rx.recv() {
        names.insert(name);
    }
    assert_eq!(names.len(), 200);
}

// ============================================================================
// Closing
// ============================================================================

#[test]
fn test_receiver_close_wakes_blocked_recv() {
    let (tx, rx) = create_event_channel();
    let finished = Arc::new(AtomicBool::new(false));

    let consumer = {
        let rx = rx.clone();
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            let result = rx.recv();
            finished.store(true, Ordering::SeqCst);
            result
        })
    };

    thread::sleep(Duration::from_millis(20));
    assert!(!finished.load(Ordering::SeqCst));

    assert!(rx.close());
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || finished.load(Ordering::SeqCst)));
    assert!(consumer.join().unwrap().is_err());

    assert!(tx.is_closed());
    assert!(tx.send(attached("late")).is_err());
}

#[test]
fn test_sender_close_drains_remaining_events() {
    let (tx, rx) = create_event_channel();

    tx.send(attached("dev-a")).unwrap();
    assert!(tx.close());
    assert!(!tx.close());

    assert_eq!(rx.recv().unwrap(), attached("dev-a"));
    assert!(rx.recv().is_err());
    assert!(rx.try_recv().is_none());
}
