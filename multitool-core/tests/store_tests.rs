//! Integration tests for the shared state store
//!
//! The store is the only way data moves between the two cores. These tests
//! hammer it from real threads to check that every observation is a whole
//! state and that a timed-out access changes nothing.

mod common;

use std::sync::Barrier;
use std::thread;

use common::{FakeClock, WallClock};
use multitool_core::shared::{format_address, Sample, SAMPLE_MAX, STATE_WAIT_MS};
use multitool_core::{Clock, StateStore};

// ============================================================================
// Tests for concurrent access
// ============================================================================

#[test]
fn test_paired_fields_are_never_observed_torn() {
    let store = StateStore::new();
    let clock = WallClock::new();
    let start = Barrier::new(3);

    thread::scope(|s| {
        for engaged in [true, false] {
            let (store, clock, start) = (&store, &clock, &start);
            s.spawn(move || {
                start.wait();
                for _ in 0..2_000 {
                    let _ = store.write(clock, STATE_WAIT_MS, |st| {
                        let stamp = store.stamp();
                        st.actuator_engaged.set(engaged, stamp);
                        st.dimmer_level.set(if engaged { 255 } else { 0 }, stamp);
                    });
                }
            });
        }

        start.wait();
        for _ in 0..2_000 {
            if let Ok(snap) = store.read(&clock, STATE_WAIT_MS) {
                let expected = if snap.actuator_engaged.get() { 255 } else { 0 };
                assert_eq!(snap.dimmer_level.get(), expected, "torn read: {:?}", snap);
            }
        }
    });
}

#[test]
fn test_racing_status_writers_leave_one_complete_value() {
    let store = StateStore::new();
    let clock = WallClock::new();
    let start = Barrier::new(2);

    thread::scope(|s| {
        for (clients, octet) in [(1_111u16, 1u8), (2_222, 2)] {
            let (store, clock, start) = (&store, &clock, &start);
            s.spawn(move || {
                start.wait();
                store
                    .write(clock, 1_000, |st| {
                        st.connected_clients = clients;
                        st.assigned_address = format_address([10, 0, 0, octet]);
                    })
                    .unwrap();
            });
        }
    });

    let snap = store.read(&clock, STATE_WAIT_MS).unwrap();
    match snap.connected_clients {
        1_111 => assert_eq!(snap.assigned_address.as_str(), "10.0.0.1"),
        2_222 => assert_eq!(snap.assigned_address.as_str(), "10.0.0.2"),
        other => panic!("unexpected client count {}", other),
    }
}

// ============================================================================
// Tests for bounded waits
// ============================================================================

#[test]
fn test_timed_out_write_changes_nothing() {
    let store = StateStore::new();
    let held = Barrier::new(2);
    let release = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            let clock = WallClock::new();
            store
                .write(&clock, STATE_WAIT_MS, |st| {
                    st.connected_clients = 7;
                    held.wait();
                    release.wait();
                })
                .unwrap();
        });

        held.wait();
        let clock = FakeClock::at(1_000);
        let result = store.set_actuator(&clock, STATE_WAIT_MS, true);
        assert!(result.is_err());
        // The attempt gave up after its bound, not before.
        assert!(clock.now_ms() >= 1_000 + STATE_WAIT_MS);
        release.wait();
    });

    let clock = FakeClock::default();
    let snap = store.read(&clock, STATE_WAIT_MS).unwrap();
    assert!(!snap.actuator_engaged.get());
    assert_eq!(snap.connected_clients, 7);
}

#[test]
fn test_uncontended_access_succeeds_with_zero_wait() {
    let store = StateStore::new();
    let clock = FakeClock::default();

    store.set_servo(&clock, 0, 45).unwrap();
    assert_eq!(store.view(&clock, 0, |st| st.servo_angle.get()).unwrap(), Some(45));
}

// ============================================================================
// Tests for values held in the store
// ============================================================================

#[test]
fn test_sample_is_clamped_before_it_is_stored() {
    let store = StateStore::new();
    let clock = FakeClock::default();

    store
        .write(&clock, STATE_WAIT_MS, |st| st.sensor_sample = Sample::new(u16::MAX))
        .unwrap();
    let sample = store.view(&clock, STATE_WAIT_MS, |st| st.sensor_sample.get()).unwrap();
    assert_eq!(sample, SAMPLE_MAX);
}

#[test]
fn test_initial_state_is_all_off() {
    let store = StateStore::new();
    let snap = store.read(&FakeClock::default(), STATE_WAIT_MS).unwrap();

    assert!(!snap.actuator_engaged.get());
    assert!(!snap.network_ready);
    assert_eq!(snap.connected_clients, 0);
    assert_eq!(snap.dimmer_level.get(), 0);
    assert_eq!(snap.servo_angle.get(), None);
    assert!(snap.assigned_address.is_empty());
}

#[test]
fn test_write_issued_while_store_busy_loses_to_a_later_one() {
    let store = StateStore::new();
    let clock = FakeClock::default();

    // Issued first, but only gets the lock after a later write has landed.
    let early = store.stamp();
    store.set_actuator(&clock, STATE_WAIT_MS, false).unwrap();
    let applied = store
        .write(&clock, STATE_WAIT_MS, |st| st.actuator_engaged.set(true, early))
        .unwrap();

    assert!(!applied);
    assert!(!store.read(&clock, STATE_WAIT_MS).unwrap().actuator_engaged.get());
}
