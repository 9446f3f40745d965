//! Integration tests for WiFi link bring-up
//!
//! Walks `LinkManager` through connect retries, radio power-cycles, the
//! provisioning window and link loss using a scripted radio.

mod common;

use common::{creds, FakeLink};
use multitool_core::link::{
    LinkEvent, LinkManager, LinkState, CONNECT_TIMEOUT_MS, MAX_ATTEMPTS, PROVISION_WINDOW_MS,
    RESET_COOLDOWN_MS,
};

// ============================================================================
// Tests for connecting
// ============================================================================

#[test]
fn test_stored_credentials_connect_on_first_pass() {
    let mut link = LinkManager::new(Some(creds("lab", "password1")));
    let mut radio = FakeLink {
        reachable: true,
        ..FakeLink::default()
    };

    assert_eq!(link.maintain(&mut radio, 0), None);
    assert_eq!(radio.connects, vec!["lab"]);
    assert_eq!(link.maintain(&mut radio, 100), Some(LinkEvent::Connected));
    assert!(link.is_connected());
    assert_eq!(link.ssid(), "lab");

    // Steady state reports nothing.
    assert_eq!(link.maintain(&mut radio, 200), None);
}

#[test]
fn test_failed_attempts_retry_then_power_cycle_and_provision() {
    let mut link = LinkManager::new(Some(creds("lab", "password1")));
    let mut radio = FakeLink::default();

    let mut now = 0;
    link.maintain(&mut radio, now);
    for attempt in 1..=MAX_ATTEMPTS {
        assert_eq!(
            link.state(),
            LinkState::Connecting {
                attempt,
                started_ms: now
            }
        );
        now += CONNECT_TIMEOUT_MS + 1;
        assert_eq!(link.maintain(&mut radio, now), None);
    }

    assert_eq!(radio.connects.len(), MAX_ATTEMPTS as usize);
    assert_eq!(radio.power_cycles, 1);
    assert_eq!(
        link.state(),
        LinkState::Cooldown {
            until_ms: now + RESET_COOLDOWN_MS,
            provision: true
        }
    );

    // The radio stays quiet for the whole cooldown.
    link.maintain(&mut radio, now + RESET_COOLDOWN_MS - 1);
    assert!(!radio.portal_open);
    link.maintain(&mut radio, now + RESET_COOLDOWN_MS);
    assert!(radio.portal_open);
    assert!(matches!(link.state(), LinkState::Provisioning { .. }));
}

#[test]
fn test_late_association_still_counts() {
    let mut link = LinkManager::new(Some(creds("lab", "password1")));
    let mut radio = FakeLink::default();

    link.maintain(&mut radio, 0);
    link.maintain(&mut radio, CONNECT_TIMEOUT_MS + 1);
    radio.connected = true;
    assert_eq!(link.maintain(&mut radio, CONNECT_TIMEOUT_MS + 2), Some(LinkEvent::Connected));
    assert_eq!(radio.connects.len(), 2);
}

// ============================================================================
// Tests for provisioning
// ============================================================================

#[test]
fn test_missing_credentials_open_provisioning_window() {
    let mut link = LinkManager::new(None);
    let mut radio = FakeLink::default();

    link.maintain(&mut radio, 1_000);
    assert_eq!(
        link.state(),
        LinkState::Provisioning {
            deadline_ms: 1_000 + PROVISION_WINDOW_MS
        }
    );
    assert!(radio.connects.is_empty());
}

#[test]
fn test_submitted_credentials_are_reported_and_tried() {
    let mut link = LinkManager::new(None);
    let mut radio = FakeLink {
        reachable: true,
        ..FakeLink::default()
    };
    link.maintain(&mut radio, 0);

    radio.submitted = Some(creds("home", "hunter22"));
    assert_eq!(
        link.maintain(&mut radio, 5_000),
        Some(LinkEvent::Provisioned(creds("home", "hunter22")))
    );
    assert!(!radio.portal_open);
    assert_eq!(radio.connects, vec!["home"]);
    assert_eq!(link.maintain(&mut radio, 5_100), Some(LinkEvent::Connected));
}

#[test]
fn test_expired_window_requests_restart_once() {
    let mut link = LinkManager::new(None);
    let mut radio = FakeLink::default();
    link.maintain(&mut radio, 0);

    assert_eq!(link.maintain(&mut radio, PROVISION_WINDOW_MS - 1), None);
    assert_eq!(
        link.maintain(&mut radio, PROVISION_WINDOW_MS),
        Some(LinkEvent::RestartRequired)
    );
    assert_eq!(link.state(), LinkState::Expired);
    assert!(!radio.portal_open);
    assert_eq!(link.maintain(&mut radio, PROVISION_WINDOW_MS + 1), None);
}

// ============================================================================
// Tests for link loss
// ============================================================================

#[test]
fn test_dropped_link_power_cycles_and_reconnects_after_cooldown() {
    let mut link = LinkManager::new(Some(creds("lab", "password1")));
    let mut radio = FakeLink {
        reachable: true,
        ..FakeLink::default()
    };
    link.maintain(&mut radio, 0);
    link.maintain(&mut radio, 10);

    radio.connected = false;
    assert_eq!(link.maintain(&mut radio, 1_000), Some(LinkEvent::Dropped));
    assert_eq!(radio.power_cycles, 1);
    assert!(!link.is_connected());

    link.maintain(&mut radio, 1_000 + RESET_COOLDOWN_MS - 1);
    assert_eq!(radio.connects.len(), 1);
    link.maintain(&mut radio, 1_000 + RESET_COOLDOWN_MS);
    assert_eq!(radio.connects.len(), 2);
    assert_eq!(
        link.maintain(&mut radio, 1_000 + RESET_COOLDOWN_MS + 10),
        Some(LinkEvent::Connected)
    );
}
