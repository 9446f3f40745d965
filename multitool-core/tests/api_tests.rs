//! Integration tests for the authenticated HTTP API
//!
//! Requests are fed as raw bytes through the parser and router, the same way
//! the network core hands them over after buffering a socket.

mod common;

use std::sync::Barrier;
use std::thread;

use common::{request, with_parker, FakeBus, FakeInfo, MemorySlots, WallClock};
use multitool_core::api::{authorize_update, handle, ApiContext, Deferred, Reply};
use multitool_core::error::ApiError;
use multitool_core::flash::FlashGate;
use multitool_core::http::Request;
use multitool_core::settings::{Defaults, SettingsStore, DEFAULT_MQTT_CLIENT};
use multitool_core::shared::{format_address, STATE_WAIT_MS};
use multitool_core::{BusGuard, StateStore};

const ADMIN: (&str, &str) = ("admin", "multitool");

#[derive(Clone, Copy)]
enum Held {
    Store,
    Bus,
}

struct Device {
    clock: WallClock,
    store: StateStore,
    bus: BusGuard<FakeBus>,
    flash: FlashGate,
    settings: SettingsStore<MemorySlots>,
    defaults: Defaults,
}

impl Device {
    fn new() -> Self {
        Self {
            clock: WallClock::new(),
            store: StateStore::new(),
            bus: BusGuard::new(FakeBus::with_display()),
            flash: FlashGate::new(),
            settings: SettingsStore::load(MemorySlots::default()),
            defaults: Defaults::default(),
        }
    }

    fn send(&mut self, raw: &[u8]) -> Reply {
        let req = Request::parse(raw).unwrap();
        let mut ctx = ApiContext {
            clock: &self.clock,
            store: &self.store,
            bus: &self.bus,
            flash: &self.flash,
            settings: &mut self.settings,
            defaults: &self.defaults,
            info: &FakeInfo,
        };
        with_parker(&self.flash, || handle(&req, &mut ctx))
    }

    fn get(&mut self, path: &str) -> Reply {
        self.send(&request("GET", path, Some(ADMIN), &[], ""))
    }

    fn post(&mut self, path: &str, body: &str) -> Reply {
        self.send(&request("POST", path, Some(ADMIN), &[], body))
    }

    fn actuator(&self) -> bool {
        self.store
            .view(&self.clock, STATE_WAIT_MS, |s| s.actuator_engaged.get())
            .unwrap()
    }

    /// Send `raw` while another thread sits inside the `held` lock.
    fn send_while_held(&mut self, held: Held, raw: &[u8]) -> Reply {
        let Device {
            clock,
            store,
            bus,
            flash,
            settings,
            defaults,
        } = self;
        let (store, bus): (&StateStore, &BusGuard<FakeBus>) = (store, bus);
        let inside = Barrier::new(2);
        let release = Barrier::new(2);
        thread::scope(|s| {
            s.spawn(|| {
                let wall = WallClock::new();
                let sit = || {
                    inside.wait();
                    release.wait();
                };
                match held {
                    Held::Store => store.write(&wall, STATE_WAIT_MS, |_| sit()).unwrap(),
                    Held::Bus => bus.with_bus(&wall, STATE_WAIT_MS, |_| sit()).unwrap(),
                }
            });
            inside.wait();
            let req = Request::parse(raw).unwrap();
            let mut ctx = ApiContext {
                clock: &*clock,
                store,
                bus,
                flash: &*flash,
                settings,
                defaults: &*defaults,
                info: &FakeInfo,
            };
            let reply = handle(&req, &mut ctx);
            release.wait();
            reply
        })
    }

    fn authorize(&self, raw: &[u8], capacity: usize) -> Result<usize, ApiError> {
        let req = Request::parse(raw).unwrap();
        authorize_update(&req, &self.settings, &self.defaults, capacity)
    }
}

// ============================================================================
// Tests for authentication and routing
// ============================================================================

#[test]
fn test_unauthenticated_relay_post_is_rejected_without_side_effects() {
    let mut dev = Device::new();
    let reply = dev.send(&request("POST", "/api/relay", None, &[], r#"{"state":true}"#));

    assert_eq!(reply.response.status(), 401);
    assert!(reply
        .response
        .serialize()
        .contains("WWW-Authenticate: Basic realm=\"multitool\""));
    assert!(!dev.actuator());
}

#[test]
fn test_wrong_password_is_rejected() {
    let mut dev = Device::new();
    let reply = dev.send(&request("GET", "/api/status", Some(("admin", "guess")), &[], ""));
    assert_eq!(reply.response.status(), 401);
}

#[test]
fn test_state_change_over_get_is_not_allowed() {
    let mut dev = Device::new();
    let reply = dev.get("/api/relay");
    assert_eq!(reply.response.status(), 405);
    assert!(!dev.actuator());
}

#[test]
fn test_unknown_path_is_not_found() {
    let mut dev = Device::new();
    assert_eq!(dev.get("/api/nope").response.status(), 404);
}

// ============================================================================
// Tests for setpoint routes
// ============================================================================

#[test]
fn test_relay_post_sets_store() {
    let mut dev = Device::new();
    let reply = dev.post("/api/relay", r#"{"state":true}"#);

    assert_eq!(reply.response.status(), 200);
    assert_eq!(reply.response.body(), r#"{"status":"ok"}"#);
    assert_eq!(reply.deferred, None);
    assert!(dev.actuator());
}

#[test]
fn test_relay_post_requires_boolean_state() {
    let mut dev = Device::new();
    assert_eq!(dev.post("/api/relay", r#"{"state":"yes"}"#).response.status(), 400);
    assert_eq!(dev.post("/api/relay", "not json").response.status(), 400);
    assert!(!dev.actuator());
}

#[test]
fn test_out_of_range_pwm_is_rejected_and_store_unchanged() {
    let mut dev = Device::new();
    assert_eq!(dev.post("/api/pwm", r#"{"value":50}"#).response.status(), 200);
    assert_eq!(dev.post("/api/pwm", r#"{"value":101}"#).response.status(), 400);
    assert_eq!(dev.post("/api/pwm", r#"{"value":-1}"#).response.status(), 400);

    let level = dev.store.view(&dev.clock, STATE_WAIT_MS, |s| s.dimmer_level.get()).unwrap();
    assert_eq!(level, multitool_core::api::percent_to_level(50));
}

#[test]
fn test_servo_angle_is_bounded() {
    let mut dev = Device::new();
    assert_eq!(dev.post("/api/servo", r#"{"angle":180}"#).response.status(), 200);
    assert_eq!(dev.post("/api/servo", r#"{"angle":181}"#).response.status(), 400);
    let angle = dev.store.view(&dev.clock, STATE_WAIT_MS, |s| s.servo_angle.get()).unwrap();
    assert_eq!(angle, Some(180));
}

// ============================================================================
// Tests for read-only routes
// ============================================================================

#[test]
fn test_status_reports_one_snapshot() {
    let mut dev = Device::new();
    dev.store.set_actuator(&dev.clock, STATE_WAIT_MS, true).unwrap();
    dev.store.set_dimmer(&dev.clock, STATE_WAIT_MS, 255).unwrap();
    dev.store
        .write(&dev.clock, STATE_WAIT_MS, |s| {
            s.connected_clients = 3;
            s.network_ready = true;
            s.assigned_address = format_address([192, 168, 4, 20]);
        })
        .unwrap();

    let reply = dev.get("/api/status");
    assert_eq!(reply.response.status(), 200);
    assert_eq!(reply.response.content_type(), "application/json");
    let body = reply.response.body();
    for field in [
        r#""relay":true"#,
        r#""clients":3"#,
        r#""ip":"192.168.4.20""#,
        r#""ready":true"#,
        r#""heap":123456"#,
        r#""pwm":100"#,
        r#""servo":null"#,
    ] {
        assert!(body.contains(field), "{} missing from {}", field, body);
    }
}

#[test]
fn test_status_reports_busy_store_as_unavailable() {
    let mut dev = Device::new();
    let raw = request("GET", "/api/status", Some(ADMIN), &[], "");
    let reply = dev.send_while_held(Held::Store, &raw);
    assert_eq!(reply.response.status(), 503);
}

#[test]
fn test_scan_lists_devices_with_names() {
    let mut dev = Device::new();
    dev.bus
        .with_bus(&dev.clock, 0, |bus| bus.present = vec![0x3C, 0x76])
        .unwrap();

    let reply = dev.get("/api/i2c/scan");
    assert_eq!(reply.response.status(), 200);
    let body = reply.response.body();
    assert!(body.starts_with(r#"{"devices":[{"addr":60,"#), "{}", body);
    assert!(body.contains(r#""addr":118"#));
}

#[test]
fn test_scan_reports_busy_bus_as_unavailable() {
    let mut dev = Device::new();
    let raw = request("GET", "/api/i2c/scan", Some(ADMIN), &[], "");
    let reply = dev.send_while_held(Held::Bus, &raw);
    assert_eq!(reply.response.status(), 503);

    // The bus is free again afterwards.
    assert_eq!(dev.get("/api/i2c/scan").response.status(), 200);
}

#[test]
fn test_network_info_escapes_ssid() {
    let mut dev = Device::new();
    let body = dev.get("/api/network").response.body().to_string();
    assert!(body.contains(r#""ssid":"bench\"lab""#), "{}", body);
    assert!(body.contains(r#""mac":"24:0A:C4:00:12:AB""#));
    assert!(body.contains(r#""channel":6"#));
}

#[test]
fn test_firmware_info_fields() {
    let mut dev = Device::new();
    let body = dev.get("/api/firmware").response.body().to_string();
    assert!(body.contains(r#""version":"0.1.0""#));
    assert!(body.contains(r#""cpuFreq":240"#));
}

// ============================================================================
// Tests for settings routes
// ============================================================================

#[test]
fn test_password_change_rules() {
    let mut dev = Device::new();

    let wrong = dev.post(
        "/api/password",
        r#"{"current":"nope","newpass":"longenough1","otapass":"longenough2"}"#,
    );
    assert_eq!(wrong.response.status(), 401);
    assert_eq!(wrong.response.body(), "Current password incorrect");

    let short = dev.post(
        "/api/password",
        r#"{"current":"multitool","newpass":"short","otapass":"longenough2"}"#,
    );
    assert_eq!(short.response.status(), 400);

    let ok = dev.post(
        "/api/password",
        r#"{"current":"multitool","newpass":"longenough1","otapass":"longenough2"}"#,
    );
    assert_eq!(ok.response.status(), 200);

    // Old password no longer works, the new one does.
    assert_eq!(dev.get("/api/status").response.status(), 401);
    let reply = dev.send(&request("GET", "/api/status", Some(("admin", "longenough1")), &[], ""));
    assert_eq!(reply.response.status(), 200);

    // And the change survives a reload.
    let fresh = SettingsStore::load(MemorySlots::default());
    let storage = std::mem::replace(&mut dev.settings, fresh).into_storage();
    let reloaded = SettingsStore::load(storage);
    let creds = reloaded.settings().credentials(&dev.defaults);
    assert_eq!(creds.password.as_str(), "longenough1");
    assert_eq!(creds.ota_password.as_str(), "longenough2");
}

#[test]
fn test_mqtt_settings_persist_and_request_reconnect() {
    let mut dev = Device::new();
    let body = r#"{"server":"10.0.0.5","port":8883,"user":"tool","pass":"pw"}"#;
    let reply = dev.post("/api/mqtt", body);

    assert_eq!(reply.response.status(), 200);
    assert_eq!(reply.deferred, Some(Deferred::ReconnectMqtt));
    let mqtt = dev.settings.settings().mqtt(&dev.defaults);
    assert_eq!(mqtt.server.as_str(), "10.0.0.5");
    assert_eq!(mqtt.port, 8883);
    assert_eq!(mqtt.client.as_str(), DEFAULT_MQTT_CLIENT);
    assert_eq!(mqtt.user.as_str(), "tool");
}

#[test]
fn test_mqtt_port_zero_is_rejected() {
    let mut dev = Device::new();
    assert_eq!(dev.post("/api/mqtt", r#"{"port":0}"#).response.status(), 400);
    assert_eq!(dev.settings.sequence(), 0);
}

#[test]
fn test_wifi_reset_clears_credentials_then_restarts() {
    let mut dev = Device::new();
    dev.defaults.ssid = "lab";
    assert!(dev.settings.settings().wifi(&dev.defaults).is_some());

    let reply = dev.post("/api/wifi/reset", "");

    assert_eq!(reply.response.status(), 200);
    assert_eq!(reply.deferred, Some(Deferred::Restart));
    assert_eq!(dev.settings.settings().wifi(&dev.defaults), None);
}

#[test]
fn test_reboot_is_deferred_until_after_reply() {
    let mut dev = Device::new();
    let reply = dev.post("/api/reboot", "");
    assert_eq!(reply.response.status(), 200);
    assert_eq!(reply.deferred, Some(Deferred::Restart));
}

// ============================================================================
// Tests for update authorization
// ============================================================================

#[test]
fn test_update_requires_ota_password_and_length() {
    let dev = Device::new();
    let ota = "X-OTA-Password: multitool-ota";

    let no_ota = request("POST", "/update", Some(ADMIN), &["Content-Length: 4096"], "");
    assert_eq!(dev.authorize(&no_ota, 8192), Err(ApiError::Unauthorized));

    let no_length = request("POST", "/update", Some(ADMIN), &[ota], "");
    assert!(matches!(dev.authorize(&no_length, 8192), Err(ApiError::BadRequest(_))));

    let too_big = request("POST", "/update", Some(ADMIN), &[ota, "Content-Length: 9000"], "");
    assert_eq!(dev.authorize(&too_big, 8192), Err(ApiError::PayloadTooLarge));

    let ok = request("POST", "/update", Some(ADMIN), &[ota, "Content-Length: 4096"], "");
    assert_eq!(dev.authorize(&ok, 8192), Ok(4096));
}

#[test]
fn test_update_checks_operator_login_first() {
    let dev = Device::new();
    let headers = ["X-OTA-Password: multitool-ota", "Content-Length: 16"];
    let raw = request("POST", "/update", None, &headers, "");
    assert_eq!(dev.authorize(&raw, 8192), Err(ApiError::Unauthorized));

    let get = request("GET", "/update", Some(ADMIN), &[], "");
    assert_eq!(dev.authorize(&get, 8192), Err(ApiError::MethodNotAllowed));
}
