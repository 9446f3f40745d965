//! Authenticated JSON API.
//!
//! Every route checks credentials before it touches anything. State-changing
//! routes only accept POST, which a browser will not send cross-site from a
//! plain link or image. Handlers never block on a lock beyond
//! [`REQUEST_STATE_WAIT_MS`]; a miss becomes 503.

use core::fmt::Write as FmtWrite;

use crate::bus::{device_name, BusGuard, PeripheralBus, SCAN_WAIT_MS};
use crate::error::ApiError;
use crate::flash::FlashGate;
use crate::http::{Body, Method, Request, Response, MAX_BODY};
use crate::json::{Escaped, Object, Value as JsonValue};
use crate::lock::Clock;
use crate::settings::{
    Defaults, MqttSettings, SettingsStore, SlotStorage, Value, DEFAULT_MQTT_CLIENT,
    DEFAULT_MQTT_HOST, DEFAULT_MQTT_PORT, MIN_PASSWORD_LEN,
};
use crate::shared::{StateStore, REQUEST_STATE_WAIT_MS, SERVO_MAX_DEGREES};

/// Static facts about the running image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub version: &'static str,
    pub build: &'static str,
    pub image_size: u32,
    pub free_space: u32,
    pub sdk: &'static str,
    pub cpu_mhz: u32,
}

/// Device metrics the API reports but does not own.
pub trait SystemInfo {
    fn free_heap(&self) -> u32;
    fn uptime_ms(&self) -> u64;
    /// Signal strength in dBm, 0 when not associated.
    fn rssi(&self) -> i8;
    fn ssid(&self) -> &str;
    fn mac(&self) -> [u8; 6];
    fn channel(&self) -> u8;
    fn firmware(&self) -> FirmwareInfo;
}

/// Work that must wait until the response has gone out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferred {
    Restart,
    /// Broker settings changed; drop the session and reconnect.
    ReconnectMqtt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub response: Response,
    pub deferred: Option<Deferred>,
}

impl Reply {
    fn now(response: Response) -> Self {
        Self {
            response,
            deferred: None,
        }
    }

    fn then(response: Response, deferred: Deferred) -> Self {
        Self {
            response,
            deferred: Some(deferred),
        }
    }
}

impl From<ApiError> for Reply {
    fn from(e: ApiError) -> Self {
        Reply::now(e.into())
    }
}

/// Everything a handler may reach.
pub struct ApiContext<'a, C: ?Sized, B, S, I> {
    pub clock: &'a C,
    pub store: &'a StateStore,
    pub bus: &'a BusGuard<B>,
    pub flash: &'a FlashGate,
    pub settings: &'a mut SettingsStore<S>,
    pub defaults: &'a Defaults,
    pub info: &'a I,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Status,
    Relay,
    Pwm,
    Servo,
    Scan,
    Password,
    Mqtt,
    Network,
    Firmware,
    WifiReset,
    Reboot,
}

impl Route {
    fn find(path: &str) -> Option<Self> {
        Some(match path {
            "/api/status" => Route::Status,
            "/api/relay" => Route::Relay,
            "/api/pwm" => Route::Pwm,
            "/api/servo" => Route::Servo,
            "/api/i2c/scan" => Route::Scan,
            "/api/password" => Route::Password,
            "/api/mqtt" => Route::Mqtt,
            "/api/network" => Route::Network,
            "/api/firmware" => Route::Firmware,
            "/api/wifi/reset" => Route::WifiReset,
            "/api/reboot" => Route::Reboot,
            _ => return None,
        })
    }

    fn method(self) -> Method {
        match self {
            Route::Status | Route::Scan | Route::Network | Route::Firmware => Method::Get,
            _ => Method::Post,
        }
    }
}

/// Percent (0..=100) to dimmer level (0..=255), rounded.
pub const fn percent_to_level(percent: u8) -> u8 {
    ((percent as u16 * 255 + 50) / 100) as u8
}

/// Dimmer level to percent, rounded.
pub const fn level_to_percent(level: u8) -> u8 {
    ((level as u16 * 100 + 127) / 255) as u8
}

fn authenticate<S: SlotStorage>(
    req: &Request<'_>,
    settings: &SettingsStore<S>,
    defaults: &Defaults,
) -> Result<(), ApiError> {
    let creds = settings.settings().credentials(defaults);
    match req.basic_auth() {
        Some(auth) if auth.matches(&creds.user, &creds.password) => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

fn body<'r>(req: &Request<'r>) -> Result<Object<'r>, ApiError> {
    if req.content_length().unwrap_or(0) > MAX_BODY {
        return Err(ApiError::PayloadTooLarge);
    }
    Object::parse(req.body_str()?).map_err(|_| ApiError::BadRequest("Invalid JSON"))
}

fn bounded_int(
    obj: &Object<'_>,
    field: &str,
    max: u8,
    missing: &'static str,
    range: &'static str,
) -> Result<u8, ApiError> {
    let n = obj
        .get(field)
        .and_then(JsonValue::as_int)
        .ok_or(ApiError::BadRequest(missing))?;
    u8::try_from(n)
        .ok()
        .filter(|v| *v <= max)
        .ok_or(ApiError::BadRequest(range))
}

fn string_or(obj: &Object<'_>, field: &str, default: &str) -> Result<Value, ApiError> {
    match obj.get(field) {
        None | Some(JsonValue::Null) => {
            let mut v = Value::new();
            v.push_str(default).map_err(|_| ApiError::BadRequest("value too long"))?;
            Ok(v)
        }
        Some(v) => v.to_bounded().ok_or(ApiError::BadRequest("invalid string")),
    }
}

/// Route and answer one fully buffered request.
pub fn handle<C, B, S, I>(req: &Request<'_>, ctx: &mut ApiContext<'_, C, B, S, I>) -> Reply
where
    C: Clock + ?Sized,
    B: PeripheralBus,
    S: SlotStorage,
    I: SystemInfo,
{
    match dispatch(req, ctx) {
        Ok(reply) => reply,
        Err(e) => {
            if e.status() >= 500 {
                log::warn!("http: {} {}", req.path, e);
            } else {
                log::debug!("http: {} {}", req.path, e);
            }
            e.into()
        }
    }
}

fn dispatch<C, B, S, I>(
    req: &Request<'_>,
    ctx: &mut ApiContext<'_, C, B, S, I>,
) -> Result<Reply, ApiError>
where
    C: Clock + ?Sized,
    B: PeripheralBus,
    S: SlotStorage,
    I: SystemInfo,
{
    let route = Route::find(req.path).ok_or(ApiError::NotFound)?;
    authenticate(req, ctx.settings, ctx.defaults)?;
    if req.method != route.method() {
        return Err(ApiError::MethodNotAllowed);
    }

    match route {
        Route::Status => status(ctx).map(Reply::now),
        Route::Relay => {
            let obj = body(req)?;
            let engaged = obj
                .get("state")
                .and_then(JsonValue::as_bool)
                .ok_or(ApiError::BadRequest("state must be a boolean"))?;
            ctx.store.set_actuator(ctx.clock, REQUEST_STATE_WAIT_MS, engaged)?;
            log::info!("http: relay {}", if engaged { "on" } else { "off" });
            Ok(Reply::now(Response::ok("ok")))
        }
        Route::Pwm => {
            let obj = body(req)?;
            let percent = bounded_int(
                &obj,
                "value",
                100,
                "value must be an integer",
                "value out of range",
            )?;
            let level = percent_to_level(percent);
            ctx.store.set_dimmer(ctx.clock, REQUEST_STATE_WAIT_MS, level)?;
            log::info!("http: dimmer {}%", percent);
            Ok(Reply::now(Response::ok("ok")))
        }
        Route::Servo => {
            let obj = body(req)?;
            let angle = bounded_int(
                &obj,
                "angle",
                SERVO_MAX_DEGREES,
                "angle must be an integer",
                "angle out of range",
            )?;
            ctx.store.set_servo(ctx.clock, REQUEST_STATE_WAIT_MS, angle)?;
            log::info!("http: servo {} deg", angle);
            Ok(Reply::now(Response::ok("ok")))
        }
        Route::Scan => {
            let found = ctx.bus.scan(ctx.clock, SCAN_WAIT_MS)?;
            let mut out = Body::new();
            let _ = out.push_str(r#"{"devices":["#);
            for (i, addr) in found.iter().enumerate() {
                let _ = write!(
                    out,
                    r#"{}{{"addr":{},"name":"{}"}}"#,
                    if i > 0 { "," } else { "" },
                    addr,
                    device_name(*addr)
                );
            }
            let _ = out.push_str("]}");
            Ok(Reply::now(Response::json(200, out)))
        }
        Route::Password => change_passwords(req, ctx),
        Route::Mqtt => {
            let obj = body(req)?;
            let port = match obj.get("port") {
                None | Some(JsonValue::Null) => DEFAULT_MQTT_PORT,
                Some(v) => v
                    .as_int()
                    .and_then(|p| u16::try_from(p).ok())
                    .filter(|p| *p != 0)
                    .ok_or(ApiError::BadRequest("port out of range"))?,
            };
            let mqtt = MqttSettings {
                server: string_or(&obj, "server", DEFAULT_MQTT_HOST)?,
                port,
                client: string_or(&obj, "client", DEFAULT_MQTT_CLIENT)?,
                user: string_or(&obj, "user", "")?,
                password: string_or(&obj, "pass", "")?,
            };
            ctx.settings
                .update(ctx.flash, ctx.clock, |s| s.set_mqtt(&mqtt))
                .map_err(|_| ApiError::Internal("failed to save settings"))?;
            log::info!("mqtt: broker set to {}:{}", mqtt.server, mqtt.port);
            Ok(Reply::then(Response::ok("ok"), Deferred::ReconnectMqtt))
        }
        Route::Network => {
            let ip = ctx
                .store
                .view(ctx.clock, REQUEST_STATE_WAIT_MS, |s| s.assigned_address.clone())?;
            let mac = ctx.info.mac();
            let mut out = Body::new();
            let _ = write!(
                out,
                concat!(
                    r#"{{"ssid":"{}","ip":"{}","#,
                    r#""mac":"{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}","#,
                    r#""rssi":{},"channel":{}}}"#,
                ),
                Escaped(ctx.info.ssid()),
                ip,
                mac[0],
                mac[1],
                mac[2],
                mac[3],
                mac[4],
                mac[5],
                ctx.info.rssi(),
                ctx.info.channel()
            );
            Ok(Reply::now(Response::json(200, out)))
        }
        Route::Firmware => {
            let fw = ctx.info.firmware();
            let mut out = Body::new();
            let _ = write!(
                out,
                concat!(
                    r#"{{"version":"{}","buildDate":"{}","sketchSize":{},"freeSpace":{},"#,
                    r#""sdkVersion":"{}","cpuFreq":{}}}"#,
                ),
                Escaped(fw.version),
                Escaped(fw.build),
                fw.image_size,
                fw.free_space,
                Escaped(fw.sdk),
                fw.cpu_mhz
            );
            Ok(Reply::now(Response::json(200, out)))
        }
        Route::WifiReset => {
            ctx.settings
                .update(ctx.flash, ctx.clock, |s| s.reset_wifi())
                .map_err(|_| ApiError::Internal("failed to save settings"))?;
            log::warn!("wifi: credentials cleared, restarting");
            Ok(Reply::then(Response::ok("resetting"), Deferred::Restart))
        }
        Route::Reboot => {
            log::warn!("http: reboot requested");
            Ok(Reply::then(Response::ok("rebooting"), Deferred::Restart))
        }
    }
}

fn status<C, B, S, I>(ctx: &ApiContext<'_, C, B, S, I>) -> Result<Response, ApiError>
where
    C: Clock + ?Sized,
    B: PeripheralBus,
    I: SystemInfo,
{
    let snap = ctx.store.read(ctx.clock, REQUEST_STATE_WAIT_MS)?;
    let mut out = Body::new();
    let _ = write!(
        out,
        concat!(
            r#"{{"relay":{},"sensor":{},"clients":{},"ip":"{}","ready":{},"#,
            r#""heap":{},"uptime":{},"rssi":{},"pwm":{},"servo":"#,
        ),
        snap.actuator_engaged.get(),
        snap.sensor_sample.get(),
        snap.connected_clients,
        snap.assigned_address,
        snap.network_ready,
        ctx.info.free_heap(),
        ctx.info.uptime_ms(),
        ctx.info.rssi(),
        level_to_percent(snap.dimmer_level.get()),
    );
    let _ = match snap.servo_angle.get() {
        Some(angle) => write!(out, "{}}}", angle),
        None => out.push_str("null}").map_err(|_| core::fmt::Error),
    };
    Ok(Response::json(200, out))
}

fn change_passwords<C, B, S, I>(
    req: &Request<'_>,
    ctx: &mut ApiContext<'_, C, B, S, I>,
) -> Result<Reply, ApiError>
where
    C: Clock + ?Sized,
    S: SlotStorage,
{
    let obj = body(req)?;
    let field = |name| {
        obj.get(name)
            .and_then(|v| v.to_bounded::<{ crate::settings::VALUE_LEN }>())
            .ok_or(ApiError::BadRequest("missing field"))
    };
    let current = field("current")?;
    let password = field("newpass")?;
    let ota_password = field("otapass")?;

    let creds = ctx.settings.settings().credentials(ctx.defaults);
    if !crate::http::constant_time_eq(current.as_bytes(), creds.password.as_bytes()) {
        return Ok(Reply::now(Response::text(401, "Current password incorrect")));
    }
    if password.len() < MIN_PASSWORD_LEN || ota_password.len() < MIN_PASSWORD_LEN {
        return Ok(Reply::now(Response::text(400, "Passwords must be at least 8 characters")));
    }

    ctx.settings
        .update(ctx.flash, ctx.clock, |s| s.set_passwords(&password, &ota_password))
        .map_err(|_| ApiError::Internal("failed to save settings"))?;
    log::info!("auth: passwords changed");
    Ok(Reply::now(Response::ok("ok")))
}

/// Gate for `POST /update`: operator credentials, the update password and a
/// declared length that fits `capacity`. Returns the declared length.
pub fn authorize_update<S: SlotStorage>(
    req: &Request<'_>,
    settings: &SettingsStore<S>,
    defaults: &Defaults,
    capacity: usize,
) -> Result<usize, ApiError> {
    if req.path != "/update" {
        return Err(ApiError::NotFound);
    }
    authenticate(req, settings, defaults)?;
    if req.method != Method::Post {
        return Err(ApiError::MethodNotAllowed);
    }
    let creds = settings.settings().credentials(defaults);
    let supplied = req.header("x-ota-password").unwrap_or("");
    if !crate::http::constant_time_eq(supplied.as_bytes(), creds.ota_password.as_bytes()) {
        return Err(ApiError::Unauthorized);
    }
    let declared = req
        .content_length()
        .filter(|n| *n > 0)
        .ok_or(ApiError::BadRequest("Content-Length required"))?;
    if declared > capacity {
        return Err(ApiError::PayloadTooLarge);
    }
    Ok(declared)
}
