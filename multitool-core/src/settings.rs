//! Namespaced key-value settings with A/B flash persistence.
//!
//! The whole table is serialized as one record and written to one of two flash
//! slots. A power loss during a write never corrupts data: the other slot still
//! holds the previous valid record.
//!
//! Record layout (little endian):
//!   [4 bytes: magic] [4 bytes: sequence] [4 bytes: CRC32] [4 bytes: payload_len]
//!   [payload_len bytes: entries]
//!
//! Each entry is `[ns_len][ns][key_len][key][value_len][value]` with one-byte
//! lengths. The CRC covers `payload_len` and the payload.
//!
//! On write: use the slot holding the lower sequence number.
//! On read: use the slot with the higher sequence number that has a valid CRC.

use heapless::{String as HString, Vec};

use crate::crc::crc32;
use crate::error::SettingsError;
use crate::flash::FlashGate;
use crate::lock::Clock;

const RECORD_MAGIC: u32 = 0x4D54_4B56; // "MTKV"
const HEADER_LEN: usize = 16;

pub const KEY_LEN: usize = 16;
pub const VALUE_LEN: usize = 64;
pub const MAX_ENTRIES: usize = 16;

/// Largest possible encoded record.
pub const RECORD_CAPACITY: usize = HEADER_LEN + MAX_ENTRIES * (3 + KEY_LEN * 2 + VALUE_LEN);

pub const MIN_PASSWORD_LEN: usize = 8;

pub type Key = HString<KEY_LEN>;
pub type Value = HString<VALUE_LEN>;

/// Copy `s` into a bounded string.
pub fn bounded<const N: usize>(s: &str) -> Result<HString<N>, SettingsError> {
    let mut out = HString::new();
    out.push_str(s).map_err(|_| SettingsError::TooLong)?;
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    namespace: Key,
    key: Key,
    value: Value,
}

/// In-memory settings table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    entries: Vec<Entry, MAX_ENTRIES>,
}

impl Settings {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.namespace == namespace && e.key == key)
            .map(|e| e.value.as_str())
    }

    pub fn get_or<'a>(&'a self, namespace: &str, key: &str, default: &'a str) -> &'a str {
        self.get(namespace, key).unwrap_or(default)
    }

    pub fn set(&mut self, namespace: &str, key: &str, value: &str) -> Result<(), SettingsError> {
        let value = bounded(value)?;
        if let Some(e) = self
            .entries
            .iter_mut()
            .find(|e| e.namespace == namespace && e.key == key)
        {
            e.value = value;
            return Ok(());
        }
        let entry = Entry {
            namespace: bounded(namespace)?,
            key: bounded(key)?,
            value,
        };
        self.entries.push(entry).map_err(|_| SettingsError::Full)
    }

    /// Remove every key in `namespace`.
    pub fn clear(&mut self, namespace: &str) {
        self.entries.retain(|e| e.namespace != namespace);
    }

    /// Serialize into `out` as a complete slot record.
    pub fn encode(&self, sequence: u32, out: &mut [u8]) -> Result<usize, SettingsError> {
        let mut pos = HEADER_LEN;
        for e in &self.entries {
            for field in [e.namespace.as_bytes(), e.key.as_bytes(), e.value.as_bytes()] {
                let end = pos + 1 + field.len();
                if end > out.len() {
                    return Err(SettingsError::Full);
                }
                out[pos] = field.len() as u8;
                out[pos + 1..end].copy_from_slice(field);
                pos = end;
            }
        }
        if out.len() < HEADER_LEN {
            return Err(SettingsError::Full);
        }
        let payload_len = (pos - HEADER_LEN) as u32;
        out[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&sequence.to_le_bytes());
        out[12..16].copy_from_slice(&payload_len.to_le_bytes());
        let crc = crc32(&out[12..pos]);
        out[8..12].copy_from_slice(&crc.to_le_bytes());
        Ok(pos)
    }

    /// Parse a slot record. Returns the record's sequence number and table.
    pub fn decode(buf: &[u8]) -> Result<(u32, Self), SettingsError> {
        let sequence = record_sequence(buf).ok_or(SettingsError::Corrupt)?;
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let stored_crc = word(8);
        let payload_len = word(12) as usize;
        let end = HEADER_LEN
            .checked_add(payload_len)
            .filter(|&end| end <= buf.len())
            .ok_or(SettingsError::Corrupt)?;
        if crc32(&buf[12..end]) != stored_crc {
            return Err(SettingsError::Corrupt);
        }

        let mut settings = Settings::new();
        let mut pos = HEADER_LEN;
        while pos < end {
            let mut fields: [&str; 3] = [""; 3];
            for field in fields.iter_mut() {
                let len = *buf.get(pos).ok_or(SettingsError::Corrupt)? as usize;
                let bytes = buf.get(pos + 1..pos + 1 + len).ok_or(SettingsError::Corrupt)?;
                *field = core::str::from_utf8(bytes).map_err(|_| SettingsError::Corrupt)?;
                pos += 1 + len;
            }
            if pos > end {
                return Err(SettingsError::Corrupt);
            }
            settings.set(fields[0], fields[1], fields[2])?;
        }
        Ok((sequence, settings))
    }

    pub fn wifi(&self, defaults: &Defaults) -> Option<WifiCredentials> {
        let ssid = self.get_or("wifi", "ssid", defaults.ssid);
        if ssid.is_empty() {
            return None;
        }
        Some(WifiCredentials {
            ssid: bounded(ssid).ok()?,
            password: bounded(self.get_or("wifi", "pass", defaults.password)).ok()?,
        })
    }

    pub fn set_wifi(&mut self, creds: &WifiCredentials) -> Result<(), SettingsError> {
        self.set("wifi", "ssid", &creds.ssid)?;
        self.set("wifi", "pass", &creds.password)
    }

    /// Forget stored network credentials. An empty ssid also masks the
    /// compile-time default so the next boot provisions.
    pub fn reset_wifi(&mut self) -> Result<(), SettingsError> {
        self.clear("wifi");
        self.set("wifi", "ssid", "")
    }

    pub fn credentials(&self, defaults: &Defaults) -> Credentials {
        // Values in the table are already bounded, defaults are truncated.
        Credentials {
            user: truncated(self.get_or("auth", "user", defaults.admin_user)),
            password: truncated(self.get_or("auth", "pass", defaults.admin_password)),
            ota_password: truncated(self.get_or("auth", "otapass", defaults.ota_password)),
        }
    }

    pub fn set_passwords(
        &mut self,
        password: &str,
        ota_password: &str,
    ) -> Result<(), SettingsError> {
        self.set("auth", "pass", password)?;
        self.set("auth", "otapass", ota_password)
    }

    pub fn mqtt(&self, defaults: &Defaults) -> MqttSettings {
        let port = self
            .get("mqtt", "port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.mqtt_port);
        MqttSettings {
            server: truncated(self.get_or("mqtt", "server", defaults.mqtt_host)),
            port,
            client: truncated(self.get_or("mqtt", "client", DEFAULT_MQTT_CLIENT)),
            user: truncated(self.get_or("mqtt", "user", "")),
            password: truncated(self.get_or("mqtt", "pass", "")),
        }
    }

    pub fn set_mqtt(&mut self, mqtt: &MqttSettings) -> Result<(), SettingsError> {
        let mut port: HString<5> = HString::new();
        let _ = core::fmt::write(&mut port, format_args!("{}", mqtt.port));
        self.set("mqtt", "server", &mqtt.server)?;
        self.set("mqtt", "port", &port)?;
        self.set("mqtt", "client", &mqtt.client)?;
        self.set("mqtt", "user", &mqtt.user)?;
        self.set("mqtt", "pass", &mqtt.password)
    }
}

fn truncated(s: &str) -> Value {
    let mut out = Value::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Sequence number of a record, if the header looks like one of ours.
pub fn record_sequence(buf: &[u8]) -> Option<u32> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != RECORD_MAGIC {
        return None;
    }
    Some(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]))
}

pub const DEFAULT_MQTT_HOST: &str = "broker.hivemq.com";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTT_CLIENT: &str = "ESP32_Multitool";

/// Build-time fallbacks for anything not in the table.
#[derive(Debug, Clone, Copy)]
pub struct Defaults {
    pub ssid: &'static str,
    pub password: &'static str,
    pub admin_user: &'static str,
    pub admin_password: &'static str,
    pub ota_password: &'static str,
    pub mqtt_host: &'static str,
    pub mqtt_port: u16,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            ssid: "",
            password: "",
            admin_user: "admin",
            admin_password: "multitool",
            ota_password: "multitool-ota",
            mqtt_host: DEFAULT_MQTT_HOST,
            mqtt_port: DEFAULT_MQTT_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: Value,
    pub password: Value,
}

/// Operator login plus the separate firmware-update password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: Value,
    pub password: Value,
    pub ota_password: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub server: Value,
    pub port: u16,
    pub client: Value,
    pub user: Value,
    pub password: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

/// Slot to load from, given each slot's valid sequence number.
pub fn newest(a: Option<u32>, b: Option<u32>) -> Option<Slot> {
    match (a, b) {
        (Some(a), Some(b)) if b > a => Some(Slot::B),
        (Some(_), _) => Some(Slot::A),
        (None, Some(_)) => Some(Slot::B),
        (None, None) => None,
    }
}

/// Slot to overwrite: the older one, or an invalid one.
pub fn oldest(a: Option<u32>, b: Option<u32>) -> Slot {
    match (a, b) {
        (Some(a), Some(b)) if b < a => Slot::B,
        (Some(_), Some(_)) => Slot::A,
        (None, _) => Slot::A,
        (Some(_), None) => Slot::B,
    }
}

/// Raw access to the two flash slots.
pub trait SlotStorage {
    fn read_slot(&mut self, slot: Slot, buf: &mut [u8]) -> Result<(), SettingsError>;
    fn write_slot(&mut self, slot: Slot, record: &[u8]) -> Result<(), SettingsError>;
}

/// Settings table plus its flash backing.
pub struct SettingsStore<S> {
    storage: S,
    settings: Settings,
    sequence: u32,
    slots: [Option<u32>; 2],
}

impl<S: SlotStorage> SettingsStore<S> {
    /// Load the newest valid record, or start empty.
    pub fn load(mut storage: S) -> Self {
        let mut buf = [0u8; RECORD_CAPACITY];
        let mut valid: [Option<(u32, Settings)>; 2] = [None, None];
        for (i, slot) in [Slot::A, Slot::B].into_iter().enumerate() {
            if storage.read_slot(slot, &mut buf).is_err() {
                log::warn!("storage: slot {:?} unreadable", slot);
                continue;
            }
            match Settings::decode(&buf) {
                Ok(record) => valid[i] = Some(record),
                Err(_) if record_sequence(&buf).is_some() => {
                    log::warn!("storage: slot {:?} CRC mismatch", slot)
                }
                Err(_) => {}
            }
        }

        let slots = [valid[0].as_ref().map(|r| r.0), valid[1].as_ref().map(|r| r.0)];
        let (sequence, settings) = match newest(slots[0], slots[1]) {
            Some(slot) => {
                let [a, b] = valid;
                let chosen = if slot == Slot::A { a } else { b };
                let (sequence, settings) = chosen.unwrap_or_default();
                log::info!(
                    "storage: using slot {:?} (seq={}, {} keys)",
                    slot,
                    sequence,
                    settings.len()
                );
                (sequence, settings)
            }
            None => {
                log::info!("storage: no valid settings in flash");
                (0, Settings::new())
            }
        };

        Self {
            storage,
            settings,
            sequence,
            slots,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Apply `edit` and persist the result. The in-memory table only changes
    /// if the flash write succeeds.
    pub fn update<C: Clock + ?Sized>(
        &mut self,
        gate: &FlashGate,
        clock: &C,
        edit: impl FnOnce(&mut Settings) -> Result<(), SettingsError>,
    ) -> Result<(), SettingsError> {
        let mut next = self.settings.clone();
        edit(&mut next)?;

        let sequence = self.sequence.wrapping_add(1);
        let mut buf = [0u8; RECORD_CAPACITY];
        let len = next.encode(sequence, &mut buf)?;
        let target = oldest(self.slots[0], self.slots[1]);

        let written = gate
            .with_parked(clock, || self.storage.write_slot(target, &buf[..len]))
            .ok_or(SettingsError::Handshake)?;
        if let Err(e) = written {
            log::error!("storage: write to slot {:?} failed: {}", target, e);
            return Err(e);
        }

        self.slots[target as usize] = Some(sequence);
        self.sequence = sequence;
        self.settings = next;
        log::info!(
            "storage: saved {} keys to slot {:?} (seq={})",
            self.settings.len(),
            target,
            sequence
        );
        Ok(())
    }

    pub fn into_storage(self) -> S {
        self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_choice_prefers_newest_for_reads_and_oldest_for_writes() {
        assert_eq!(newest(Some(3), Some(4)), Some(Slot::B));
        assert_eq!(newest(Some(4), Some(3)), Some(Slot::A));
        assert_eq!(newest(None, Some(1)), Some(Slot::B));
        assert_eq!(newest(None, None), None);

        assert_eq!(oldest(Some(3), Some(4)), Slot::A);
        assert_eq!(oldest(Some(4), Some(3)), Slot::B);
        assert_eq!(oldest(Some(4), None), Slot::B);
        assert_eq!(oldest(None, None), Slot::A);
    }

    #[test]
    fn flipped_payload_byte_is_rejected() {
        let mut s = Settings::new();
        s.set("wifi", "ssid", "lab").unwrap();
        let mut buf = [0u8; RECORD_CAPACITY];
        let len = s.encode(7, &mut buf).unwrap();
        buf[len - 1] ^= 0x01;
        assert_eq!(Settings::decode(&buf[..len]), Err(SettingsError::Corrupt));
    }

    #[test]
    fn over_long_values_are_refused() {
        let mut s = Settings::new();
        let long = [b'x'; VALUE_LEN + 1];
        let long = core::str::from_utf8(&long).unwrap();
        assert_eq!(s.set("auth", "pass", long), Err(SettingsError::TooLong));
        assert!(s.is_empty());
    }

    #[test]
    fn reset_wifi_masks_the_build_default() {
        let defaults = Defaults {
            ssid: "factory",
            ..Defaults::default()
        };
        let mut s = Settings::new();
        assert_eq!(s.wifi(&defaults).unwrap().ssid.as_str(), "factory");
        s.reset_wifi().unwrap();
        assert_eq!(s.wifi(&defaults), None);
    }
}
