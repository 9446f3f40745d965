//! Network Context: everything the network core does besides moving packets.
//!
//! Brings the link up, turns remote commands into state-store writes, keeps
//! `network_ready`, `assigned_address` and `connected_clients` current, and
//! answers API requests. Never touches hardware directly.

use crate::api::{self, ApiContext, Deferred, Reply, SystemInfo};
use crate::bus::{BusGuard, PeripheralBus};
use crate::error::{ApiError, Busy};
use crate::flash::FlashGate;
use crate::http::Request;
use crate::link::{LinkDriver, LinkEvent, LinkManager};
use crate::lock::Clock;
use crate::mqtt::{MqttSession, Transport};
use crate::settings::{Defaults, MqttSettings, SettingsStore, SlotStorage};
use crate::shared::{format_address, Address, SharedState, Stamp, StateStore, STATE_WAIT_MS};

pub const METRICS_INTERVAL_MS: u64 = 5_000;

/// A remote request to change a setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetActuator(bool),
}

impl Command {
    /// Returns false when a later-issued write already landed.
    fn apply(self, s: &mut SharedState, stamp: Stamp) -> bool {
        match self {
            Command::SetActuator(engaged) => s.actuator_engaged.set(engaged, stamp),
        }
    }
}

/// Holds at most one command that met a busy store. A newer command replaces
/// the held one. The held command keeps the stamp it was issued with, so any
/// write issued after it (from the UI or the API) supersedes it.
#[derive(Debug, Default)]
pub struct CommandSlot {
    pending: Option<(Command, Stamp)>,
}

impl CommandSlot {
    pub const fn new() -> Self {
        Self { pending: None }
    }

    pub fn pending(&self) -> Option<Command> {
        self.pending.map(|(cmd, _)| cmd)
    }

    /// Apply now, or hold for [`retry`](Self::retry). Returns true if applied.
    pub fn submit<C: Clock + ?Sized>(
        &mut self,
        cmd: Command,
        store: &StateStore,
        clock: &C,
    ) -> bool {
        let stamp = store.stamp();
        self.apply(cmd, stamp, store, clock)
    }

    /// Re-attempt the held command. A command that was superseded while it
    /// waited is dropped.
    pub fn retry<C: Clock + ?Sized>(&mut self, store: &StateStore, clock: &C) -> bool {
        match self.pending {
            Some((cmd, stamp)) => self.apply(cmd, stamp, store, clock),
            None => false,
        }
    }

    fn apply<C: Clock + ?Sized>(
        &mut self,
        cmd: Command,
        stamp: Stamp,
        store: &StateStore,
        clock: &C,
    ) -> bool {
        match store.write(clock, STATE_WAIT_MS, |s| cmd.apply(s, stamp)) {
            Ok(applied) => {
                self.pending = None;
                if applied {
                    log::info!("command: {:?}", cmd);
                } else {
                    log::debug!("command: {:?} dropped, a later write landed first", cmd);
                }
                applied
            }
            Err(Busy) => {
                if let Some((old, _)) = self.pending.replace((cmd, stamp)) {
                    if old != cmd {
                        log::debug!("command: {:?} superseded by {:?}", old, cmd);
                    }
                } else {
                    log::debug!("command: store busy, holding {:?}", cmd);
                }
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LinkStatus {
    ready: bool,
    address: Address,
}

pub struct NetworkService<'a, C: ?Sized, B, S> {
    clock: &'a C,
    store: &'a StateStore,
    bus: &'a BusGuard<B>,
    flash: &'a FlashGate,
    settings: SettingsStore<S>,
    defaults: Defaults,
    link: LinkManager,
    mqtt: MqttSession,
    mqtt_config: MqttSettings,
    commands: CommandSlot,
    status: Option<LinkStatus>,
    addressed: bool,
    last_metrics_ms: Option<u64>,
}

impl<'a, C, B, S> NetworkService<'a, C, B, S>
where
    C: Clock + ?Sized,
    B: PeripheralBus,
    S: SlotStorage,
{
    pub fn new(
        clock: &'a C,
        store: &'a StateStore,
        bus: &'a BusGuard<B>,
        flash: &'a FlashGate,
        settings: SettingsStore<S>,
        defaults: Defaults,
    ) -> Self {
        let link = LinkManager::new(settings.settings().wifi(&defaults));
        let mqtt_config = settings.settings().mqtt(&defaults);
        Self {
            clock,
            store,
            bus,
            flash,
            settings,
            defaults,
            link,
            mqtt: MqttSession::new(),
            mqtt_config,
            commands: CommandSlot::new(),
            status: None,
            addressed: false,
            last_metrics_ms: None,
        }
    }

    pub fn settings(&self) -> &SettingsStore<S> {
        &self.settings
    }

    pub fn defaults(&self) -> &Defaults {
        &self.defaults
    }

    pub fn link(&self) -> &LinkManager {
        &self.link
    }

    pub fn mqtt(&self) -> &MqttSession {
        &self.mqtt
    }

    pub fn flash(&self) -> &'a FlashGate {
        self.flash
    }

    pub fn clock(&self) -> &'a C {
        self.clock
    }

    pub fn commands(&self) -> &CommandSlot {
        &self.commands
    }

    /// True once the link is up and DHCP has handed out an address.
    pub fn is_online(&self) -> bool {
        self.link.is_connected() && self.addressed
    }

    /// Drive link bring-up. Returns `Some(Restart)` once the provisioning
    /// window has expired.
    pub fn poll_link<D: LinkDriver>(&mut self, driver: &mut D) -> Option<Deferred> {
        let now = self.clock.now_ms();
        match self.link.maintain(driver, now)? {
            LinkEvent::Connected => None,
            LinkEvent::Dropped => {
                self.set_address(None);
                None
            }
            LinkEvent::Provisioned(creds) => {
                let saved = self
                    .settings
                    .update(self.flash, self.clock, |s| s.set_wifi(&creds));
                if let Err(e) = saved {
                    log::error!("storage: credentials not saved: {}", e);
                }
                None
            }
            LinkEvent::RestartRequired => Some(Deferred::Restart),
        }
    }

    /// Record a DHCP result; `None` when the lease is lost.
    pub fn set_address(&mut self, octets: Option<[u8; 4]>) {
        self.addressed = octets.is_some();
        let status = match octets {
            Some(octets) => LinkStatus {
                ready: true,
                address: format_address(octets),
            },
            None => LinkStatus {
                ready: false,
                address: Address::new(),
            },
        };
        if status.ready {
            log::info!("dhcp: IP={}", status.address);
        } else {
            log::warn!("dhcp: deconfigured");
        }
        self.status = Some(status);
        self.flush_status();
    }

    fn flush_status(&mut self) {
        let Some(status) = self.status.clone() else {
            return;
        };
        let written = self.store.write(self.clock, STATE_WAIT_MS, |s| {
            s.network_ready = status.ready;
            s.assigned_address = status.address;
            if !status.ready {
                s.connected_clients = 0;
            }
        });
        match written {
            Ok(()) => self.status = None,
            Err(Busy) => log::debug!("network: store busy, status write deferred"),
        }
    }

    /// Retry writes that met a busy store earlier. Call once per pass.
    pub fn retry_pending(&mut self) {
        self.flush_status();
        self.commands.retry(self.store, self.clock);
    }

    /// Every [`METRICS_INTERVAL_MS`], store the current client count. A busy
    /// store waits for the next period.
    pub fn poll_metrics(&mut self, clients: impl FnOnce() -> u16) {
        let now = self.clock.now_ms();
        let due = self
            .last_metrics_ms
            .map_or(true, |last| now.saturating_sub(last) >= METRICS_INTERVAL_MS);
        if !due {
            return;
        }
        self.last_metrics_ms = Some(now);
        let count = clients();
        if self
            .store
            .write(self.clock, STATE_WAIT_MS, |s| s.connected_clients = count)
            .is_err()
        {
            log::debug!("network: store busy, metrics skipped");
        }
    }

    /// Service the broker session. Inbound commands become store writes.
    pub fn service_mqtt<T: Transport>(&mut self, transport: &mut T) {
        if !self.is_online() {
            return;
        }
        let now = self.clock.now_ms();
        let store = self.store;
        let clock = self.clock;
        let commands = &mut self.commands;
        self.mqtt.service(
            transport,
            &self.mqtt_config,
            now,
            || store.view(clock, STATE_WAIT_MS, |s| s.sensor_sample.get()).ok(),
            |engage| {
                commands.submit(Command::SetActuator(engage), store, clock);
            },
        );
    }

    /// Answer one buffered API request.
    pub fn handle_http<I: SystemInfo>(&mut self, req: &Request<'_>, info: &I) -> Reply {
        let mut ctx = ApiContext {
            clock: self.clock,
            store: self.store,
            bus: self.bus,
            flash: self.flash,
            settings: &mut self.settings,
            defaults: &self.defaults,
            info,
        };
        api::handle(req, &mut ctx)
    }

    /// Check a `POST /update` head. Returns the declared image length.
    pub fn authorize_update(&self, req: &Request<'_>, capacity: usize) -> Result<usize, ApiError> {
        api::authorize_update(req, &self.settings, &self.defaults, capacity)
    }

    /// Run deferred work after its response was sent. Returns true when the
    /// caller must restart the device.
    pub fn after_response<T: Transport>(&mut self, deferred: Deferred, transport: &mut T) -> bool {
        match deferred {
            Deferred::Restart => true,
            Deferred::ReconnectMqtt => {
                self.mqtt_config = self.settings.settings().mqtt(&self.defaults);
                self.mqtt.restart(transport);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct Tick(Cell<u64>);

    impl Clock for Tick {
        fn now_ms(&self) -> u64 {
            self.0.get()
        }
        fn relax(&self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn newest_held_command_wins() {
        let clock = Tick(Cell::new(0));
        let store = StateStore::new();
        let mut slot = CommandSlot::new();
        slot.pending = Some((Command::SetActuator(true), store.stamp()));
        slot.pending.replace((Command::SetActuator(false), store.stamp()));
        assert!(slot.retry(&store, &clock));
        assert_eq!(slot.pending(), None);
        assert!(!store.read(&clock, 0).unwrap().actuator_engaged.get());
    }

    #[test]
    fn held_command_yields_to_a_later_write() {
        let clock = Tick(Cell::new(0));
        let store = StateStore::new();
        let mut slot = CommandSlot::new();
        slot.pending = Some((Command::SetActuator(true), store.stamp()));
        store.set_actuator(&clock, 0, false).unwrap();

        assert!(!slot.retry(&store, &clock));
        assert_eq!(slot.pending(), None);
        assert!(!store.read(&clock, 0).unwrap().actuator_engaged.get());
    }
}
