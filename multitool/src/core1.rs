//! Core 1: WiFi, DHCP, the HTTP API, MQTT and firmware updates.
//!
//! This core handles network operations:
//! - WiFi connection management with retries, radio power-cycling and the
//!   setup access point when no credentials work
//! - DHCP client for IP address acquisition
//! - Broker session for telemetry and remote commands
//! - HTTP API and firmware upload
//!
//! Nothing here blocks on core 0. Store writes that meet a busy lock are kept
//! and retried on the next pass.

use multitool_core::api::{FirmwareInfo, SystemInfo};
use multitool_core::board::FeedGate;
use multitool_core::flash::FlashGate;
use multitool_core::network::NetworkService;
use multitool_core::ota::StagingArea;
use multitool_core::settings::{bounded, SettingsStore, Value};
use multitool_core::{BusGuard, Clock, StateStore};
use smoltcp::iface::SocketStorage;
use smoltcp::socket::dhcpv4::Socket as DhcpSocket;
use static_cell::ConstStaticCell;

use crate::display::OledBus;
use crate::net::{Lease, Stack};
use crate::provision::Portal;
use crate::radio::Radio;
use crate::server::{ApiServer, Network};
use crate::storage::{FlashSlots, OtaStaging};
use crate::transport::BrokerSocket;
use crate::{EspClock, HEARTBEAT, WIFI_AP, WIFI_CONTROLLER, WIFI_STA};

const STATUS_LOG_INTERVAL_MS: u64 = 30_000;
const BACKUP_FEED_INTERVAL_MS: u64 = 5_000;
const LOW_HEAP_KB: usize = 16;

// DHCP, two API listeners, the broker connection and its resolver
static SOCKETS: ConstStaticCell<[SocketStorage<'static>; 6]> =
    ConstStaticCell::new([SocketStorage::EMPTY; 6]);

/// What `/api/status` and `/api/info` report, captured once per pass.
#[derive(Clone)]
struct DeviceInfo {
    free_heap: u32,
    uptime_ms: u64,
    rssi: i8,
    ssid: Value,
    mac: [u8; 6],
    firmware: FirmwareInfo,
}

impl SystemInfo for DeviceInfo {
    fn free_heap(&self) -> u32 {
        self.free_heap
    }

    fn uptime_ms(&self) -> u64 {
        self.uptime_ms
    }

    fn rssi(&self) -> i8 {
        self.rssi
    }

    fn ssid(&self) -> &str {
        &self.ssid
    }

    fn mac(&self) -> [u8; 6] {
        self.mac
    }

    // The driver does not expose the associated channel.
    fn channel(&self) -> u8 {
        0
    }

    fn firmware(&self) -> FirmwareInfo {
        self.firmware
    }
}

fn restart(reason: &str) -> ! {
    log::warn!("system: restarting ({})", reason);
    crate::feed_watchdog();
    esp_radio_rtos_driver::usleep(100_000);
    esp_hal::system::software_reset()
}

/// Core 1 main loop.
pub fn run(
    clock: &'static EspClock,
    store: &'static StateStore,
    bus: &'static BusGuard<OledBus>,
    flash: &'static FlashGate,
) -> ! {
    log::info!("Core 1 started (network)");

    // Give Core 0 time to finish setup
    esp_radio_rtos_driver::usleep(100_000);

    // Take WiFi handles from statics; main stores them before starting this core
    let (sta, ap, controller) = critical_section::with(|cs| {
        let sta = WIFI_STA.borrow_ref_mut(cs).take().expect("station device not handed over");
        let ap = WIFI_AP.borrow_ref_mut(cs).take().expect("access point device not handed over");
        let controller = WIFI_CONTROLLER
            .borrow_ref_mut(cs)
            .take()
            .expect("wifi controller not handed over");
        (sta, ap, controller)
    });

    let settings = SettingsStore::load(FlashSlots::new());
    log::info!("storage: settings loaded (sequence {})", settings.sequence());

    let mut staging = OtaStaging::new();
    let firmware = FirmwareInfo {
        version: env!("CARGO_PKG_VERSION"),
        build: env!("MULTITOOL_BUILD"),
        image_size: staging.running_image_len(),
        free_space: staging.capacity() as u32,
        sdk: "esp-hal 1.0",
        cpu_mhz: 240,
    };
    log::info!(
        "firmware: v{} ({}), image {} bytes, {} bytes for updates",
        firmware.version,
        firmware.build,
        firmware.image_size,
        firmware.free_space
    );

    let mut net: Network =
        NetworkService::new(clock, store, bus, flash, settings, crate::defaults());

    let mac = esp_radio::wifi::sta_mac();
    let mut stack = Stack::new(sta, mac, SOCKETS.take());
    let dhcp = stack.sockets.add(DhcpSocket::new());
    let mut server = ApiServer::new(&mut stack);
    let mut broker = BrokerSocket::new(&mut stack);
    let mut radio = Radio::new(controller, Portal::new(ap));

    crate::heap_debug::log_heap_stats("core1:after_init");

    // Timing state
    let mut last_log: u64 = 0;
    let mut last_wdt_feed: u64 = 0;
    let mut wdt_gate = FeedGate::new(&HEARTBEAT);
    let mut rssi: i8 = 0;

    loop {
        let now_ms = clock.now_ms();

        // 1. Maintain WiFi connection (or the setup access point)
        if let Some(deferred) = net.poll_link(&mut radio) {
            if net.after_response(deferred, &mut broker.link(&mut stack)) {
                restart("setup window expired");
            }
        }

        // 2. DHCP
        if net.link().is_connected() {
            stack.poll();
            match stack.poll_dhcp(dhcp) {
                Some(Lease::Bound { address, dns }) => {
                    broker.set_dns_servers(&mut stack, &dns);
                    net.set_address(Some(address.octets()));
                }
                Some(Lease::Lost) => net.set_address(None),
                None => {}
            }
        } else if stack.has_address() {
            stack.forget_address(dhcp);
        }

        // Only do network operations once we have an IP
        if net.is_online() {
            // 3. Broker session
            net.service_mqtt(&mut broker.link(&mut stack));

            // 4. HTTP API and firmware upload
            let info = DeviceInfo {
                free_heap: crate::heap_debug::free_bytes(),
                uptime_ms: now_ms,
                rssi,
                ssid: bounded(net.link().ssid()).unwrap_or_default(),
                mac,
                firmware,
            };
            let served = server.service(&mut stack, &mut net, &mut staging, || info.clone());
            if let Some(deferred) = served {
                if net.after_response(deferred, &mut broker.link(&mut stack)) {
                    restart("requested over HTTP");
                }
            }

            // 5. Metrics
            net.poll_metrics(|| server.clients(&stack));
            stack.poll();
        }

        net.retry_pending();

        // 6. Status logging
        if now_ms - last_log > STATUS_LOG_INTERVAL_MS {
            last_log = now_ms;
            log::info!(
                "status: wifi={}, online={}, mqtt={}",
                if net.link().is_connected() { "up" } else { "down" },
                net.is_online(),
                if net.mqtt().is_connected() { "up" } else { "down" }
            );
            crate::heap_debug::warn_if_low(LOW_HEAP_KB, "core1");
        }

        // 7. Backup watchdog feed, only while Core 0 is still ticking
        if now_ms - last_wdt_feed >= BACKUP_FEED_INTERVAL_MS {
            last_wdt_feed = now_ms;
            if wdt_gate.should_feed(&HEARTBEAT) {
                crate::feed_watchdog();
            } else {
                log::warn!("watchdog: core 0 stalled, backup feed withheld");
            }
            rssi = radio.rssi();
        }

        // Yield to scheduler - this is critical for WiFi to work!
        // usleep allows other RTOS tasks (like the WiFi driver) to run
        esp_radio_rtos_driver::usleep(10_000);
    }
}
