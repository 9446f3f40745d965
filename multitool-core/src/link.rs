//! Network bring-up and reconnection.
//!
//! Non-blocking: [`LinkManager::maintain`] is polled once per network-core
//! pass and never waits on the radio itself.

use crate::error::LinkError;
use crate::settings::WifiCredentials;

pub const CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const MAX_ATTEMPTS: u8 = 3;
pub const RESET_COOLDOWN_MS: u64 = 5_000;
pub const PROVISION_WINDOW_MS: u64 = 180_000;

/// The station radio plus the provisioning collaborator.
pub trait LinkDriver {
    /// Stop, reconfigure and start connecting. Returns immediately.
    fn begin_connect(&mut self, creds: &WifiCredentials) -> Result<(), LinkError>;

    fn is_connected(&mut self) -> bool;

    /// Disconnect and stop the radio to clear a wedged driver.
    fn power_cycle(&mut self);

    /// Open the access point and credential form.
    fn begin_provisioning(&mut self) -> Result<(), LinkError>;

    /// Credentials submitted through the provisioning form, if any yet.
    fn poll_provisioning(&mut self) -> Option<WifiCredentials>;

    fn end_provisioning(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Radio idle until `until_ms`. `provision` selects what comes next.
    Cooldown { until_ms: u64, provision: bool },
    Connecting { attempt: u8, started_ms: u64 },
    Connected,
    Provisioning { deadline_ms: u64 },
    /// The provisioning window ran out; a restart has been requested.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    /// An established link went away. Anything derived from it is stale.
    Dropped,
    /// New credentials came in through provisioning and should be saved.
    Provisioned(WifiCredentials),
    RestartRequired,
}

pub struct LinkManager {
    state: LinkState,
    credentials: Option<WifiCredentials>,
}

impl LinkManager {
    /// Without stored credentials the first pass opens the provisioning window.
    pub fn new(credentials: Option<WifiCredentials>) -> Self {
        Self {
            state: LinkState::Cooldown {
                until_ms: 0,
                provision: credentials.is_none(),
            },
            credentials,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn ssid(&self) -> &str {
        self.credentials.as_ref().map_or("", |c| c.ssid.as_str())
    }

    pub fn maintain<D: LinkDriver>(&mut self, driver: &mut D, now_ms: u64) -> Option<LinkEvent> {
        match self.state {
            LinkState::Cooldown { until_ms, provision } => {
                if now_ms < until_ms {
                    return None;
                }
                if provision {
                    self.open_window(driver, now_ms);
                } else {
                    self.attempt(driver, 1, now_ms);
                }
                None
            }
            LinkState::Connecting { attempt, started_ms } => {
                if driver.is_connected() {
                    log::info!("wifi: connected to {}", self.ssid());
                    self.state = LinkState::Connected;
                    return Some(LinkEvent::Connected);
                }
                if now_ms.saturating_sub(started_ms) > CONNECT_TIMEOUT_MS {
                    log::warn!("wifi: connection timeout (attempt {}/{})", attempt, MAX_ATTEMPTS);
                    if attempt >= MAX_ATTEMPTS {
                        log::warn!("wifi: power-cycling radio after {} failures", attempt);
                        driver.power_cycle();
                        self.state = LinkState::Cooldown {
                            until_ms: now_ms + RESET_COOLDOWN_MS,
                            provision: true,
                        };
                    } else {
                        self.attempt(driver, attempt + 1, now_ms);
                    }
                }
                None
            }
            LinkState::Connected => {
                if driver.is_connected() {
                    return None;
                }
                log::warn!("wifi: disconnected, will power-cycle radio");
                driver.power_cycle();
                self.state = LinkState::Cooldown {
                    until_ms: now_ms + RESET_COOLDOWN_MS,
                    provision: false,
                };
                Some(LinkEvent::Dropped)
            }
            LinkState::Provisioning { deadline_ms } => {
                if let Some(creds) = driver.poll_provisioning() {
                    driver.end_provisioning();
                    log::info!("wifi: provisioned for {}", creds.ssid);
                    self.credentials = Some(creds.clone());
                    self.attempt(driver, 1, now_ms);
                    return Some(LinkEvent::Provisioned(creds));
                }
                if now_ms >= deadline_ms {
                    driver.end_provisioning();
                    log::error!("wifi: provisioning window expired, restarting");
                    self.state = LinkState::Expired;
                    return Some(LinkEvent::RestartRequired);
                }
                None
            }
            LinkState::Expired => None,
        }
    }

    fn attempt<D: LinkDriver>(&mut self, driver: &mut D, attempt: u8, now_ms: u64) {
        let Some(creds) = &self.credentials else {
            self.open_window(driver, now_ms);
            return;
        };
        log::info!("wifi: connecting to {}", creds.ssid);
        if let Err(e) = driver.begin_connect(creds) {
            // The attempt still times out and counts against the budget.
            log::error!("wifi: {}", e);
        }
        self.state = LinkState::Connecting {
            attempt,
            started_ms: now_ms,
        };
    }

    fn open_window<D: LinkDriver>(&mut self, driver: &mut D, now_ms: u64) {
        log::info!("wifi: opening provisioning window ({} s)", PROVISION_WINDOW_MS / 1000);
        if let Err(e) = driver.begin_provisioning() {
            log::error!("wifi: provisioning: {}", e);
        }
        self.state = LinkState::Provisioning {
            deadline_ms: now_ms + PROVISION_WINDOW_MS,
        };
    }
}
