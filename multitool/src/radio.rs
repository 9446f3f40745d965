//! The WiFi controller behind the link manager's retry and provisioning logic.

use alloc::string::ToString;

use esp_radio::wifi::{AccessPointConfig, ClientConfig, ModeConfig, WifiController};
use multitool_core::error::LinkError;
use multitool_core::link::LinkDriver;
use multitool_core::portal::SETUP_SSID;
use multitool_core::settings::WifiCredentials;

use crate::provision::Portal;

pub struct Radio {
    controller: WifiController<'static>,
    portal: Portal,
    provisioning: bool,
}

impl Radio {
    pub fn new(controller: WifiController<'static>, portal: Portal) -> Self {
        Self {
            controller,
            portal,
            provisioning: false,
        }
    }

    /// Signal strength of the current association, 0 when there is none.
    pub fn rssi(&mut self) -> i8 {
        if !self.is_connected() {
            return 0;
        }
        match self.controller.rssi() {
            Ok(dbm) => dbm.clamp(i8::MIN as i32, 0) as i8,
            Err(_) => 0,
        }
    }

    fn stop(&mut self) {
        if let Err(e) = self.controller.stop() {
            log::debug!("wifi: stop failed: {:?}", e);
        }
    }
}

impl LinkDriver for Radio {
    fn begin_connect(&mut self, creds: &WifiCredentials) -> Result<(), LinkError> {
        log::info!("wifi: connecting to {}", creds.ssid);

        // Ensure WiFi is stopped before (re)configuring to avoid ESP-IDF errors
        self.stop();
        esp_radio_rtos_driver::usleep(10_000);

        let client_config = ClientConfig::default()
            .with_ssid(creds.ssid.to_string())
            .with_password(creds.password.to_string());
        self.controller
            .set_config(&ModeConfig::Client(client_config))
            .map_err(|e| {
                log::error!("wifi: set_config failed: {:?}", e);
                LinkError::Config
            })?;
        self.controller.start().map_err(|e| {
            log::error!("wifi: start failed: {:?}", e);
            LinkError::Start
        })?;
        if let Err(e) = self.controller.connect() {
            log::error!("wifi: connect failed: {:?}", e);
        }
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        !self.provisioning && self.controller.is_connected().unwrap_or(false)
    }

    fn power_cycle(&mut self) {
        log::warn!("wifi: power-cycling radio");
        if let Err(e) = self.controller.disconnect() {
            log::warn!("wifi: disconnect failed: {:?}", e);
        }
        self.stop();
        esp_radio_rtos_driver::usleep(100_000);
    }

    fn begin_provisioning(&mut self) -> Result<(), LinkError> {
        log::info!("wifi: opening setup network {}", SETUP_SSID);
        self.stop();
        esp_radio_rtos_driver::usleep(10_000);

        let ap_config = AccessPointConfig::default().with_ssid(SETUP_SSID.to_string());
        self.controller
            .set_config(&ModeConfig::AccessPoint(ap_config))
            .map_err(|e| {
                log::error!("wifi: access point config failed: {:?}", e);
                LinkError::Config
            })?;
        self.controller.start().map_err(|e| {
            log::error!("wifi: access point start failed: {:?}", e);
            LinkError::Start
        })?;
        self.provisioning = true;
        Ok(())
    }

    fn poll_provisioning(&mut self) -> Option<WifiCredentials> {
        if !self.provisioning {
            return None;
        }
        self.portal.poll()
    }

    fn end_provisioning(&mut self) {
        if !self.provisioning {
            return;
        }
        self.portal.close();
        self.stop();
        self.provisioning = false;
        log::info!("wifi: setup network closed");
    }
}
