//! `Radio` backed by the ESP32-S3 station interface.

use core::{
    net::Ipv4Addr,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

use embassy_net::Stack;
use esp_radio::wifi::{
    ClientConfig, ModeConfig, PowerSaveMode, WifiController,
    event::{self, EventExt},
};
use log::{debug, info, warn};
use tracker_core::network::{
    LinkStatus, PhyMode, PowerSavingMode, Radio, RadioError, Ssid, WifiCredentials,
};

use crate::storage::flash_credentials::FlashCredentialStore;

const REASON_NONE: u8 = 0;
const REASON_BEACON_TIMEOUT: u8 = 200;
const REASON_NO_AP_FOUND: u8 = 201;
const REASON_AUTH_FAIL: u8 = 202;
const REASON_ASSOC_FAIL: u8 = 203;
const REASON_HANDSHAKE_TIMEOUT: u8 = 204;
const REASON_CONNECTION_FAIL: u8 = 205;
const REASON_NO_AP_FOUND_COMPAT_SECURITY: u8 = 210;
const REASON_NO_AP_FOUND_AUTHMODE_THRESHOLD: u8 = 211;
const REASON_NO_AP_FOUND_RSSI_THRESHOLD: u8 = 212;

static DISCONNECT_HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);
static LAST_DISCONNECT_REASON: AtomicU8 = AtomicU8::new(REASON_NONE);

fn install_disconnect_handler() {
    if DISCONNECT_HANDLER_INSTALLED.swap(true, Ordering::Relaxed) {
        return;
    }

    event::StaDisconnected::update_handler(|event| {
        let reason = event.reason();
        LAST_DISCONNECT_REASON.store(reason, Ordering::Relaxed);
        debug!("wifi: sta disconnected reason={}", reason);
    });
}

fn link_status_from_reason(reason: u8) -> LinkStatus {
    match reason {
        REASON_NONE => LinkStatus::Idle,
        REASON_NO_AP_FOUND
        | REASON_NO_AP_FOUND_COMPAT_SECURITY
        | REASON_NO_AP_FOUND_AUTHMODE_THRESHOLD
        | REASON_NO_AP_FOUND_RSSI_THRESHOLD => LinkStatus::NoSsidAvailable,
        REASON_AUTH_FAIL
        | REASON_ASSOC_FAIL
        | REASON_HANDSHAKE_TIMEOUT
        | REASON_CONNECTION_FAIL => LinkStatus::ConnectFailed,
        REASON_BEACON_TIMEOUT => LinkStatus::ConnectionLost,
        _ => LinkStatus::Disconnected,
    }
}

fn power_save_mode(mode: PowerSavingMode) -> PowerSaveMode {
    match mode {
        PowerSavingMode::None => PowerSaveMode::None,
        PowerSavingMode::Minimum | PowerSavingMode::Moderate => PowerSaveMode::Minimum,
        PowerSavingMode::Maximum => PowerSaveMode::Maximum,
    }
}

/// Station radio plus the network stack it feeds. The link only counts as
/// connected once DHCP has handed out an address.
pub struct EspRadio {
    controller: WifiController<'static>,
    stack: Stack<'static>,
    credentials: Option<FlashCredentialStore>,
    associating: Option<Ssid>,
}

impl EspRadio {
    /// `credentials` is `None` when no flash partition could be claimed; the
    /// radio then has nothing saved and cannot persist.
    pub fn new(
        controller: WifiController<'static>,
        stack: Stack<'static>,
        credentials: Option<FlashCredentialStore>,
    ) -> Self {
        install_disconnect_handler();
        Self {
            controller,
            stack,
            credentials,
            associating: None,
        }
    }

    fn ensure_started(&mut self) -> Result<(), RadioError> {
        if self.controller.is_started().unwrap_or(false) {
            return Ok(());
        }
        self.controller.start().map_err(|err| {
            warn!("wifi: start failed: {:?}", err);
            RadioError::NotStarted
        })
    }
}

impl Radio for EspRadio {
    fn configure(&mut self, power_saving: PowerSavingMode) -> Result<(), RadioError> {
        let mode = ModeConfig::Client(ClientConfig::default());
        self.controller.set_config(&mode).map_err(|err| {
            warn!("wifi: station mode config failed: {:?}", err);
            RadioError::Config
        })?;
        self.ensure_started()?;

        self.controller
            .set_power_saving(power_save_mode(power_saving))
            .map_err(|err| {
                warn!("wifi: power saving config failed: {:?}", err);
                RadioError::Config
            })?;
        info!("wifi: station ready power_saving={:?}", power_saving);
        Ok(())
    }

    fn begin_association(
        &mut self,
        credentials: &WifiCredentials,
        phy: PhyMode,
    ) -> Result<(), RadioError> {
        if phy == PhyMode::Alternate {
            return Err(RadioError::Config);
        }

        if matches!(self.controller.is_connected(), Ok(true))
            && let Err(err) = self.controller.disconnect()
        {
            warn!("wifi: disconnect before reassociation failed: {:?}", err);
        }

        let client = ClientConfig::default()
            .with_ssid(credentials.ssid.as_str().into())
            .with_password(credentials.password.as_str().into());
        self.controller
            .set_config(&ModeConfig::Client(client))
            .map_err(|err| {
                warn!("wifi: client config failed: {:?}", err);
                RadioError::Config
            })?;
        self.ensure_started()?;

        LAST_DISCONNECT_REASON.store(REASON_NONE, Ordering::Relaxed);
        self.associating = Some(credentials.ssid.clone());
        self.controller.connect().map_err(|err| {
            warn!("wifi: connect request failed: {:?}", err);
            RadioError::Association
        })
    }

    fn link_status(&mut self) -> LinkStatus {
        if matches!(self.controller.is_connected(), Ok(true)) {
            if self.stack.is_link_up() && self.stack.config_v4().is_some() {
                return LinkStatus::Connected;
            }
            return LinkStatus::Idle;
        }
        link_status_from_reason(LAST_DISCONNECT_REASON.load(Ordering::Relaxed))
    }

    fn signal_strength(&mut self) -> Option<i8> {
        let rssi = self.controller.rssi().ok()?;
        i8::try_from(rssi).ok()
    }

    fn local_address(&mut self) -> Option<Ipv4Addr> {
        self.stack.config_v4().map(|config| config.address.address())
    }

    fn connected_ssid(&mut self) -> Option<Ssid> {
        if matches!(self.controller.is_connected(), Ok(true)) {
            self.associating.clone()
        } else {
            None
        }
    }

    fn saved_credentials(&mut self) -> Option<WifiCredentials> {
        let store = self.credentials.as_mut()?;
        match store.load() {
            Ok(saved) => saved,
            Err(err) => {
                warn!("wifi: saved credentials unreadable: {:?}", err);
                None
            }
        }
    }

    fn persist_credentials(&mut self, credentials: &WifiCredentials) -> Result<(), RadioError> {
        let store = self.credentials.as_mut().ok_or(RadioError::Storage)?;
        store.save(credentials).map_err(|err| {
            warn!("wifi: saving credentials failed: {:?}", err);
            RadioError::Storage
        })
    }

    fn supports_alternate_phy(&self) -> bool {
        false
    }
}
