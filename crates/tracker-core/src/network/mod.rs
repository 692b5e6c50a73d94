//! Wi-Fi connectivity state machine.
//!
//! [`ConnectivityManager::upkeep`] is polled from the main loop. It never
//! waits on the radio: association requests are fire-and-forget and their
//! outcome is observed through [`Radio::link_status`] on later ticks.

use core::net::Ipv4Addr;

use heapless::String;
use log::{debug, error, info, trace, warn};

use crate::status::{Status, StatusFlags};

pub const ATTEMPT_TIMEOUT_MS: u64 = 11_000;
pub const CONNECT_GRACE_MS: u64 = 500;
pub const RSSI_SAMPLE_INTERVAL_MS: u64 = 2_000;
pub const PROGRESS_TRACE_INTERVAL_MS: u64 = 1_000;

pub const MAX_SSID_BYTES: usize = 32;
pub const MAX_PASSWORD_BYTES: usize = 64;

pub type Ssid = String<MAX_SSID_BYTES>;
pub type Passphrase = String<MAX_PASSWORD_BYTES>;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WifiCredentials {
    pub ssid: Ssid,
    pub password: Passphrase,
}

impl WifiCredentials {
    /// `None` when either field exceeds the 802.11 limits.
    pub fn new(ssid: &str, password: &str) -> Option<Self> {
        let mut credentials = Self::default();
        credentials.ssid.push_str(ssid).ok()?;
        credentials.password.push_str(password).ok()?;
        Some(credentials)
    }

    pub fn has_ssid(&self) -> bool {
        !self.ssid.is_empty()
    }
}

/// Radio sleep policy, persisted in the device record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PowerSavingMode {
    None = 0,
    Minimum = 1,
    Moderate = 2,
    Maximum = 3,
}

impl PowerSavingMode {
    pub const DEFAULT: Self = Self::Minimum;

    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Minimum,
            2 => Self::Moderate,
            3 => Self::Maximum,
            _ => Self::DEFAULT,
        }
    }
}

impl Default for PowerSavingMode {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Physical-layer mode of one association request. `Alternate` is the
/// slower, more tolerant mode some radios can fall back to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PhyMode {
    Primary,
    Alternate,
}

/// Station link status as reported by the radio driver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkStatus {
    Idle,
    Connected,
    NoSsidAvailable,
    ConnectFailed,
    ConnectionLost,
    Disconnected,
}

impl LinkStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connected => "connected",
            Self::NoSsidAvailable => "no SSID available",
            Self::ConnectFailed => "connect failed",
            Self::ConnectionLost => "connection lost",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Why an attempt ended without a link. Diagnostics only.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureReason {
    Timeout,
    WrongPassword,
    SsidNotFound,
    Unknown,
}

impl FailureReason {
    pub const fn from_status(status: LinkStatus) -> Self {
        match status {
            LinkStatus::Disconnected => Self::Timeout,
            LinkStatus::ConnectFailed => Self::WrongPassword,
            LinkStatus::NoSsidAvailable => Self::SsidNotFound,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "Timeout",
            Self::WrongPassword => "Wrong password",
            Self::SsidNotFound => "SSID not found",
            Self::Unknown => "Unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RadioError {
    NotStarted,
    Config,
    Association,
    Storage,
}

/// Station-mode radio driver.
pub trait Radio {
    /// Station mode with the given sleep policy. Called once at setup.
    fn configure(&mut self, power_saving: PowerSavingMode) -> Result<(), RadioError>;
    /// Starts associating and returns without waiting for the outcome.
    fn begin_association(
        &mut self,
        credentials: &WifiCredentials,
        phy: PhyMode,
    ) -> Result<(), RadioError>;
    fn link_status(&mut self) -> LinkStatus;
    fn signal_strength(&mut self) -> Option<i8>;
    fn local_address(&mut self) -> Option<Ipv4Addr>;
    fn connected_ssid(&mut self) -> Option<Ssid>;
    fn saved_credentials(&mut self) -> Option<WifiCredentials>;
    fn persist_credentials(&mut self, credentials: &WifiCredentials) -> Result<(), RadioError>;
    fn supports_alternate_phy(&self) -> bool;
}

/// Out-of-band credential delivery (serial console, pairing, ...).
pub trait Provisioning {
    fn start(&mut self);
    fn stop(&mut self);
    fn is_done(&self) -> bool;
    fn poll(&mut self, now_ms: u64) -> Option<WifiCredentials>;
}

/// Provisioning backend for boards without one.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoProvisioning;

impl Provisioning for NoProvisioning {
    fn start(&mut self) {}

    fn stop(&mut self) {}

    fn is_done(&self) -> bool {
        false
    }

    fn poll(&mut self, _now_ms: u64) -> Option<WifiCredentials> {
        None
    }
}

/// Sink for periodic link quality samples.
pub trait SignalReporter {
    fn report_signal_strength(&mut self, rssi: i8);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectivityState {
    NotSetup,
    SavedCredentialAttempt,
    HardcodedCredentialAttempt,
    ExternallyPushedCredentialAttempt,
    Connected,
    Failed,
}

impl ConnectivityState {
    pub const fn is_attempt(self) -> bool {
        matches!(
            self,
            Self::SavedCredentialAttempt
                | Self::HardcodedCredentialAttempt
                | Self::ExternallyPushedCredentialAttempt
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CredentialSource {
    Saved,
    Hardcoded,
    Pushed,
}

impl CredentialSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::Hardcoded => "hardcoded",
            Self::Pushed => "pushed",
        }
    }
}

/// Association request the radio is currently working on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InFlightAttempt {
    pub source: CredentialSource,
    pub phy_mode: PhyMode,
    pub credentials: WifiCredentials,
    pub started_ms: u64,
}

pub struct ConnectivityManager<R, P> {
    radio: R,
    provisioning: P,
    hardcoded: Option<WifiCredentials>,
    state: ConnectivityState,
    attempt: Option<InFlightAttempt>,
    alternate_tried: bool,
    ever_connected: bool,
    timeout_anchor_ms: u64,
    grace_anchor_ms: Option<u64>,
    last_rssi_ms: Option<u64>,
    last_progress_ms: u64,
    last_failure: Option<FailureReason>,
}

impl<R: Radio, P: Provisioning> ConnectivityManager<R, P> {
    pub fn new(radio: R, provisioning: P, hardcoded: Option<WifiCredentials>) -> Self {
        Self {
            radio,
            provisioning,
            hardcoded,
            state: ConnectivityState::NotSetup,
            attempt: None,
            alternate_tried: false,
            ever_connected: false,
            timeout_anchor_ms: 0,
            grace_anchor_ms: None,
            last_rssi_ms: None,
            last_progress_ms: 0,
            last_failure: None,
        }
    }

    pub fn configure(&mut self, now_ms: u64, power_saving: PowerSavingMode) {
        info!("wifi: setting up (power saving {:?})", power_saving);
        if let Err(err) = self.radio.configure(power_saving) {
            error!("wifi: radio setup failed: {:?}", err);
        }
        match self.radio.saved_credentials() {
            Some(saved) => info!(
                "wifi: loaded credentials for SSID '{}' and pass length {}",
                saved.ssid,
                saved.password.len()
            ),
            None => info!("wifi: no saved credentials"),
        }

        self.state = ConnectivityState::NotSetup;
        self.attempt = None;
        self.alternate_tried = false;
        self.ever_connected = false;
        self.grace_anchor_ms = None;
        self.timeout_anchor_ms = now_ms;
    }

    /// Switches to credentials delivered from outside the state machine.
    pub fn push_external_credentials(&mut self, now_ms: u64, credentials: WifiCredentials) {
        self.provisioning.stop();
        if let Err(err) = self.radio.persist_credentials(&credentials) {
            warn!("wifi: could not persist credentials: {:?}", err);
        }

        self.alternate_tried = false;
        // Provisioning may run again if these credentials never work.
        self.ever_connected = false;
        self.state = ConnectivityState::ExternallyPushedCredentialAttempt;
        self.begin_attempt(now_ms, CredentialSource::Pushed, PhyMode::Primary, credentials);
    }

    pub fn upkeep<S: SignalReporter>(&mut self, now_ms: u64, status: &StatusFlags, reporter: &mut S) {
        if let Some(credentials) = self.provisioning.poll(now_ms) {
            info!(
                "wifi: provisioning delivered credentials for SSID '{}'",
                credentials.ssid
            );
            self.push_external_credentials(now_ms, credentials);
        }

        let link = self.radio.link_status();

        if link == LinkStatus::Connected {
            if self.state != ConnectivityState::Connected {
                let anchor = *self.grace_anchor_ms.get_or_insert(now_ms);
                if now_ms.saturating_sub(anchor) < CONNECT_GRACE_MS {
                    return;
                }
                self.on_connected(status);
            }

            let sample_due = self
                .last_rssi_ms
                .is_none_or(|last| now_ms.saturating_sub(last) >= RSSI_SAMPLE_INTERVAL_MS);
            if sample_due {
                self.last_rssi_ms = Some(now_ms);
                if let Some(rssi) = self.radio.signal_strength() {
                    reporter.report_signal_strength(rssi);
                }
            }
            return;
        }

        self.grace_anchor_ms = None;

        if self.state == ConnectivityState::Connected {
            status.set_status(Status::WifiConnecting, true);
            warn!(
                "wifi: connection lost ({}), restarting state machine",
                link.as_str()
            );
            self.state = ConnectivityState::NotSetup;
            self.attempt = None;
            self.alternate_tried = false;
            self.last_rssi_ms = None;
            return;
        }

        if self.state == ConnectivityState::NotSetup {
            debug!("wifi: initial connect using saved credentials");
            self.try_saved_credentials(now_ms);
            return;
        }

        if self.state.is_attempt()
            && let Some(attempt) = &self.attempt
            && now_ms.saturating_sub(attempt.started_ms) < ATTEMPT_TIMEOUT_MS
        {
            self.report_progress(now_ms, link);
            return;
        }

        match self.state {
            ConnectivityState::SavedCredentialAttempt => {
                if !self.retry_alternate(now_ms, link) {
                    self.try_hardcoded_credentials(now_ms);
                }
            }
            ConnectivityState::HardcodedCredentialAttempt
            | ConnectivityState::ExternallyPushedCredentialAttempt => {
                if !self.retry_alternate(now_ms, link) {
                    info!("wifi: every credential source failed");
                    self.state = ConnectivityState::Failed;
                }
            }
            ConnectivityState::Failed => {
                if !self.ever_connected
                    && !self.provisioning.is_done()
                    && now_ms.saturating_sub(self.timeout_anchor_ms) >= ATTEMPT_TIMEOUT_MS
                {
                    error!(
                        "wifi: can't connect from any credentials, last status {} ({})",
                        link.as_str(),
                        FailureReason::from_status(link).as_str()
                    );
                    self.timeout_anchor_ms = now_ms;
                    self.provisioning.start();
                }
            }
            ConnectivityState::NotSetup | ConnectivityState::Connected => {}
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectivityState::Connected
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn current_attempt(&self) -> Option<&InFlightAttempt> {
        self.attempt.as_ref()
    }

    pub fn ever_connected(&self) -> bool {
        self.ever_connected
    }

    pub fn last_failure(&self) -> Option<FailureReason> {
        self.last_failure
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn provisioning(&self) -> &P {
        &self.provisioning
    }

    fn try_saved_credentials(&mut self, now_ms: u64) {
        self.state = ConnectivityState::SavedCredentialAttempt;
        self.alternate_tried = false;
        match self.radio.saved_credentials() {
            Some(credentials) if credentials.has_ssid() => {
                self.begin_attempt(now_ms, CredentialSource::Saved, PhyMode::Primary, credentials);
            }
            _ => {
                debug!("wifi: skipping saved credentials attempt on 0-length SSID");
                self.attempt = None;
            }
        }
    }

    fn try_hardcoded_credentials(&mut self, now_ms: u64) {
        self.state = ConnectivityState::HardcodedCredentialAttempt;
        self.alternate_tried = false;
        match self.hardcoded.clone() {
            Some(credentials) if credentials.has_ssid() => {
                self.begin_attempt(
                    now_ms,
                    CredentialSource::Hardcoded,
                    PhyMode::Primary,
                    credentials,
                );
            }
            _ => {
                debug!("wifi: no compiled-in credentials");
                self.attempt = None;
            }
        }
    }

    /// Retires the in-flight attempt and re-issues it once in the alternate
    /// PHY mode. Returns `false` when the source is exhausted.
    fn retry_alternate(&mut self, now_ms: u64, link: LinkStatus) -> bool {
        let Some(attempt) = self.attempt.take() else {
            return false;
        };

        let reason = FailureReason::from_status(link);
        self.last_failure = Some(reason);
        error!(
            "wifi: can't connect from {} credentials, status {} ({})",
            attempt.source.as_str(),
            link.as_str(),
            reason.as_str()
        );

        if self.alternate_tried || !self.radio.supports_alternate_phy() {
            return false;
        }

        self.alternate_tried = true;
        debug!(
            "wifi: trying {} credentials with alternate PHY mode",
            attempt.source.as_str()
        );
        self.begin_attempt(now_ms, attempt.source, PhyMode::Alternate, attempt.credentials);
        true
    }

    fn begin_attempt(
        &mut self,
        now_ms: u64,
        source: CredentialSource,
        phy_mode: PhyMode,
        credentials: WifiCredentials,
    ) {
        self.timeout_anchor_ms = now_ms;
        self.last_progress_ms = now_ms;
        self.grace_anchor_ms = None;

        match self.radio.begin_association(&credentials, phy_mode) {
            Ok(()) => info!(
                "wifi: connecting to '{}' with {} credentials ({:?})",
                credentials.ssid,
                source.as_str(),
                phy_mode
            ),
            // Left in flight so the timeout escalates as usual.
            Err(err) => warn!("wifi: association request rejected: {:?}", err),
        }

        self.attempt = Some(InFlightAttempt {
            source,
            phy_mode,
            credentials,
            started_ms: now_ms,
        });
    }

    fn on_connected(&mut self, status: &StatusFlags) {
        self.state = ConnectivityState::Connected;
        self.attempt = None;
        self.alternate_tried = false;
        self.last_rssi_ms = None;
        self.ever_connected = true;
        self.provisioning.stop();
        status.set_status(Status::WifiConnecting, false);

        let ssid = self.radio.connected_ssid().unwrap_or_default();
        match self.radio.local_address() {
            Some(address) => info!(
                "wifi: connected successfully to SSID '{}', IP address {}",
                ssid, address
            ),
            None => info!(
                "wifi: connected successfully to SSID '{}', no IP address yet",
                ssid
            ),
        }
    }

    fn report_progress(&mut self, now_ms: u64, link: LinkStatus) {
        if now_ms.saturating_sub(self.last_progress_ms) >= PROGRESS_TRACE_INTERVAL_MS {
            self.last_progress_ms = now_ms;
            trace!("wifi: waiting for association ({})", link.as_str());
        }
    }
}

#[cfg(test)]
mod tests;
