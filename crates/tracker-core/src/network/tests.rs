use super::*;

struct FakeRadio {
    link: LinkStatus,
    saved: Option<WifiCredentials>,
    alternate_phy: bool,
    rssi: i8,
    configured: Option<PowerSavingMode>,
    persisted: Option<WifiCredentials>,
    associations: std::vec::Vec<(std::string::String, PhyMode)>,
}

impl FakeRadio {
    fn new(saved: Option<WifiCredentials>) -> Self {
        Self {
            link: LinkStatus::Disconnected,
            saved,
            alternate_phy: true,
            rssi: -61,
            configured: None,
            persisted: None,
            associations: std::vec::Vec::new(),
        }
    }

    fn associated_with(&self) -> std::vec::Vec<(&str, PhyMode)> {
        self.associations
            .iter()
            .map(|(ssid, phy)| (ssid.as_str(), *phy))
            .collect()
    }
}

impl Radio for FakeRadio {
    fn configure(&mut self, power_saving: PowerSavingMode) -> Result<(), RadioError> {
        self.configured = Some(power_saving);
        Ok(())
    }

    fn begin_association(
        &mut self,
        credentials: &WifiCredentials,
        phy: PhyMode,
    ) -> Result<(), RadioError> {
        self.associations
            .push((credentials.ssid.as_str().to_string(), phy));
        Ok(())
    }

    fn link_status(&mut self) -> LinkStatus {
        self.link
    }

    fn signal_strength(&mut self) -> Option<i8> {
        Some(self.rssi)
    }

    fn local_address(&mut self) -> Option<Ipv4Addr> {
        Some(Ipv4Addr::new(192, 168, 1, 40))
    }

    fn connected_ssid(&mut self) -> Option<Ssid> {
        self.associations.last().and_then(|(ssid, _)| {
            let mut out = Ssid::new();
            out.push_str(ssid).ok()?;
            Some(out)
        })
    }

    fn saved_credentials(&mut self) -> Option<WifiCredentials> {
        self.saved.clone()
    }

    fn persist_credentials(&mut self, credentials: &WifiCredentials) -> Result<(), RadioError> {
        self.persisted = Some(credentials.clone());
        self.saved = Some(credentials.clone());
        Ok(())
    }

    fn supports_alternate_phy(&self) -> bool {
        self.alternate_phy
    }
}

#[derive(Default)]
struct FakeProvisioning {
    running: bool,
    starts: u32,
    stops: u32,
    done: bool,
    pending: Option<WifiCredentials>,
}

impl Provisioning for FakeProvisioning {
    fn start(&mut self) {
        self.running = true;
        self.starts += 1;
    }

    fn stop(&mut self) {
        self.running = false;
        self.stops += 1;
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn poll(&mut self, _now_ms: u64) -> Option<WifiCredentials> {
        self.pending.take()
    }
}

#[derive(Default)]
struct RecordingReporter {
    samples: std::vec::Vec<i8>,
}

impl SignalReporter for RecordingReporter {
    fn report_signal_strength(&mut self, rssi: i8) {
        self.samples.push(rssi);
    }
}

struct Harness {
    manager: ConnectivityManager<FakeRadio, FakeProvisioning>,
    status: StatusFlags,
    reporter: RecordingReporter,
    now_ms: u64,
}

impl Harness {
    fn new(saved: Option<WifiCredentials>, hardcoded: Option<WifiCredentials>) -> Self {
        let mut manager =
            ConnectivityManager::new(FakeRadio::new(saved), FakeProvisioning::default(), hardcoded);
        manager.configure(0, PowerSavingMode::Minimum);
        let status = StatusFlags::new();
        status.set_status(Status::WifiConnecting, true);
        Self {
            manager,
            status,
            reporter: RecordingReporter::default(),
            now_ms: 0,
        }
    }

    fn tick(&mut self) -> ConnectivityState {
        self.manager
            .upkeep(self.now_ms, &self.status, &mut self.reporter);
        self.manager.state()
    }

    fn advance(&mut self, ms: u64) -> ConnectivityState {
        self.now_ms += ms;
        self.tick()
    }

    /// Ticks every `step_ms` until `until_ms`, returning each state change.
    fn run(&mut self, step_ms: u64, until_ms: u64) -> std::vec::Vec<ConnectivityState> {
        let mut visited = std::vec::Vec::new();
        while self.now_ms < until_ms {
            let state = self.advance(step_ms);
            if visited.last() != Some(&state) {
                visited.push(state);
            }
        }
        visited
    }

    fn set_link(&mut self, link: LinkStatus) {
        self.manager.radio_mut().link = link;
    }
}

fn creds(ssid: &str) -> Option<WifiCredentials> {
    WifiCredentials::new(ssid, "password")
}

#[test]
fn dead_link_walks_every_source_in_order() {
    let mut harness = Harness::new(creds("home"), creds("fallback"));
    assert_eq!(harness.manager.state(), ConnectivityState::NotSetup);

    let visited = harness.run(100, 60_000);

    assert_eq!(
        visited,
        [
            ConnectivityState::SavedCredentialAttempt,
            ConnectivityState::HardcodedCredentialAttempt,
            ConnectivityState::Failed,
        ]
    );
    assert_eq!(
        harness.manager.radio().associated_with(),
        [
            ("home", PhyMode::Primary),
            ("home", PhyMode::Alternate),
            ("fallback", PhyMode::Primary),
            ("fallback", PhyMode::Alternate),
        ]
    );
    assert!(harness.manager.provisioning().starts >= 1);
    assert!(harness.status.has_status(Status::WifiConnecting));
    assert_eq!(harness.manager.last_failure(), Some(FailureReason::Timeout));
}

#[test]
fn attempts_wait_out_the_full_timeout() {
    let mut harness = Harness::new(creds("home"), creds("fallback"));
    harness.tick();

    harness.advance(ATTEMPT_TIMEOUT_MS - 1);
    assert_eq!(harness.manager.radio().associations.len(), 1);

    harness.advance(1);
    let attempt = harness.manager.current_attempt().unwrap();
    assert_eq!(attempt.phy_mode, PhyMode::Alternate);
    assert_eq!(attempt.source, CredentialSource::Saved);
    assert_eq!(attempt.started_ms, ATTEMPT_TIMEOUT_MS);
}

#[test]
fn empty_saved_ssid_does_not_consume_a_timeout() {
    let mut harness = Harness::new(WifiCredentials::new("", ""), creds("fallback"));

    assert_eq!(harness.tick(), ConnectivityState::SavedCredentialAttempt);
    assert!(harness.manager.current_attempt().is_none());

    assert_eq!(
        harness.advance(10),
        ConnectivityState::HardcodedCredentialAttempt
    );
    assert_eq!(
        harness.manager.radio().associated_with(),
        [("fallback", PhyMode::Primary)]
    );
}

#[test]
fn no_credentials_anywhere_fails_without_associating() {
    let mut harness = Harness::new(None, None);

    assert_eq!(harness.tick(), ConnectivityState::SavedCredentialAttempt);
    assert_eq!(
        harness.advance(10),
        ConnectivityState::HardcodedCredentialAttempt
    );
    assert_eq!(harness.advance(10), ConnectivityState::Failed);
    assert!(harness.manager.radio().associations.is_empty());

    harness.advance(ATTEMPT_TIMEOUT_MS);
    assert_eq!(harness.manager.provisioning().starts, 1);
    assert!(harness.manager.provisioning().running);
}

#[test]
fn radio_without_alternate_phy_skips_retries() {
    let mut harness = Harness::new(creds("home"), creds("fallback"));
    harness.manager.radio_mut().alternate_phy = false;

    harness.run(100, 30_000);

    assert_eq!(
        harness.manager.radio().associated_with(),
        [("home", PhyMode::Primary), ("fallback", PhyMode::Primary)]
    );
    assert_eq!(harness.manager.state(), ConnectivityState::Failed);
}

#[test]
fn connection_is_declared_after_grace_period() {
    let mut harness = Harness::new(creds("home"), None);
    harness.tick();
    harness.set_link(LinkStatus::Connected);

    assert_eq!(
        harness.advance(100),
        ConnectivityState::SavedCredentialAttempt
    );
    assert_eq!(
        harness.advance(CONNECT_GRACE_MS - 1),
        ConnectivityState::SavedCredentialAttempt
    );
    assert_eq!(harness.advance(1), ConnectivityState::Connected);

    assert!(harness.manager.is_connected());
    assert!(harness.manager.ever_connected());
    assert!(!harness.status.has_status(Status::WifiConnecting));
    assert_eq!(harness.manager.provisioning().stops, 1);
    assert_eq!(harness.reporter.samples, [-61]);
}

#[test]
fn grace_period_restarts_on_fresh_association() {
    let mut harness = Harness::new(creds("home"), None);
    harness.tick();

    harness.set_link(LinkStatus::Connected);
    harness.advance(1_000);
    harness.set_link(LinkStatus::Disconnected);
    harness.advance(200);
    harness.set_link(LinkStatus::Connected);
    harness.advance(100);

    assert_eq!(
        harness.advance(CONNECT_GRACE_MS - 1),
        ConnectivityState::SavedCredentialAttempt
    );
    assert_eq!(harness.advance(1), ConnectivityState::Connected);
}

#[test]
fn signal_strength_is_sampled_every_two_seconds() {
    let mut harness = Harness::new(creds("home"), None);
    harness.tick();
    harness.set_link(LinkStatus::Connected);
    harness.advance(0);
    harness.advance(CONNECT_GRACE_MS);
    assert_eq!(harness.reporter.samples.len(), 1);

    harness.manager.radio_mut().rssi = -70;
    harness.advance(RSSI_SAMPLE_INTERVAL_MS - 1);
    assert_eq!(harness.reporter.samples.len(), 1);
    harness.advance(1);
    harness.advance(1_000);
    harness.advance(1_000);

    assert_eq!(harness.reporter.samples, [-61, -70, -70]);
}

#[test]
fn link_drop_restarts_selection_exactly_once() {
    let mut harness = Harness::new(creds("home"), None);
    harness.tick();
    harness.set_link(LinkStatus::Connected);
    harness.advance(0);
    harness.advance(CONNECT_GRACE_MS);
    assert!(harness.manager.is_connected());

    harness.set_link(LinkStatus::ConnectionLost);
    assert_eq!(harness.advance(10), ConnectivityState::NotSetup);
    assert!(harness.status.has_status(Status::WifiConnecting));
    assert!(harness.manager.current_attempt().is_none());

    assert_eq!(
        harness.advance(10),
        ConnectivityState::SavedCredentialAttempt
    );
    assert_eq!(
        harness.advance(10),
        ConnectivityState::SavedCredentialAttempt
    );
    assert!(harness.manager.ever_connected());
}

#[test]
fn previously_connected_device_does_not_reprovision() {
    let mut harness = Harness::new(creds("home"), None);
    harness.tick();
    harness.set_link(LinkStatus::Connected);
    harness.advance(0);
    harness.advance(CONNECT_GRACE_MS);
    harness.set_link(LinkStatus::Disconnected);

    let visited = harness.run(100, 80_000);

    assert_eq!(visited.last(), Some(&ConnectivityState::Failed));
    assert_eq!(harness.manager.provisioning().starts, 0);
}

#[test]
fn pushed_credentials_take_over_from_any_state() {
    let mut harness = Harness::new(creds("home"), None);
    harness.run(100, 40_000);
    assert_eq!(harness.manager.state(), ConnectivityState::Failed);
    assert!(harness.manager.provisioning().running);

    let pushed = WifiCredentials::new("venue", "secret").unwrap();
    harness
        .manager
        .push_external_credentials(harness.now_ms, pushed.clone());

    assert_eq!(
        harness.manager.state(),
        ConnectivityState::ExternallyPushedCredentialAttempt
    );
    assert!(!harness.manager.provisioning().running);
    assert_eq!(harness.manager.radio().persisted, Some(pushed));
    assert_eq!(
        harness.manager.radio().associations.last().map(|(s, p)| (s.as_str(), *p)),
        Some(("venue", PhyMode::Primary))
    );

    harness.set_link(LinkStatus::Connected);
    harness.advance(0);
    harness.advance(CONNECT_GRACE_MS);
    assert!(harness.manager.is_connected());

    harness
        .manager
        .push_external_credentials(harness.now_ms, WifiCredentials::new("other", "x").unwrap());
    assert_eq!(
        harness.manager.state(),
        ConnectivityState::ExternallyPushedCredentialAttempt
    );
    assert!(!harness.manager.ever_connected());
}

#[test]
fn pushed_credentials_get_one_alternate_retry() {
    let mut harness = Harness::new(None, None);
    harness.manager.push_external_credentials(0, WifiCredentials::new("venue", "pw").unwrap());
    harness.set_link(LinkStatus::ConnectFailed);

    let visited = harness.run(100, 30_000);

    assert_eq!(
        visited,
        [
            ConnectivityState::ExternallyPushedCredentialAttempt,
            ConnectivityState::Failed,
        ]
    );
    assert_eq!(
        harness.manager.radio().associated_with(),
        [("venue", PhyMode::Primary), ("venue", PhyMode::Alternate)]
    );
    assert_eq!(
        harness.manager.last_failure(),
        Some(FailureReason::WrongPassword)
    );
}

#[test]
fn push_after_exhaustion_rearms_alternate_retry() {
    let mut harness = Harness::new(creds("home"), creds("fallback"));
    harness.run(100, 60_000);
    assert_eq!(harness.manager.state(), ConnectivityState::Failed);
    assert_eq!(harness.manager.radio().associations.len(), 4);

    harness
        .manager
        .push_external_credentials(harness.now_ms, WifiCredentials::new("venue", "pw").unwrap());
    let visited = harness.run(100, 90_000);

    assert_eq!(
        visited,
        [
            ConnectivityState::ExternallyPushedCredentialAttempt,
            ConnectivityState::Failed,
        ]
    );
    assert_eq!(
        harness.manager.radio().associated_with()[4..],
        [("venue", PhyMode::Primary), ("venue", PhyMode::Alternate)]
    );
}

#[test]
fn provisioning_results_are_applied_on_upkeep() {
    let status = StatusFlags::new();
    let mut reporter = RecordingReporter::default();
    let provisioning = FakeProvisioning {
        pending: WifiCredentials::new("from-serial", "pw"),
        ..FakeProvisioning::default()
    };
    let mut manager = ConnectivityManager::new(FakeRadio::new(None), provisioning, None);
    manager.configure(0, PowerSavingMode::None);

    manager.upkeep(5, &status, &mut reporter);

    assert_eq!(
        manager.state(),
        ConnectivityState::ExternallyPushedCredentialAttempt
    );
    assert_eq!(manager.radio().configured, Some(PowerSavingMode::None));
    assert_eq!(
        manager.radio().saved.as_ref().map(|c| c.ssid.as_str()),
        Some("from-serial")
    );
    assert_eq!(manager.provisioning().stops, 1);
}

#[test]
fn completed_provisioning_is_not_restarted() {
    let mut harness = Harness::new(None, None);
    harness.manager = ConnectivityManager::new(
        FakeRadio::new(None),
        FakeProvisioning {
            done: true,
            ..FakeProvisioning::default()
        },
        None,
    );
    harness.manager.configure(0, PowerSavingMode::Minimum);

    harness.run(100, 60_000);

    assert_eq!(harness.manager.state(), ConnectivityState::Failed);
    assert_eq!(harness.manager.provisioning().starts, 0);
}

#[test]
fn failure_reasons_follow_link_status() {
    assert_eq!(
        FailureReason::from_status(LinkStatus::Disconnected),
        FailureReason::Timeout
    );
    assert_eq!(
        FailureReason::from_status(LinkStatus::ConnectFailed),
        FailureReason::WrongPassword
    );
    assert_eq!(
        FailureReason::from_status(LinkStatus::NoSsidAvailable),
        FailureReason::SsidNotFound
    );
    assert_eq!(
        FailureReason::from_status(LinkStatus::Idle).as_str(),
        "Unknown"
    );
}

#[test]
fn oversized_credentials_are_rejected() {
    let long_ssid = "x".repeat(MAX_SSID_BYTES + 1);
    assert!(WifiCredentials::new(&long_ssid, "pw").is_none());
    assert!(WifiCredentials::new("ok", "pw").unwrap().has_ssid());
    assert_eq!(PowerSavingMode::from_raw(9), PowerSavingMode::Minimum);
}
