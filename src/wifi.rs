//! WiFi attach
//!
//! Tries each configured access point in order and classifies the failure
//! when none of them can be joined. The ESP32-C3 radio driver lives in
//! [`esp`] (firmware builds only).

use log::{info, warn};

use crate::platform::{AccessPoint, Clock, WifiRadio};
use crate::settings::{SettingsRecord, WifiCandidate};
use crate::state_machine::{ConnectionEvent, ConnectionState};
use crate::status::{Progress, Status};
use crate::{BridgeError, config};

/// Join the first configured network that accepts us.
///
/// Any existing association is dropped first. Returns the index of the
/// candidate that was joined.
pub async fn attach_wireless<R, C, F>(
    radio: &mut R,
    clock: &C,
    state: &mut ConnectionState,
    record: &SettingsRecord,
    report: &mut F,
) -> Result<usize, BridgeError>
where
    R: WifiRadio,
    C: Clock,
    F: FnMut(Progress<'_>),
{
    state.handle_event(ConnectionEvent::WirelessAttachStarted);

    if let Err(e) = radio.disconnect().await {
        warn!("[WIFI] Disconnect failed: {:?}", e);
    }

    for (index, candidate) in record.candidates() {
        report(Progress::Status(Status::ConnectingToWifi));
        clock.delay_ms(config::WIFI_SETTLE_MS).await;

        if join_candidate(radio, clock, state, candidate, report).await {
            info!("[WIFI] Joined '{}' (slot {})", candidate.name, index);
            state.handle_event(ConnectionEvent::WirelessJoined { candidate: index });
            report(Progress::Status(Status::AccessPointConnected {
                mac: radio.mac_address(),
            }));
            return Ok(index);
        }
    }

    let error = classify_failure(radio, record).await;
    warn!("[WIFI] WiFi attach failed: {:?}", error);
    state.handle_event(ConnectionEvent::WirelessAttachFailed);
    report(Progress::Status(match error {
        BridgeError::NoNetworksFound => Status::NoAccessPointsFound,
        BridgeError::NoCandidateMatchesConfig => Status::NoAccessPointNamesMatch,
        _ => Status::AccessPointConnectFailed,
    }));
    Err(error)
}

async fn join_candidate<R, C, F>(
    radio: &mut R,
    clock: &C,
    state: &mut ConnectionState,
    candidate: &WifiCandidate,
    report: &mut F,
) -> bool
where
    R: WifiRadio,
    C: Clock,
    F: FnMut(Progress<'_>),
{
    info!("[WIFI] Connecting to WiFi network: {}", candidate.name);
    if let Err(e) = radio.begin(&candidate.name, &candidate.password).await {
        warn!("[WIFI] Join request for '{}' rejected: {:?}", candidate.name, e);
        return false;
    }

    state.reset_retry_count();
    while !radio.is_connected() && state.should_retry() {
        state.increment_retry();
        report(Progress::Status(Status::ConnectingToAccessPoint(&candidate.name)));
        clock.delay_ms(config::WIFI_POLL_INTERVAL_MS).await;
    }

    if radio.is_connected() {
        return true;
    }

    warn!(
        "[WIFI] Failed to connect to '{}' after {} attempts",
        candidate.name,
        state.retry_count()
    );
    if let Err(e) = radio.disconnect().await {
        warn!("[WIFI] Disconnect failed: {:?}", e);
    }
    false
}

/// Work out why no candidate could be joined.
async fn classify_failure<R: WifiRadio>(radio: &mut R, record: &SettingsRecord) -> BridgeError {
    let visible = match radio.scan().await {
        Ok(visible) => visible,
        Err(e) => {
            warn!("[WIFI] Scan failed: {:?}", e);
            return BridgeError::NoNetworksFound;
        }
    };

    if visible.is_empty() {
        return BridgeError::NoNetworksFound;
    }

    let has_candidates = record.candidates().next().is_some();
    if !has_candidates || !any_candidate_visible(record, &visible) {
        return BridgeError::NoCandidateMatchesConfig;
    }

    BridgeError::WirelessAttachFailed
}

fn any_candidate_visible(record: &SettingsRecord, visible: &[AccessPoint]) -> bool {
    record
        .candidates()
        .any(|(_, c)| visible.iter().any(|ap| ap.ssid.as_str() == c.name.as_str()))
}

#[cfg(feature = "firmware")]
pub mod esp {
    //! esp-wifi station driver

    use esp_wifi::wifi::{AuthMethod, ClientConfiguration, Configuration, WifiController};
    use heapless::{String, Vec};
    use log::{info, warn};

    use crate::config;
    use crate::platform::{AccessPoint, WifiRadio};

    /// WiFi radio backed by an esp-wifi controller
    pub struct EspWifiRadio<'a> {
        controller: WifiController<'a>,
        mac: [u8; 6],
    }

    impl<'a> EspWifiRadio<'a> {
        pub fn new(controller: WifiController<'a>, mac: [u8; 6]) -> Self {
            Self { controller, mac }
        }

        async fn ensure_started(&mut self) -> Result<(), esp_wifi::wifi::WifiError> {
            if !matches!(self.controller.is_started(), Ok(true)) {
                self.controller.start_async().await?;
                info!("[WIFI] WiFi started");
            }
            Ok(())
        }
    }

    impl WifiRadio for EspWifiRadio<'_> {
        type Error = esp_wifi::wifi::WifiError;

        async fn scan(&mut self) -> Result<Vec<AccessPoint, { config::MAX_SCAN_RESULTS }>, Self::Error> {
            self.ensure_started().await?;
            let found = self.controller.scan_n_async(config::MAX_SCAN_RESULTS).await?;

            let mut networks = Vec::new();
            for ap in found.iter() {
                let Ok(ssid) = String::try_from(ap.ssid.as_str()) else {
                    continue;
                };
                let open = matches!(ap.auth_method, None | Some(AuthMethod::None));
                let _ = networks.push(AccessPoint {
                    ssid,
                    channel: ap.channel,
                    rssi: ap.signal_strength,
                    open,
                });
            }
            Ok(networks)
        }

        async fn begin(&mut self, ssid: &str, password: &str) -> Result<(), Self::Error> {
            let client_config = ClientConfiguration {
                ssid: ssid.into(),
                password: password.into(),
                auth_method: if password.is_empty() {
                    AuthMethod::None
                } else {
                    AuthMethod::WPA2Personal
                },
                ..Default::default()
            };

            self.controller
                .set_configuration(&Configuration::Client(client_config))?;
            self.ensure_started().await?;

            // The join completes in the background; progress is polled.
            if let Err(e) = self.controller.connect() {
                warn!("[WIFI] Connect request failed: {:?}", e);
                return Err(e);
            }
            Ok(())
        }

        fn is_connected(&mut self) -> bool {
            self.controller.is_connected().unwrap_or(false)
        }

        async fn disconnect(&mut self) -> Result<(), Self::Error> {
            if self.is_connected() {
                self.controller.disconnect_async().await?;
                info!("[WIFI] Disconnected");
            }
            Ok(())
        }

        fn mac_address(&self) -> [u8; 6] {
            self.mac
        }
    }
}
