//! MQTT telemetry and commands.
//!
//! Topics under the configured prefix:
//!
//! | topic                   | dir | payload                      |
//! |-------------------------|-----|------------------------------|
//! | `<prefix>/status`       | out | retained JSON, every 30 s    |
//! | `<prefix>/pump`         | out | `ON` / `OFF` on transitions  |
//! | `<prefix>/alert`        | out | alert JSON                   |
//! | `<prefix>/override/set` | in  | `ON` / `OFF` / `AUTO`        |

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::night::{format_datetime, NightOracle};
use crate::state::{SharedState, StatusResponse};

/// Interval between retained status publications.
const STATUS_INTERVAL_SEC: u64 = 30;

/// Back-off after a connection error before polling again.
const RETRY_DELAY_SEC: u64 = 2;

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.prefix)
    }

    pub fn pump(&self) -> String {
        format!("{}/pump", self.prefix)
    }

    pub fn alert(&self) -> String {
        format!("{}/alert", self.prefix)
    }

    pub fn override_set(&self) -> String {
        format!("{}/override/set", self.prefix)
    }
}

/// Parse an override command.  `ON`/`OFF` pin the pump, `AUTO` hands it back
/// to the schedule (`None`).  Case-insensitive, trims whitespace.
pub(crate) fn parse_override_command(payload: &[u8]) -> Result<Option<bool>, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "ON" => Ok(Some(true)),
        "OFF" => Ok(Some(false)),
        "AUTO" => Ok(None),
        _ => Err(format!("unknown override command '{s}'")),
    }
}

/// Compact status published on `<prefix>/status`.
#[derive(Debug, Serialize)]
pub(crate) struct StatusMsg<'a> {
    pub(crate) system: &'a str,
    pub(crate) temperature_c: f32,
    pub(crate) pump_on: bool,
    pub(crate) override_active: bool,
    pub(crate) night: bool,
    pub(crate) runtime_secs: u64,
    pub(crate) flow_lpm: Option<f32>,
    pub(crate) total_litres: Option<f64>,
    pub(crate) flow_fault: bool,
    pub(crate) datetime: &'a str,
}

impl<'a> StatusMsg<'a> {
    pub(crate) fn from_status(st: &'a StatusResponse) -> Self {
        Self {
            system: &st.system_name,
            temperature_c: st.temperature_c,
            pump_on: st.pump_on,
            override_active: st.override_active,
            night: st.night,
            runtime_secs: st.runtime_secs,
            flow_lpm: st.flow.as_ref().and_then(|f| f.rate_lpm),
            total_litres: st.flow.as_ref().map(|f| f.total_litres),
            flow_fault: st.flow.as_ref().is_some_and(|f| f.fault_active),
            datetime: &st.datetime,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub fn connect(cfg: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(30));
    AsyncClient::new(options, 20)
}

/// Drive the MQTT event loop and handle override commands.  Intended to be
/// `tokio::spawn`-ed from main.
pub async fn run(mut eventloop: EventLoop, client: AsyncClient, topics: Topics, shared: SharedState) {
    let override_topic = topics.override_set();
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if p.topic != override_topic {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                }
                match parse_override_command(&p.payload) {
                    Ok(command) => {
                        info!(?command, "override command via mqtt");
                        let mut st = shared.write().await;
                        match command {
                            Some(pump_on) => st.set_override(true, pump_on),
                            None => st.set_override(false, false),
                        };
                    }
                    Err(msg) => {
                        warn!("{msg} (use ON/OFF/AUTO)");
                        let mut st = shared.write().await;
                        st.record_error(msg);
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                if let Err(e) = client.try_subscribe(override_topic.clone(), QoS::AtLeastOnce) {
                    error!("mqtt subscribe failed: {e}");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    if st.mqtt_connected {
                        st.record_error(format!("mqtt error: {e}"));
                    }
                    st.mqtt_connected = false;
                }
                sleep(Duration::from_secs(RETRY_DELAY_SEC)).await;
            }
        }
    }
}

/// Publish the retained status message every 30 s.
pub async fn publish_status(
    client: AsyncClient,
    topics: Topics,
    shared: SharedState,
    oracle: Arc<NightOracle>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_SEC));
    loop {
        ticker.tick().await;

        let payload = {
            let st = shared.read().await;
            if !st.mqtt_connected {
                continue;
            }
            let status = st.to_status(oracle.is_night(), format_datetime(oracle.local_now()));
            serde_json::to_vec(&StatusMsg::from_status(&status))
        };
        let payload = match payload {
            Ok(p) => p,
            Err(e) => {
                error!("encode status: {e}");
                continue;
            }
        };
        if let Err(e) = client
            .publish(topics.status(), QoS::AtLeastOnce, true, payload)
            .await
        {
            warn!("status publish failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
