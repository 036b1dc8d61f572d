//! Alert dispatcher: rate-limits alerts from the controller and hands them to
//! an async transport.
//!
//! Policy:
//! - nothing is sent during the first two minutes after start-up,
//! - at least five minutes between accepted alerts,
//! - a disabled dispatcher refuses everything except the test alert.
//!
//! `notify` is called synchronously from the control loop, so it only checks
//! the policy and queues; [`run_transport`] does the slow part.

use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{info, warn};

use hydro_core::clock::{elapsed, Clock, Millis};
use hydro_core::AlertSender;

use crate::mqtt::Topics;

/// Quiet period after start-up.
pub const STARTUP_DELAY_MS: Millis = 2 * 60 * 1000;

/// Minimum spacing between accepted alerts.
pub const MIN_ALERT_INTERVAL_MS: Millis = 5 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub subject: String,
    pub body: String,
    pub test: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertStatus {
    pub enabled: bool,
    pub last_error: Option<String>,
    pub secs_since_last_alert: Option<u32>,
    pub can_send: bool,
}

struct PolicyState {
    last_sent: Option<Millis>,
    last_error: Option<String>,
}

pub struct AlertDispatcher {
    enabled: bool,
    clock: Arc<dyn Clock>,
    started_at: Millis,
    state: Mutex<PolicyState>,
    queue: mpsc::UnboundedSender<Alert>,
}

impl AlertDispatcher {
    /// Returns the dispatcher and the receiving end for [`run_transport`].
    pub fn new(enabled: bool, clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (queue, rx) = mpsc::unbounded_channel();
        let started_at = clock.now();
        let dispatcher = Self {
            enabled,
            clock,
            started_at,
            state: Mutex::new(PolicyState {
                last_sent: None,
                last_error: None,
            }),
            queue,
        };
        (dispatcher, rx)
    }

    fn state(&self) -> MutexGuard<'_, PolicyState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Why an alert would be refused right now, if it would.
    fn refusal(&self, now: Millis, state: &PolicyState) -> Option<String> {
        if !self.enabled {
            return Some("alerts disabled".to_string());
        }
        let up = elapsed(now, self.started_at);
        if up < STARTUP_DELAY_MS {
            return Some(format!(
                "start-up delay, {} s remaining",
                (STARTUP_DELAY_MS - up) / 1000
            ));
        }
        if let Some(last) = state.last_sent {
            let since = elapsed(now, last);
            if since < MIN_ALERT_INTERVAL_MS {
                return Some(format!(
                    "last alert {} s ago, minimum interval {} s",
                    since / 1000,
                    MIN_ALERT_INTERVAL_MS / 1000
                ));
            }
        }
        None
    }

    fn enqueue(&self, alert: Alert) -> bool {
        match self.queue.send(alert) {
            Ok(()) => true,
            Err(_) => {
                self.record_error("alert transport stopped".to_string());
                false
            }
        }
    }

    /// Queue a test alert, bypassing the policy.  Does not count as a sent
    /// alert for the cooldown.
    pub fn send_test(&self, system_name: &str) -> bool {
        self.enqueue(Alert {
            subject: format!("Test alert - {system_name}"),
            body: "This is a test alert from the hydroponics controller.\n\
                   If you received it, alert delivery is working."
                .to_string(),
            test: true,
        })
    }

    pub fn record_error(&self, error: String) {
        self.state().last_error = Some(error);
    }

    pub fn status(&self) -> AlertStatus {
        let now = self.clock.now();
        let state = self.state();
        AlertStatus {
            enabled: self.enabled,
            last_error: state.last_error.clone(),
            secs_since_last_alert: state.last_sent.map(|t| elapsed(now, t) / 1000),
            can_send: self.refusal(now, &state).is_none(),
        }
    }
}

impl AlertSender for AlertDispatcher {
    fn notify(&self, subject: &str, body: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.state();
        if let Some(reason) = self.refusal(now, &state) {
            info!(subject, %reason, "alert not sent");
            state.last_error = Some(reason);
            return false;
        }
        state.last_sent = Some(now);
        drop(state);

        self.enqueue(Alert {
            subject: subject.to_string(),
            body: body.to_string(),
            test: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Deliver queued alerts: always logged, and published to `<prefix>/alert`
/// when an MQTT client is given.  Intended to be `tokio::spawn`-ed; ends once
/// the dispatcher is dropped and the queue is drained.
pub async fn run_transport(
    mut rx: mpsc::UnboundedReceiver<Alert>,
    dispatcher: Weak<AlertDispatcher>,
    mqtt: Option<(AsyncClient, Topics)>,
) {
    while let Some(alert) = rx.recv().await {
        warn!(subject = %alert.subject, test = alert.test, "ALERT\n{}", alert.body);

        let Some((client, topics)) = &mqtt else {
            continue;
        };
        let result = match serde_json::to_vec(&alert) {
            Ok(payload) => client
                .publish(topics.alert(), QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| format!("alert publish failed: {e}")),
            Err(e) => Err(format!("encode alert: {e}")),
        };
        if let Err(msg) = result {
            warn!("{msg}");
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.record_error(msg);
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
