use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::{mpsc, RwLock};

use hydro_core::{Clock, ControlEvent, Controller, Cycle, FlowStatus, LightState, Transition};

use crate::probe::ProbeStatus;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub controller: Controller,
    pub probe: ProbeStatus,
    pub events: VecDeque<SystemEvent>,
    clock: Arc<dyn Clock>,
    outbox: Option<mpsc::UnboundedSender<ControlEvent>>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Pump,
    Flow,
    Light,
    Settings,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub system_name: String,
    pub temperature_c: f32,
    pub sensor_ok: bool,
    pub pump_on: bool,
    pub override_active: bool,
    pub night: bool,
    pub continuous_mode: bool,
    pub cycle: Option<Cycle>,
    pub runtime_secs: u64,
    pub runtime: String,
    pub flow_enabled: bool,
    pub flow: Option<FlowStatus>,
    pub lighting_enabled: bool,
    pub light: Option<LightState>,
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub datetime: String,
    pub events: Vec<SystemEvent>,
}

/// `HH:MM:SS`, or `N days, HH:MM:SS` once past a day.
pub fn format_runtime(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if days > 0 {
        format!("{days} days, {hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(controller: Controller, probe: ProbeStatus, clock: Arc<dyn Clock>) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            controller,
            probe,
            events: VecDeque::with_capacity(MAX_EVENTS),
            clock,
            outbox: None,
        }
    }

    /// Forward every control event to `outbox` as well as the ring buffer.
    pub fn with_outbox(mut self, outbox: mpsc::UnboundedSender<ControlEvent>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Record control events for the UI and hand them to the notifier.
    pub fn dispatch(&mut self, events: Vec<ControlEvent>) {
        for event in events {
            let (kind, detail) = describe(&event);
            self.push_event(kind, detail);
            if let Some(outbox) = &self.outbox {
                // Receiver gone means the service is shutting down.
                let _ = outbox.send(event);
            }
        }
    }

    /// Manual pump override, shared by the HTTP API and MQTT commands.
    pub fn set_override(&mut self, active: bool, pump_on: bool) -> Option<Transition> {
        let now = self.clock.now();
        let transition = self.controller.set_override(active, pump_on, now);
        let detail = if active {
            format!("manual override {}", if pump_on { "ON" } else { "OFF" })
        } else {
            "manual override cleared".to_string()
        };
        self.push_event(EventKind::Pump, detail);
        if let Some(t) = transition {
            self.dispatch(vec![ControlEvent::Pump(t)]);
        }
        transition
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn record_settings(&mut self, detail: String) {
        self.push_event(EventKind::Settings, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, night: bool, datetime: String) -> StatusResponse {
        let now = self.clock.now();
        let status = self.controller.status(now);
        let runtime_secs = status.runtime_ms / 1000;
        StatusResponse {
            system_name: self.controller.settings().system_name.clone(),
            temperature_c: self.probe.temperature_c,
            sensor_ok: self.probe.sensor_ok,
            pump_on: status.pump.relay_on,
            override_active: status.pump.manual_override_active,
            night,
            continuous_mode: status.continuous_mode,
            cycle: status.cycle,
            runtime_secs,
            runtime: format_runtime(runtime_secs),
            flow_enabled: self.controller.flow_enabled(),
            flow: status.flow,
            lighting_enabled: self.controller.lighting_enabled(),
            light: status.light,
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            datetime,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

fn describe(event: &ControlEvent) -> (EventKind, String) {
    match event {
        ControlEvent::CycleChanged(Cycle::Continuous) => {
            (EventKind::Pump, "continuous mode".to_string())
        }
        ControlEvent::CycleChanged(Cycle::Interval {
            band,
            on_secs,
            off_secs,
        }) => (
            EventKind::Pump,
            format!("cycle {band:?}: {on_secs}s on / {off_secs}s off"),
        ),
        ControlEvent::Pump(t) if t.on => {
            (EventKind::Pump, format!("pump ON ({})", t.cause.as_str()))
        }
        ControlEvent::Pump(t) => (
            EventKind::Pump,
            format!(
                "pump OFF ({}) after {}s",
                t.cause.as_str(),
                t.ran_ms.unwrap_or(0) / 1000
            ),
        ),
        ControlEvent::FlowFault { rate_lpm, alert } => {
            let rate = rate_lpm.map_or("unknown".to_string(), |r| format!("{r:.2} L/min"));
            let alert = match alert {
                Some(true) => ", alert sent",
                Some(false) => ", alert suppressed",
                None => "",
            };
            (EventKind::Flow, format!("no water flow ({rate}){alert}"))
        }
        ControlEvent::FlowRecovered => (EventKind::Flow, "flow restored".to_string()),
        ControlEvent::Light { brightness } => {
            (EventKind::Light, format!("grow light {brightness}"))
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use hydro_core::clock::ManualClock;
    use hydro_core::{Relay, SwitchCause, SystemSettings};

    struct NullRelay;

    impl Relay for NullRelay {
        fn set(&self, _on: bool) {}
    }

    fn state() -> (Arc<ManualClock>, SystemState) {
        let clock = Arc::new(ManualClock::starting_at(0));
        let controller = Controller::new(SystemSettings::default(), Arc::new(NullRelay), 0);
        let probe = ProbeStatus {
            temperature_c: 21.5,
            sensor_ok: true,
            last_error: None,
        };
        (clock.clone(), SystemState::new(controller, probe, clock))
    }

    // -- format_runtime -----------------------------------------------------

    #[test]
    fn runtime_under_a_day() {
        assert_eq!(format_runtime(0), "00:00:00");
        assert_eq!(format_runtime(3_725), "01:02:05");
        assert_eq!(format_runtime(86_399), "23:59:59");
    }

    #[test]
    fn runtime_with_days() {
        assert_eq!(format_runtime(86_400), "1 days, 00:00:00");
        assert_eq!(format_runtime(2 * 86_400 + 61), "2 days, 00:01:01");
    }

    // -- Event ring ---------------------------------------------------------

    #[test]
    fn ring_buffer_is_bounded() {
        let (_clock, mut st) = state();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn dispatch_records_and_forwards() {
        let (_clock, st) = state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut st = st.with_outbox(tx);

        st.dispatch(vec![
            ControlEvent::Pump(Transition {
                on: false,
                at: 5_000,
                cause: SwitchCause::Auto,
                ran_ms: Some(120_000),
            }),
            ControlEvent::FlowRecovered,
        ]);

        assert_eq!(st.events.len(), 2);
        assert_eq!(st.events[0].kind, EventKind::Pump);
        assert_eq!(st.events[0].detail, "pump OFF (auto) after 120s");
        assert_eq!(st.events[1].kind, EventKind::Flow);
        assert!(matches!(rx.try_recv(), Ok(ControlEvent::Pump(_))));
        assert_eq!(rx.try_recv(), Ok(ControlEvent::FlowRecovered));
    }

    #[test]
    fn dispatch_without_outbox_only_records() {
        let (_clock, mut st) = state();
        st.dispatch(vec![ControlEvent::Light { brightness: 200 }]);
        assert_eq!(st.events[0].detail, "grow light 200");
    }

    // -- Override -----------------------------------------------------------

    #[test]
    fn override_switches_pump_and_forwards_transition() {
        let (clock, st) = state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut st = st.with_outbox(tx);

        clock.set(1_000);
        let t = st.set_override(true, true).unwrap();
        assert!(t.on);
        assert_eq!(t.cause, SwitchCause::Override);
        assert!(st.controller.pump_state().manual_override_active);
        assert!(matches!(rx.try_recv(), Ok(ControlEvent::Pump(p)) if p.on));

        clock.set(61_000);
        let t = st.set_override(true, false).unwrap();
        assert!(!t.on);
        assert_eq!(t.ran_ms, Some(60_000));

        // Clearing leaves the relay where it is.
        assert_eq!(st.set_override(false, false), None);
        assert_eq!(st.events.back().unwrap().detail, "manual override cleared");
    }

    // -- Status -------------------------------------------------------------

    #[test]
    fn status_snapshot() {
        let (_clock, mut st) = state();
        st.record_system("first".to_string());
        st.record_system("second".to_string());
        let status = st.to_status(true, "01-01-2025 00:00:00".to_string());
        assert_eq!(status.system_name, "Hydro System 1");
        assert_eq!(status.temperature_c, 21.5);
        assert!(!status.pump_on);
        assert!(status.night);
        assert!(!status.flow_enabled);
        assert_eq!(status.runtime, "00:00:00");
        // Most recent first.
        assert_eq!(status.events[0].detail, "second");
    }
}
