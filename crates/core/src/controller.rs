//! Top-level control context.
//!
//! [`Controller`] owns the pump driver and the optional flow and lighting
//! subsystems, holds the active settings and talks to hardware only through
//! the traits in [`crate::ports`].  The service calls [`Controller::tick`]
//! from one loop; everything here is synchronous and non-blocking.
//!
//! Flow monitoring, alerting and lighting are attached with the `with_*`
//! builder methods.  A controller built without them simply skips those
//! steps.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Millis;
use crate::cycle::{select_cycle, Cycle};
use crate::fault::{FaultStatus, FlowCheck, FlowFaultDetector};
use crate::flow::{FlowEstimator, PulseCounter, SAMPLE_WINDOW_MS};
use crate::lighting::{LightController, LightState};
use crate::ports::{AlertSender, LightOutput, Relay};
use crate::pump::{PumpCycleDriver, PumpCycleState, Transition};
use crate::settings::SystemSettings;

/// Readings gathered by the service before each tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inputs {
    pub temperature_c: f32,
    pub is_night: bool,
    /// Local wall-clock hour, `None` while the clock is not set.
    pub local_hour: Option<u8>,
}

/// Something the service may want to log, publish or persist.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// The selected duty cycle changed band or mode.
    CycleChanged(Cycle),
    Pump(Transition),
    FlowFault {
        rate_lpm: Option<f32>,
        /// `Some(accepted)` when an alert was offered to the sender.
        alert: Option<bool>,
    },
    FlowRecovered,
    Light {
        brightness: u8,
    },
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowStatus {
    pub rate_lpm: Option<f32>,
    pub total_litres: f64,
    pub total_pulses: u64,
    pub fault_active: bool,
    pub no_flow_detected: bool,
    pub since_last_pulse_ms: Option<Millis>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub temperature_c: f32,
    pub is_night: bool,
    pub continuous_mode: bool,
    pub cycle: Option<Cycle>,
    pub pump: PumpCycleState,
    pub pump_on_for_ms: Option<Millis>,
    pub runtime_ms: u64,
    pub flow: Option<FlowStatus>,
    pub light: Option<LightState>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct FlowSubsystem {
    estimator: FlowEstimator,
    detector: FlowFaultDetector,
}

struct LightingSubsystem {
    controller: LightController,
    output: Arc<dyn LightOutput>,
}

pub struct Controller {
    settings: SystemSettings,
    relay: Arc<dyn Relay>,
    pump: PumpCycleDriver,
    flow: Option<FlowSubsystem>,
    alerts: Option<Arc<dyn AlertSender>>,
    lighting: Option<LightingSubsystem>,
    last_inputs: Option<Inputs>,
}

impl Controller {
    /// New controller with the pump OFF.  `settings` are clamped before use.
    pub fn new(settings: SystemSettings, relay: Arc<dyn Relay>, now: Millis) -> Self {
        Self {
            settings: settings.sanitized(),
            relay,
            pump: PumpCycleDriver::new(now),
            flow: None,
            alerts: None,
            lighting: None,
            last_inputs: None,
        }
    }

    /// Enable flow monitoring fed by `counter`.
    pub fn with_flow(mut self, counter: Arc<PulseCounter>, now: Millis) -> Self {
        self.flow = Some(FlowSubsystem {
            estimator: FlowEstimator::new(counter, SAMPLE_WINDOW_MS, now),
            detector: FlowFaultDetector::new(),
        });
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSender>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_lighting(mut self, output: Arc<dyn LightOutput>) -> Self {
        self.lighting = Some(LightingSubsystem {
            controller: LightController::new(),
            output,
        });
        self
    }

    // -- Accessors ----------------------------------------------------------

    pub fn settings(&self) -> &SystemSettings {
        &self.settings
    }

    pub fn pump_state(&self) -> PumpCycleState {
        self.pump.state()
    }

    pub fn flow_enabled(&self) -> bool {
        self.flow.is_some()
    }

    pub fn lighting_enabled(&self) -> bool {
        self.lighting.is_some()
    }

    pub fn flow_status(&self, now: Millis) -> Option<FlowStatus> {
        self.flow.as_ref().map(|f| FlowStatus {
            rate_lpm: f.estimator.current_rate_lpm(),
            total_litres: f.estimator.total_litres(),
            total_pulses: f.estimator.total_pulses(),
            fault_active: f.detector.fault_active(),
            no_flow_detected: f.detector.no_flow_detected(),
            since_last_pulse_ms: f.estimator.since_last_pulse(now),
        })
    }

    pub fn light_state(&self) -> Option<LightState> {
        self.lighting.as_ref().map(|l| l.controller.state())
    }

    pub fn status(&self, now: Millis) -> ControllerStatus {
        let inputs = self.last_inputs;
        ControllerStatus {
            temperature_c: inputs.map_or(f32::NAN, |i| i.temperature_c),
            is_night: inputs.is_some_and(|i| i.is_night),
            continuous_mode: self.settings.continuous_mode,
            cycle: self.pump.cycle(),
            pump: self.pump.state(),
            pump_on_for_ms: self.pump.on_for(now),
            runtime_ms: self.pump.runtime_ms(now),
            flow: self.flow_status(now),
            light: self.light_state(),
        }
    }

    // -- Control ------------------------------------------------------------

    /// One pass of the control loop: select the cycle, drive the pump,
    /// sample flow, judge faults and follow the light schedule.
    pub fn tick(&mut self, now: Millis, inputs: Inputs) -> Vec<ControlEvent> {
        let mut events = Vec::new();
        self.last_inputs = Some(inputs);

        let cycle = select_cycle(
            inputs.temperature_c,
            inputs.is_night,
            self.settings.continuous_mode,
            &self.settings,
        );
        if self.pump.cycle() != Some(cycle) {
            info!(
                cycle = ?cycle,
                temperature_c = inputs.temperature_c,
                night = inputs.is_night,
                "duty cycle selected"
            );
            events.push(ControlEvent::CycleChanged(cycle));
        }

        if let Some(t) = self.pump.tick(now, cycle) {
            self.apply_transition(t);
            events.push(ControlEvent::Pump(t));
        }

        self.check_flow(now, inputs.temperature_c, &mut events);

        if let Some(light) = self.lighting.as_mut() {
            if let Some(brightness) = light.controller.update(inputs.local_hour, &self.settings) {
                light.output.set_brightness(brightness);
                info!(brightness, "grow light scheduled");
                events.push(ControlEvent::Light { brightness });
            }
        }

        events
    }

    /// Enter or leave manual pump override.
    pub fn set_override(&mut self, active: bool, value: bool, now: Millis) -> Option<Transition> {
        let transition = self.pump.set_override(active, value, now);
        if let Some(t) = transition {
            self.apply_transition(t);
        }
        if active {
            info!(pump_on = value, "manual override active");
        } else {
            info!("manual override cleared, automatic control resumes");
        }
        transition
    }

    /// Zero flow totals.  A fault in progress stays active.  Returns `false`
    /// when flow monitoring is not enabled.
    pub fn reset_flow(&mut self, now: Millis) -> bool {
        match self.flow.as_mut() {
            Some(flow) => {
                flow.estimator.reset(now);
                info!("flow counters reset");
                true
            }
            None => false,
        }
    }

    /// Replace the active settings.  The caller validates; values are
    /// clamped here regardless.
    pub fn apply_settings(&mut self, settings: SystemSettings) {
        self.settings = settings.sanitized();
        debug!(name = %self.settings.system_name, "settings applied");
    }

    /// Pin the grow light or hand it back to the schedule.  Returns the new
    /// brightness if the output changed, `None` if it did not or lighting is
    /// not enabled.
    pub fn set_light_override(&mut self, active: bool, brightness: u8) -> Option<u8> {
        let hour = self.last_inputs.and_then(|i| i.local_hour);
        let light = self.lighting.as_mut()?;
        let changed = light
            .controller
            .set_override(active, brightness, hour, &self.settings);
        if let Some(level) = changed {
            light.output.set_brightness(level);
        }
        info!(active, brightness, "grow light override");
        changed
    }

    // -- Internals ----------------------------------------------------------

    fn apply_transition(&self, t: Transition) {
        self.relay.set(t.on);
        match t.ran_ms {
            Some(ran_ms) => info!(cause = t.cause.as_str(), ran_ms, "pump OFF"),
            None => info!(cause = t.cause.as_str(), "pump ON"),
        }
    }

    fn check_flow(&mut self, now: Millis, temperature_c: f32, events: &mut Vec<ControlEvent>) {
        let Some(flow) = self.flow.as_mut() else {
            return;
        };

        if let Some(sample) = flow.estimator.sample(now, self.settings.pulses_per_litre) {
            debug!(
                pulses = sample.pulses,
                rate_lpm = sample.rate_lpm,
                total_litres = flow.estimator.total_litres(),
                "flow sample"
            );
        }

        let rate = flow.estimator.current_rate_lpm();
        let check = FlowCheck::new(
            self.pump.on_for(now),
            self.pump.override_active(),
            rate,
            flow.estimator.since_last_pulse(now),
            &self.settings,
        );

        match flow.detector.evaluate(&check) {
            FaultStatus::Triggered => {
                warn!(
                    rate_lpm = ?rate,
                    min_flow_lpm = self.settings.min_flow_lpm,
                    "no water flow while pump is running"
                );
                let alert = match (&self.alerts, self.settings.flow_alert_enabled) {
                    (Some(sender), true) => {
                        let (subject, body) = flow_alert_message(&self.settings, temperature_c, rate);
                        Some(sender.notify(&subject, &body))
                    }
                    _ => None,
                };
                events.push(ControlEvent::FlowFault {
                    rate_lpm: rate,
                    alert,
                });
            }
            FaultStatus::Resolved => {
                info!(rate_lpm = ?rate, "flow fault cleared");
                events.push(ControlEvent::FlowRecovered);
            }
            FaultStatus::Normal | FaultStatus::Active => {}
        }
    }
}

/// Subject and body of the stalled-flow alert.
pub fn flow_alert_message(
    settings: &SystemSettings,
    temperature_c: f32,
    rate_lpm: Option<f32>,
) -> (String, String) {
    let subject = format!("WARNING: no water flow in {}", settings.system_name);
    let body = format!(
        "No water flow detected while the pump is running.\n\
         \n\
         Measured flow: {:.2} L/min (minimum {:.2} L/min)\n\
         Water temperature: {:.1} °C\n\
         \n\
         Check for:\n\
         - blocked lines\n\
         - air in the system\n\
         - a failed pump\n\
         - an empty reservoir\n",
        rate_lpm.unwrap_or(0.0),
        settings.min_flow_lpm,
        temperature_c,
    );
    (subject, body)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::Band;
    use crate::ports::recording::{RecordingAlerts, RecordingLight, RecordingRelay};

    const DAY: Inputs = Inputs {
        temperature_c: 20.0,
        is_night: false,
        local_hour: Some(12),
    };

    struct Rig {
        relay: Arc<RecordingRelay>,
        alerts: Arc<RecordingAlerts>,
        light: Arc<RecordingLight>,
        counter: Arc<PulseCounter>,
        ctl: Controller,
    }

    fn rig(settings: SystemSettings) -> Rig {
        let relay = Arc::new(RecordingRelay::default());
        let alerts = Arc::new(RecordingAlerts::default());
        let light = Arc::new(RecordingLight::default());
        let counter = Arc::new(PulseCounter::new());
        let ctl = Controller::new(settings, relay.clone(), 0)
            .with_flow(Arc::clone(&counter), 0)
            .with_alerts(alerts.clone())
            .with_lighting(light.clone());
        Rig {
            relay,
            alerts,
            light,
            counter,
            ctl,
        }
    }

    /// Tick every 250 ms from `from` (exclusive) to `to` (inclusive),
    /// feeding `pulses_per_tick` pulses before each tick while the relay is
    /// on.
    fn run(rig: &mut Rig, from: Millis, to: Millis, pulses_per_tick: u32) -> Vec<ControlEvent> {
        let mut events = Vec::new();
        let mut now = from;
        while now < to {
            now += 250;
            if rig.ctl.pump_state().relay_on {
                for _ in 0..pulses_per_tick {
                    rig.counter.on_interrupt(now);
                }
            }
            events.extend(rig.ctl.tick(now, DAY));
        }
        events
    }

    fn relay_calls(rig: &Rig) -> Vec<bool> {
        rig.relay.calls.lock().unwrap().clone()
    }

    // -- Pump driving -------------------------------------------------------

    #[test]
    fn relay_called_once_per_transition() {
        let mut r = rig(SystemSettings::default());
        run(&mut r, 0, 1_000_000, 10);
        // Mid band: ON at 780 s, OFF at 900 s.
        assert_eq!(relay_calls(&r), vec![true, false]);
    }

    #[test]
    fn first_tick_reports_cycle() {
        let mut r = rig(SystemSettings::default());
        let events = r.ctl.tick(1, DAY);
        assert_eq!(
            events[0],
            ControlEvent::CycleChanged(Cycle::Interval {
                band: Band::Mid,
                on_secs: 120,
                off_secs: 780
            })
        );
        assert!(r.ctl.tick(2, DAY).is_empty());
    }

    #[test]
    fn cycle_change_reported_on_night() {
        let mut r = rig(SystemSettings::default());
        r.ctl.tick(1, DAY);
        let night = Inputs {
            is_night: true,
            ..DAY
        };
        let events = r.ctl.tick(2, night);
        assert!(matches!(
            events[0],
            ControlEvent::CycleChanged(Cycle::Interval {
                band: Band::Night,
                ..
            })
        ));
    }

    #[test]
    fn override_drives_relay_and_freezes_cycle() {
        let mut r = rig(SystemSettings::default());
        let t = r.ctl.set_override(true, true, 10).expect("switch on");
        assert!(t.on);
        run(&mut r, 10, 2_000_000, 10);
        assert_eq!(relay_calls(&r), vec![true]);
        assert!(r.ctl.pump_state().manual_override_active);
    }

    #[test]
    fn zero_durations_are_clamped() {
        let settings = SystemSettings {
            mid: crate::settings::BandCycle::new(0, 0),
            ..SystemSettings::default()
        };
        let mut r = rig(settings);
        assert_eq!(r.ctl.settings().mid.on_secs, 1);
        run(&mut r, 0, 5_000, 10);
        assert!(relay_calls(&r).len() >= 2);
    }

    // -- Flow ---------------------------------------------------------------

    #[test]
    fn healthy_flow_never_faults() {
        let mut r = rig(SystemSettings::default());
        // 2 pulses per 250 ms = 8 Hz ≈ 1.07 L/min at 450 pulses/L.
        let events = run(&mut r, 0, 1_000_000, 2);
        assert!(!events
            .iter()
            .any(|e| matches!(e, ControlEvent::FlowFault { .. })));
        assert!(r.alerts.sent.lock().unwrap().is_empty());
        let flow = r.ctl.flow_status(1_000_000).unwrap();
        assert!(flow.total_litres > 1.0);
    }

    #[test]
    fn dry_run_alerts_exactly_once() {
        let mut r = rig(SystemSettings::default());
        let events = run(&mut r, 0, 899_000, 0);
        let faults = events
            .iter()
            .filter(|e| matches!(e, ControlEvent::FlowFault { .. }))
            .count();
        assert_eq!(faults, 1);

        let sent = r.alerts.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.contains("Hydro System 1"));
        assert!(r.ctl.flow_status(899_000).unwrap().fault_active);
    }

    #[test]
    fn dry_run_fault_waits_for_priming_grace() {
        let mut r = rig(SystemSettings::default());
        // Pump comes on at 780 s; no pulse has ever been seen.
        run(&mut r, 0, 785_000, 0);
        assert!(!r.ctl.flow_status(785_000).unwrap().fault_active);
        run(&mut r, 785_000, 785_250, 0);
        assert!(r.ctl.flow_status(785_250).unwrap().fault_active);
    }

    #[test]
    fn flow_stopping_mid_run_faults_after_silence() {
        let mut r = rig(SystemSettings::default());
        run(&mut r, 0, 800_000, 2);
        // Pulses stop at 800 s; the next empty window closes at 801 s but
        // the last pulse is still recent.
        run(&mut r, 800_000, 810_000, 0);
        assert!(!r.ctl.flow_status(810_000).unwrap().fault_active);
        run(&mut r, 810_000, 811_000, 0);
        assert!(r.ctl.flow_status(811_000).unwrap().fault_active);
    }

    #[test]
    fn fault_clears_when_pump_stops() {
        let mut r = rig(SystemSettings::default());
        let events = run(&mut r, 0, 901_000, 0);
        assert!(events.contains(&ControlEvent::FlowRecovered));
        assert!(!r.ctl.flow_status(901_000).unwrap().fault_active);
    }

    #[test]
    fn alert_suppressed_when_disabled() {
        let settings = SystemSettings {
            flow_alert_enabled: false,
            ..SystemSettings::default()
        };
        let mut r = rig(settings);
        let events = run(&mut r, 0, 899_000, 0);
        assert!(events.contains(&ControlEvent::FlowFault {
            rate_lpm: Some(0.0),
            alert: None
        }));
        assert!(r.alerts.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn reset_flow_zeroes_totals() {
        let mut r = rig(SystemSettings::default());
        run(&mut r, 0, 850_000, 2);
        assert!(r.ctl.reset_flow(850_000));
        let flow = r.ctl.flow_status(850_000).unwrap();
        assert_eq!(flow.total_litres, 0.0);
        assert_eq!(flow.rate_lpm, None);
    }

    #[test]
    fn reset_during_fault_keeps_episode() {
        let mut r = rig(SystemSettings::default());
        run(&mut r, 0, 800_000, 0);
        assert_eq!(r.alerts.sent.lock().unwrap().len(), 1);

        assert!(r.ctl.reset_flow(800_000));
        assert!(r.ctl.flow_status(800_000).unwrap().fault_active);
        let events = run(&mut r, 800_000, 803_000, 0);
        assert!(!events.contains(&ControlEvent::FlowRecovered));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ControlEvent::FlowFault { .. })));
        assert_eq!(r.alerts.sent.lock().unwrap().len(), 1);
        assert!(r.ctl.flow_status(803_000).unwrap().fault_active);
    }

    #[test]
    fn trickle_during_dry_run_alerts_once() {
        let mut r = rig(SystemSettings::default());
        let mut events = run(&mut r, 0, 790_000, 0);
        // One drip every 15 s through the rest of the ON interval.
        let mut now = 790_000;
        while now + 15_000 < 900_000 {
            let next = now + 15_000;
            events.extend(run(&mut r, now, next - 250, 0));
            r.counter.on_interrupt(next - 100);
            events.extend(run(&mut r, next - 250, next, 0));
            now = next;
        }
        let faults = events
            .iter()
            .filter(|e| matches!(e, ControlEvent::FlowFault { .. }))
            .count();
        assert_eq!(faults, 1);
        assert!(!events.contains(&ControlEvent::FlowRecovered));
        assert_eq!(r.alerts.sent.lock().unwrap().len(), 1);
        assert!(r.ctl.flow_status(now).unwrap().fault_active);
    }

    #[test]
    fn controller_without_flow_skips_monitoring() {
        let relay = Arc::new(RecordingRelay::default());
        let mut ctl = Controller::new(SystemSettings::default(), relay, 0);
        assert!(!ctl.flow_enabled());
        assert!(!ctl.reset_flow(0));
        assert_eq!(ctl.flow_status(0), None);
        ctl.tick(800_000, DAY);
        assert!(ctl.pump_state().relay_on);
    }

    // -- Lighting -----------------------------------------------------------

    #[test]
    fn light_follows_schedule() {
        let mut r = rig(SystemSettings::default());
        let events = r.ctl.tick(1, DAY);
        assert!(events.contains(&ControlEvent::Light { brightness: 200 }));
        let evening = Inputs {
            local_hour: Some(22),
            ..DAY
        };
        r.ctl.tick(2, evening);
        assert_eq!(*r.light.levels.lock().unwrap(), vec![200, 0]);
    }

    #[test]
    fn light_override_sets_output() {
        let mut r = rig(SystemSettings::default());
        r.ctl.tick(1, DAY);
        assert_eq!(r.ctl.set_light_override(true, 50), Some(50));
        r.ctl.tick(2, DAY);
        assert_eq!(r.ctl.set_light_override(false, 0), Some(200));
        assert_eq!(*r.light.levels.lock().unwrap(), vec![200, 50, 200]);
    }

    // -- Settings and status ------------------------------------------------

    #[test]
    fn apply_settings_switches_to_continuous() {
        let mut r = rig(SystemSettings::default());
        r.ctl.tick(1, DAY);
        r.ctl.apply_settings(SystemSettings {
            continuous_mode: true,
            ..SystemSettings::default()
        });
        let events = r.ctl.tick(2, DAY);
        assert!(events.contains(&ControlEvent::CycleChanged(Cycle::Continuous)));
        assert!(r.ctl.pump_state().relay_on);
    }

    #[test]
    fn status_reports_runtime() {
        let mut r = rig(SystemSettings::default());
        run(&mut r, 0, 800_000, 2);
        let st = r.ctl.status(800_000);
        assert!(st.pump.relay_on);
        assert_eq!(st.runtime_ms, 20_000);
        assert_eq!(st.temperature_c, 20.0);
        assert!(st.flow.is_some());
        assert_eq!(st.light.unwrap().brightness, 200);
    }

    #[test]
    fn alert_message_names_system() {
        let (subject, body) = flow_alert_message(&SystemSettings::default(), 21.5, Some(0.2));
        assert_eq!(subject, "WARNING: no water flow in Hydro System 1");
        assert!(body.contains("0.20 L/min"));
        assert!(body.contains("21.5"));
    }
}
