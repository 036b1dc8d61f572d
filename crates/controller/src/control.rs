//! Control loop and event notifier.
//!
//! The control loop is the only caller of `Controller::tick`.  Every 250 ms
//! it gathers inputs (temperature, night flag, local hour), ticks the
//! controller under the state write lock and dispatches the resulting
//! events.  Slow follow-up work (pump-run rows, MQTT pump messages) happens
//! in [`run_notifier`] so the loop never waits on I/O.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, QoS};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use hydro_core::{Clock, ControlEvent, Inputs, Transition};

use crate::mqtt::Topics;
use crate::night::NightOracle;
use crate::probe::{ProbeStatus, TemperatureReading};
use crate::state::SharedState;
use crate::store::{now_unix, PumpRun, Store};

/// Controller tick period.
const TICK_INTERVAL_MS: u64 = 250;

/// Temperature probe refresh period.
const PROBE_INTERVAL_SEC: u64 = 5;

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

/// Run the control loop.  Intended to be `tokio::spawn`-ed from main.
pub async fn run(
    shared: SharedState,
    clock: Arc<dyn Clock>,
    temperature: TemperatureReading,
    oracle: Arc<NightOracle>,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let probe_every = Duration::from_secs(PROBE_INTERVAL_SEC);
    let mut last_probe: Option<Instant> = None;
    let mut celsius = temperature.celsius();
    let temperature = Arc::new(Mutex::new(temperature));

    info!(
        tick_ms = TICK_INTERVAL_MS,
        probe_sec = PROBE_INTERVAL_SEC,
        "control loop started"
    );

    loop {
        ticker.tick().await;

        let probe_status = if last_probe.map_or(true, |t| t.elapsed() >= probe_every) {
            last_probe = Some(Instant::now());
            refresh_probe(&temperature).await
        } else {
            None
        };
        if let Some(probe) = &probe_status {
            celsius = probe.temperature_c;
        }

        let inputs = Inputs {
            temperature_c: celsius,
            is_night: oracle.is_night(),
            local_hour: oracle.local_hour(),
        };

        let mut st = shared.write().await;
        if let Some(probe) = probe_status {
            st.probe = probe;
        }
        let events = st.controller.tick(clock.now(), inputs);
        if !events.is_empty() {
            st.dispatch(events);
        }
    }
}

/// Read the probe on the blocking pool: a 1-Wire sysfs read can stall for
/// most of a second.
async fn refresh_probe(reading: &Arc<Mutex<TemperatureReading>>) -> Option<ProbeStatus> {
    let reading = Arc::clone(reading);
    let task = tokio::task::spawn_blocking(move || {
        let mut reading = match reading.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        reading.refresh();
        reading.status().clone()
    });
    match task.await {
        Ok(status) => Some(status),
        Err(e) => {
            error!("temperature read task failed: {e}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// History row for a finished ON interval, `None` for an ON transition.
pub fn pump_run(t: &Transition, ended_at: i64) -> Option<PumpRun> {
    if t.on {
        return None;
    }
    let duration_secs = i64::from(t.ran_ms.unwrap_or(0) / 1000);
    Some(PumpRun {
        started_at: ended_at - duration_secs,
        ended_at,
        duration_secs,
        cause: t.cause.as_str().to_string(),
    })
}

/// Persist pump runs and publish pump transitions.  Ends when every sender
/// has been dropped.
pub async fn run_notifier(
    mut rx: mpsc::UnboundedReceiver<ControlEvent>,
    store: Store,
    mqtt: Option<(AsyncClient, Topics)>,
) {
    while let Some(event) = rx.recv().await {
        let ControlEvent::Pump(t) = event else {
            continue;
        };

        if let Some((client, topics)) = &mqtt {
            let payload = if t.on { "ON" } else { "OFF" };
            if let Err(e) = client
                .publish(topics.pump(), QoS::AtLeastOnce, true, payload)
                .await
            {
                warn!("pump publish failed: {e}");
            }
        }

        if let Some(run) = pump_run(&t, now_unix()) {
            if let Err(e) = store.insert_pump_run(&run).await {
                error!(cause = %run.cause, "db: insert_pump_run failed: {e:#}");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
