mod alerts;
mod config;
mod control;
mod mqtt;
mod night;
mod probe;
mod relay;
#[cfg(feature = "sim")]
mod sim;
mod state;
mod store;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tokio::sync::{mpsc, RwLock};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hydro_core::clock::MonotonicClock;
use hydro_core::{Clock, Controller, LightOutput, PulseCounter, Relay};

use alerts::AlertDispatcher;
use config::Config;
use mqtt::Topics;
use night::NightOracle;
use probe::{TemperatureReading, TemperatureSource};
use relay::{GrowLight, RelayBoard};
use state::SystemState;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:hydro.db?mode=rwc".to_string());
    info!(
        config = %config_path,
        flow_sensor = cfg.features.flow_sensor,
        alerts = cfg.features.alerts,
        lighting = cfg.features.lighting,
        mqtt = cfg.mqtt.enabled,
        "config loaded"
    );

    // ── Database ────────────────────────────────────────────────────
    let store = Store::connect(&db_url).await?;
    store.migrate().await?;
    let settings = store.load_settings(cfg.settings.as_ref()).await?;
    info!(name = %settings.system_name, "settings loaded");

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let oracle = Arc::new(NightOracle::new(&cfg.night)?);

    // ── Relay (fail-safe OFF) ───────────────────────────────────────
    let relay = Arc::new(RelayBoard::new(
        cfg.hardware.relay_pin as u8,
        cfg.hardware.relay_active_low,
    )?);
    relay.set(false);
    let mut controller = Controller::new(settings, relay.clone(), clock.now());

    // ── MQTT ────────────────────────────────────────────────────────
    let broker = cfg.mqtt.enabled.then(|| {
        let (client, eventloop) = mqtt::connect(&cfg.mqtt);
        (client, eventloop, Topics::new(&cfg.mqtt.topic_prefix))
    });
    let mqtt_out = broker
        .as_ref()
        .map(|(client, _, topics)| (client.clone(), topics.clone()));

    // ── Alerts ──────────────────────────────────────────────────────
    let (alerts, alert_rx) = AlertDispatcher::new(cfg.features.alerts, clock.clone());
    let alerts = Arc::new(alerts);
    tokio::spawn(alerts::run_transport(alert_rx, Arc::downgrade(&alerts), mqtt_out.clone()));
    if cfg.features.alerts {
        controller = controller.with_alerts(alerts.clone());
    }

    // ── Flow sensor ─────────────────────────────────────────────────
    let counter = cfg
        .features
        .flow_sensor
        .then(|| Arc::new(PulseCounter::new()));
    #[cfg(feature = "gpio")]
    let _flow_pin = match &counter {
        Some(c) => Some(relay::attach_flow_sensor(
            cfg.hardware.flow_sensor_pin as u8,
            c.clone(),
            clock.clone(),
        )?),
        None => None,
    };
    #[cfg(all(feature = "sim", not(feature = "gpio")))]
    if let Some(c) = &counter {
        let scenario = sim::Scenario::from_str_lossy(&cfg.sim.scenario);
        info!(%scenario, "simulated flow sensor");
        tokio::spawn(sim::run_flow(
            sim::FlowSim::new(scenario, controller.settings().pulses_per_litre),
            relay.clone(),
            c.clone(),
            clock.clone(),
        ));
    }
    if let Some(c) = counter {
        controller = controller.with_flow(c, clock.now());
    }

    // ── Grow light ──────────────────────────────────────────────────
    let light = if cfg.features.lighting {
        let light = Arc::new(GrowLight::new(cfg.hardware.light_pin as u8)?);
        controller = controller.with_lighting(light.clone());
        Some(light)
    } else {
        None
    };

    // ── Shared state (ephemeral, for the web UI) ────────────────────
    let temperature = TemperatureReading::new(temperature_source(&cfg));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(RwLock::new(
        SystemState::new(controller, temperature.status().clone(), clock.clone())
            .with_outbox(event_tx),
    ));
    shared
        .write()
        .await
        .record_system("controller started".to_string());

    // ── Tasks ───────────────────────────────────────────────────────
    tokio::spawn(control::run_notifier(event_rx, store.clone(), mqtt_out));

    if let Some((client, eventloop, topics)) = broker {
        info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, "mqtt enabled");
        tokio::spawn(mqtt::run(
            eventloop,
            client.clone(),
            topics.clone(),
            Arc::clone(&shared),
        ));
        tokio::spawn(mqtt::publish_status(
            client,
            topics,
            Arc::clone(&shared),
            oracle.clone(),
        ));
    }

    tokio::spawn(control::run(
        Arc::clone(&shared),
        clock.clone(),
        temperature,
        oracle.clone(),
    ));

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        shared: Arc::clone(&shared),
        store,
        alerts,
        oracle,
        features: cfg.features,
    };

    let outcome = tokio::select! {
        res = web::serve(app, &cfg.web) => res,
        res = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            res.context("failed to listen for ctrl-c")
        }
    };

    relay.set(false);
    if let Some(light) = &light {
        light.set_brightness(0);
    }
    info!("pump OFF, exiting");
    outcome
}

#[cfg(all(feature = "sim", not(feature = "gpio")))]
fn temperature_source(cfg: &Config) -> Box<dyn TemperatureSource> {
    let scenario = sim::Scenario::from_str_lossy(&cfg.sim.scenario);
    info!(%scenario, "simulated water temperature");
    Box::new(sim::WaterTempSim::new(scenario, 86_400.0))
}

#[cfg(not(all(feature = "sim", not(feature = "gpio"))))]
fn temperature_source(cfg: &Config) -> Box<dyn TemperatureSource> {
    match probe::Ds18b20::open(cfg.hardware.probe_path.as_deref()) {
        Ok(probe) => Box::new(probe),
        Err(e) => {
            tracing::warn!("temperature probe unavailable, using fallback: {e:#}");
            Box::new(probe::Unavailable(format!("{e:#}")))
        }
    }
}
