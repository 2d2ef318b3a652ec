/**
 * FIELDWATCH MONITOR - runtime host for the dashboard engine
 *
 * ROLE: loads configuration, connects to the MQTT broker standing in for the
 * remote store, drives the single Dashboard instance from the broker event
 * loop, re-evaluates the project-switch deadline on a timer and serves the
 * HTTP control surface.
 */

mod config;
mod http;
mod mqtt;
mod state;

use crate::config::load_config;
use crate::http::AppState;
use crate::mqtt::{create_mqtt_client, spawn_store_listener, MqttStore};
use crate::state::{new_state, SharedDashboard};

use anyhow::{Context, Result};
use fieldwatch_core::{ChartModel, Dashboard, FileSettings, MapModel, MemorySettings, Namespace, SettingsStore};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::time::interval;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().init();

    let cfg = load_config().await;
    let namespace = Namespace::parse(&cfg.namespace).context("invalid startup namespace")?;

    let settings = open_settings(cfg.settings_path.clone());
    let (client, eventloop) = create_mqtt_client(&cfg);
    let store = Arc::new(MqttStore::new(client, &cfg.topic_root));
    let map = MapModel::new();
    let chart = ChartModel::new();

    let dashboard: SharedDashboard = new_state(Dashboard::new(
        namespace,
        store.clone(),
        settings,
        Box::new(map.clone()),
        Box::new(chart.clone()),
        cfg.engine_options(),
        OffsetDateTime::now_utc(),
    ));

    // the first ConnAck attaches the startup namespace
    spawn_store_listener(eventloop, store, dashboard.clone());
    spawn_switch_ticker(dashboard.clone(), cfg.tick_interval());

    let app_state = AppState {
        dashboard,
        map,
        chart,
        store_id: cfg.store_id.clone(),
        api_key: std::env::var("FIELDWATCH_API_KEY").ok(),
    };
    if app_state.api_key.is_none() {
        warn!("[monitor] FIELDWATCH_API_KEY not set, only /health will answer");
    }
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.http_addr)
        .await
        .with_context(|| format!("cannot bind {}", cfg.http_addr))?;
    info!(
        "[monitor] project {} on {}:{} (root {:?}), listening on http://{}",
        cfg.namespace, cfg.mqtt.host, cfg.mqtt.port, cfg.topic_root, cfg.http_addr
    );
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}

fn open_settings(path: Option<std::path::PathBuf>) -> Box<dyn SettingsStore> {
    let Some(path) = path.or_else(FileSettings::default_path) else {
        warn!("[monitor] no config directory, settings will not persist");
        return Box::new(MemorySettings::new());
    };
    match FileSettings::open(&path) {
        Ok(file) => {
            info!("[monitor] local settings at {}", file.path().display());
            Box::new(file)
        }
        Err(e) => {
            warn!("[monitor] {e}; settings will not persist");
            Box::new(MemorySettings::new())
        }
    }
}

/// Drives the switch deadline: an unconfirmed switch falls back to offline
/// within one tick of its deadline.
fn spawn_switch_ticker(dashboard: SharedDashboard, every: Duration) {
    tokio::spawn(async move {
        let mut timer = interval(every);
        loop {
            timer.tick().await;
            let mut d = dashboard.lock();
            if let Some(t) = d.tick(OffsetDateTime::now_utc()) {
                if t.intent_expired {
                    warn!("[monitor] switch to {} expired, now {}", d.namespace(), t.to);
                }
            }
        }
    });
}
