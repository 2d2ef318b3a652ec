/*!
Test harness for end-to-end dashboard scenarios

Wires one `Dashboard` to a `MemoryStore`, a `ProducerSim` playing the field
backend, and retained map/chart models:
- `pump()` lets the producer react and delivers every queued notification
- the clock only moves through `advance()`, so deadlines are deterministic
- `pause_producer()` simulates a backend that stopped listening
*/

use crate::producer_sim::ProducerSim;
use anyhow::Result;
use fieldwatch_core::connection::Transition;
use fieldwatch_core::{
    ChartModel, ConnectionState, Dashboard, EngineOptions, MapModel, MemorySettings, MemoryStore, Namespace,
    RemoteStore, SettingsStore, StoreEvent,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// Upper bound on producer/engine exchanges in one `pump()`.
const MAX_ROUNDS: usize = 256;

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub producer: ProducerSim,
    pub dashboard: Dashboard,
    pub map: MapModel,
    pub chart: ChartModel,
    producer_online: bool,
    now: OffsetDateTime,
    delivered: usize,
}

impl TestHarness {
    /// Harness viewing `namespace`, with the producer running there too.
    pub fn new(namespace: &str) -> Result<Self> {
        Self::with_settings(namespace, Box::new(MemorySettings::new()))
    }

    pub fn with_settings(namespace: &str, settings: Box<dyn SettingsStore>) -> Result<Self> {
        let _ = env_logger::builder().is_test(true).try_init();

        let namespace = Namespace::parse(namespace)?;
        let store = Arc::new(MemoryStore::new());
        let map = MapModel::new();
        let chart = ChartModel::new();
        let now = OffsetDateTime::now_utc();
        let dashboard = Dashboard::new(
            namespace.clone(),
            store.clone(),
            settings,
            Box::new(map.clone()),
            Box::new(chart.clone()),
            EngineOptions::default(),
            now,
        );

        Ok(Self {
            producer: ProducerSim::new(store.clone(), namespace),
            store,
            dashboard,
            map,
            chart,
            producer_online: true,
            now,
            delivered: 0,
        })
    }

    /// Boots the producer, attaches the dashboard and settles.
    pub fn start(&mut self) -> Result<()> {
        self.producer.boot();
        self.dashboard.start()?;
        self.pump();
        log::info!("🚀 harness started on {}", self.dashboard.namespace());
        Ok(())
    }

    /// Replaces the dashboard as a page reload would: same store, fresh
    /// engine on `route`, local settings handed over by the caller.
    pub fn reload(&mut self, route: &str, settings: Box<dyn SettingsStore>) -> Result<()> {
        if let Err(e) = self.store.detach(self.dashboard.namespace()) {
            log::warn!("detach before reload failed: {e}");
        }
        self.map = MapModel::new();
        self.chart = ChartModel::new();
        self.dashboard = Dashboard::new(
            Namespace::parse(route)?,
            self.store.clone(),
            settings,
            Box::new(self.map.clone()),
            Box::new(self.chart.clone()),
            EngineOptions::default(),
            self.now,
        );
        self.dashboard.start()?;
        self.pump();
        log::info!("🔄 harness reloaded on {route}");
        Ok(())
    }

    pub fn now(&self) -> OffsetDateTime {
        self.now
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn pause_producer(&mut self) {
        self.producer_online = false;
    }

    pub fn resume_producer(&mut self) {
        self.producer_online = true;
    }

    /// Runs producer reactions and event delivery until both are quiet.
    /// Returns the number of events delivered.
    pub fn pump(&mut self) -> usize {
        let mut delivered = 0;
        for _ in 0..MAX_ROUNDS {
            let consumed = self.producer_online && !self.producer.poll().is_empty();
            let events = self.store.drain_events();
            if events.is_empty() && !consumed {
                self.delivered += delivered;
                return delivered;
            }
            for event in events {
                self.dashboard.handle(event, self.now);
                delivered += 1;
            }
        }
        log::warn!("⏰ pump did not settle after {MAX_ROUNDS} rounds");
        self.delivered += delivered;
        delivered
    }

    /// Hands one event to the dashboard directly, bypassing the store.
    pub fn deliver(&mut self, event: StoreEvent) {
        self.dashboard.handle(event, self.now);
        self.delivered += 1;
    }

    pub fn tick(&mut self) -> Option<Transition> {
        self.dashboard.tick(self.now)
    }

    /// Pumps until the dashboard reaches `state` or `timeout_ms` elapses.
    pub async fn wait_for_state(&mut self, state: ConnectionState, timeout_ms: u64) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            self.pump();
            if self.dashboard.state() == state {
                log::info!("✅ reached {state}");
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        log::warn!("⏰ timeout waiting for {state}, still {}", self.dashboard.state());
        false
    }

    pub fn get_stats(&self) -> HarnessStats {
        HarnessStats {
            events_delivered: self.delivered,
            engine_writes: self.store.writes().len(),
            map_renders: self.map.render_count(),
            chart_renders: self.chart.render_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HarnessStats {
    pub events_delivered: usize,
    pub engine_writes: usize,
    pub map_renders: usize,
    pub chart_renders: usize,
}

impl HarnessStats {
    pub fn print(&self) {
        println!("📊 Harness statistics:");
        println!("  Events delivered: {}", self.events_delivered);
        println!("  Engine writes: {}", self.engine_writes);
        println!("  Map renders: {}", self.map_renders);
        println!("  Chart renders: {}", self.chart_renders);
    }
}
