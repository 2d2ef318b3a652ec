//! The reconciliation engine.
//!
//! [`Dashboard`] owns every piece of local state and is driven one event at a
//! time: store notifications through [`Dashboard::handle`], the switch
//! deadline through [`Dashboard::tick`], and operator actions through the
//! remaining methods. Nothing here blocks or spawns; the host decides how
//! events are queued and how `now` is sampled.

use crate::command::{command_for, Command};
use crate::config_sync::{BackendConfig, ConfigField, ConfigPatch, ConfigSync, InputField, RemoteThresholds, SettingsEditor, ThresholdSync};
use crate::connection::{ConnectionMachine, ConnectionState, ConnectionStatus, Controls, Posture, StatusLine, SwitchIntent, Transition};
use crate::error::{DashboardError, ValidationError};
use crate::history::{HistoryFeed, HistoryRecord};
use crate::record::{normalize, LiveReading, PositionSample};
use crate::render::{series, styled_points, ChartSurface, MapSurface, SeriesPoint, StyledPoint};
use crate::settings::{self, SettingsStore};
use crate::store::{Generation, Namespace, RemoteStore, StoreError, StoreEvent, StorePath};
use crate::switch::{SwitchPlan, SwitchProtocol, DEFAULT_SWITCH_TIMEOUT};
use crate::thresholds::ThresholdConfig;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub switch_timeout: Duration,
    /// Unit shown when a reading carries none.
    pub default_unit: String,
    /// Recenter the map on every live position.
    pub auto_center: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            switch_timeout: DEFAULT_SWITCH_TIMEOUT,
            default_unit: "ppm".to_string(),
            auto_center: true,
        }
    }
}

/// Undrained notices beyond this drop the oldest.
pub const MAX_NOTICES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// One-shot message for the operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// Serializable picture of everything the UI shows.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub namespace: Namespace,
    pub generation: Generation,
    pub state: ConnectionState,
    pub posture: Posture,
    pub controls: Controls,
    pub status: StatusLine,
    pub live: LiveReading,
    pub thresholds: ThresholdConfig,
    pub parked_thresholds: Option<ThresholdConfig>,
    pub config: BackendConfig,
    pub editor: SettingsEditor,
    pub switch: Option<SwitchIntent>,
    pub history_len: usize,
    pub notices: Vec<Notice>,
}

pub struct Dashboard {
    store: Arc<dyn RemoteStore>,
    settings: Box<dyn SettingsStore>,
    map: Box<dyn MapSurface>,
    chart: Box<dyn ChartSurface>,
    options: EngineOptions,
    namespace: Namespace,
    connection: ConnectionMachine,
    history: HistoryFeed,
    config: ConfigSync,
    thresholds: ThresholdSync,
    switch: SwitchProtocol,
    latest: Option<PositionSample>,
    live: LiveReading,
    notices: Vec<Notice>,
}

impl Dashboard {
    /// Builds the engine for the route `namespace`. Thresholds are seeded from
    /// local settings, and a persisted switch intent for this namespace is
    /// resumed if its deadline has not passed.
    pub fn new(
        namespace: Namespace,
        store: Arc<dyn RemoteStore>,
        settings: Box<dyn SettingsStore>,
        map: Box<dyn MapSurface>,
        chart: Box<dyn ChartSurface>,
        options: EngineOptions,
        now: OffsetDateTime,
    ) -> Self {
        let seed = settings::load_threshold_seed(settings.as_ref()).unwrap_or_default();
        let persisted = settings::load_switch_intent(settings.as_ref());
        let mut dashboard = Self {
            store,
            settings,
            map,
            chart,
            switch: SwitchProtocol::new(options.switch_timeout),
            options,
            config: ConfigSync::new(&namespace),
            namespace,
            connection: ConnectionMachine::new(),
            history: HistoryFeed::new(),
            thresholds: ThresholdSync::new(seed),
            latest: None,
            live: LiveReading::neutral(),
            notices: Vec::new(),
        };

        if let Some(intent) = persisted {
            let resumed = intent.target == dashboard.namespace && dashboard.switch.restore(intent, now);
            if !resumed {
                dashboard.forget_persisted_intent();
            }
        }
        dashboard
    }

    /// Attaches the route namespace.
    pub fn start(&mut self) -> Result<(), DashboardError> {
        if self.switch.in_flight() {
            self.connection.enter_switching();
        }
        self.attach_current()
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn posture(&self) -> Posture {
        self.connection.posture()
    }

    pub fn live(&self) -> &LiveReading {
        &self.live
    }

    pub fn thresholds(&self) -> ThresholdConfig {
        self.thresholds.committed()
    }

    pub fn config(&self) -> &BackendConfig {
        self.config.view()
    }

    pub fn editor(&self) -> &SettingsEditor {
        self.config.editor()
    }

    pub fn history(&self) -> &[HistoryRecord] {
        self.history.records()
    }

    pub fn switch_intent(&self) -> Option<&SwitchIntent> {
        self.switch.intent()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub fn view(&self) -> DashboardView {
        DashboardView {
            namespace: self.namespace.clone(),
            generation: self.history.generation(),
            state: self.state(),
            posture: self.posture(),
            controls: self.posture().controls(),
            status: self.connection.status_line(),
            live: self.live.clone(),
            thresholds: self.thresholds.committed(),
            parked_thresholds: self.thresholds.parked(),
            config: self.config.view().clone(),
            editor: self.config.editor().clone(),
            switch: self.switch.intent().cloned(),
            history_len: self.history.records().len(),
            notices: self.notices.clone(),
        }
    }

    // ---- inbound ----

    /// Applies one store notification. Events for a namespace other than the
    /// current one are late arrivals from a detached view and are dropped.
    pub fn handle(&mut self, event: StoreEvent, now: OffsetDateTime) {
        if event.namespace() != &self.namespace {
            debug!("dashboard: dropping event for detached {}", event.namespace());
            return;
        }
        match event {
            StoreEvent::Value { path, value, .. } => match path {
                StorePath::Status => self.on_status(value.as_ref(), now),
                StorePath::Latest => self.on_latest(value.as_ref()),
                StorePath::CurrentConfig => {
                    self.config.on_remote_config(value.as_ref());
                }
                StorePath::Thresholds => self.on_remote_thresholds(value.as_ref()),
                StorePath::Command | StorePath::ConfigUpdate | StorePath::History => {}
            },
            StoreEvent::ChildAdded { namespace, key, value } => {
                if let Some(record) = self.history.ingest_appended(&namespace, &key, &value) {
                    self.render_appended(&record);
                }
            }
            StoreEvent::Snapshot {
                namespace,
                generation,
                entries,
            } => self.on_snapshot(&namespace, generation, entries),
        }
    }

    /// Re-evaluates the switch deadline.
    pub fn tick(&mut self, now: OffsetDateTime) -> Option<Transition> {
        if !self.switch.in_flight() {
            return None;
        }
        let transition = self.connection.reevaluate(self.switch.intent_mut(), now);
        self.after_transition(transition);
        Some(transition)
    }

    fn on_status(&mut self, value: Option<&Value>, now: OffsetDateTime) {
        let status = value.and_then(ConnectionStatus::from_value);
        let transition = self.connection.on_status(status, self.switch.intent_mut(), now);
        self.after_transition(transition);
    }

    fn after_transition(&mut self, t: Transition) {
        if t.intent_dropped() {
            self.forget_persisted_intent();
        }
        if t.intent_cleared {
            info!("dashboard: switch to {} confirmed ({})", self.namespace, t.to);
        }
        if t.intent_expired {
            warn!("dashboard: switch to {} timed out", self.namespace);
            self.notify(NoticeLevel::Error, "project switch timed out");
        }
        if t.clear_live {
            self.live = LiveReading::neutral();
            self.latest = None;
        } else if t.changed() && t.to.shows_live() {
            self.refresh_live();
        }
    }

    fn on_latest(&mut self, value: Option<&Value>) {
        self.latest = value.and_then(normalize);
        let Some(sample) = &self.latest else {
            return;
        };
        if let Some((lat, lon)) = sample.position() {
            self.map.set_marker(lat, lon, self.options.auto_center);
        }
        self.refresh_live();
    }

    fn refresh_live(&mut self) {
        if !self.state().shows_live() {
            return;
        }
        if let Some(sample) = &self.latest {
            self.live = LiveReading::from_sample(sample, &self.thresholds.committed(), &self.options.default_unit);
        }
    }

    fn on_snapshot(&mut self, namespace: &Namespace, generation: Generation, entries: Vec<(String, Value)>) {
        let Some(batch) = self.history.ingest_snapshot(namespace, generation, entries) else {
            return;
        };
        if batch.records.is_empty() {
            return;
        }
        let thresholds = self.thresholds.committed();
        let points = styled_points(&batch.records, &thresholds);
        if !points.is_empty() {
            self.map.draw_history(&points);
        }
        let full = series(self.history.records(), &thresholds);
        if !full.is_empty() {
            self.chart.set_series(&full);
        }
        if let Some((lat, lon)) = batch.snap_to {
            self.map.focus(lat, lon);
        } else if let (Some((lat, lon)), None) = (batch.last_position, &self.latest) {
            self.map.set_marker(lat, lon, false);
        }
    }

    fn render_appended(&mut self, record: &HistoryRecord) {
        let thresholds = self.thresholds.committed();
        if let Some(point) = StyledPoint::from_record(record, &thresholds) {
            self.map.append_point(point);
        }
        let Some(point) = SeriesPoint::from_record(record, &thresholds) else {
            return;
        };
        let newest = self.history.records().last().is_some_and(|r| r.key == record.key);
        if newest {
            self.chart.append(point);
        } else {
            debug!("dashboard: late record {} redraws the chart", record.key);
            self.chart.set_series(&series(self.history.records(), &thresholds));
        }
    }

    fn on_remote_thresholds(&mut self, value: Option<&Value>) {
        match self.thresholds.on_remote(value) {
            RemoteThresholds::Applied(cfg) => {
                info!("dashboard: thresholds updated remotely to {}/{}/{}", cfg.a(), cfg.b(), cfg.c());
                self.thresholds_changed(&cfg);
            }
            RemoteThresholds::Republish(cfg) => {
                info!("dashboard: {} has no thresholds, publishing local set", self.namespace);
                if let Err(e) = self.store.set(&self.namespace, StorePath::Thresholds, ThresholdSync::to_value(&cfg)) {
                    self.write_failed(e);
                }
            }
            RemoteThresholds::Parked | RemoteThresholds::Unchanged | RemoteThresholds::Ignored => {}
        }
    }

    fn thresholds_changed(&mut self, cfg: &ThresholdConfig) {
        if let Err(e) = settings::save_threshold_seed(self.settings.as_mut(), cfg) {
            warn!("dashboard: could not save threshold seed: {e}");
        }
        let records = self.history.records();
        if !records.is_empty() {
            let points = styled_points(records, cfg);
            let full = series(records, cfg);
            self.map.restyle(&points);
            self.chart.set_series(&full);
        }
        self.refresh_live();
    }

    // ---- operator actions ----

    /// Sends `start` or `stop` depending on what the UI currently shows.
    pub fn toggle_recording(&mut self) -> Result<Command, DashboardError> {
        let command = command_for(self.posture())?;
        info!("dashboard: sending {command} to {}", self.namespace);
        self.store
            .set(&self.namespace, StorePath::Command, command.to_value())
            .map_err(|e| self.write_failed(e))?;
        Ok(command)
    }

    /// Commits operator thresholds once the store accepted them. Nothing
    /// changes locally if any field is invalid or the write fails.
    pub fn commit_thresholds(&mut self, a: &str, b: &str, c: &str) -> Result<ThresholdConfig, DashboardError> {
        if self.posture().controls().thresholds_locked {
            return Err(DashboardError::ControlsLocked);
        }
        let cfg = ThresholdConfig::parse(a, b, c)?;
        self.store
            .set(&self.namespace, StorePath::Thresholds, ThresholdSync::to_value(&cfg))
            .map_err(|e| self.write_failed(e))?;
        let cfg = self.thresholds.commit(a, b, c)?;
        self.thresholds_changed(&cfg);
        Ok(cfg)
    }

    /// Proposes a backend config patch. A patch naming another project is a
    /// project switch.
    pub fn propose_config_update(&mut self, patch: ConfigPatch, now: OffsetDateTime) -> Result<(), DashboardError> {
        if !self.posture().controls().settings {
            return Err(DashboardError::ControlsLocked);
        }
        if patch.is_empty() {
            return Err(ValidationError::EmptyPatch.into());
        }
        if let Some(target) = patch.namespace.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            if target != self.namespace.as_str() {
                let target = target.to_string();
                return self.switch_project(&target, patch, now);
            }
        }
        self.write_config_patch(&patch)
    }

    /// Submits the settings editor: whatever differs from the view.
    pub fn submit_editor(&mut self, now: OffsetDateTime) -> Result<(), DashboardError> {
        let patch = self.config.editor_patch();
        self.propose_config_update(patch, now)?;
        self.config.close_editor();
        Ok(())
    }

    fn write_config_patch(&mut self, patch: &ConfigPatch) -> Result<(), DashboardError> {
        let payload = patch.to_value();
        info!("dashboard: proposing config update {payload}");
        self.store
            .set(&self.namespace, StorePath::ConfigUpdate, payload)
            .map_err(|e| self.write_failed(e))
    }

    /// Hands the view over to another project.
    pub fn switch_project(&mut self, target: &str, patch: ConfigPatch, now: OffsetDateTime) -> Result<(), DashboardError> {
        // an in-flight switch is reported by the protocol itself
        if !self.posture().controls().settings && !self.switch.in_flight() {
            return Err(DashboardError::ControlsLocked);
        }
        match self.begin_switch(target, patch, now)? {
            Some(target) => self.navigate(target),
            None => Ok(()),
        }
    }

    /// Steps up to the remote handoff write. Returns the namespace to navigate
    /// to, or `None` when the target already is the current namespace.
    fn begin_switch(&mut self, target: &str, patch: ConfigPatch, now: OffsetDateTime) -> Result<Option<Namespace>, DashboardError> {
        let plan = self.switch.begin(&self.namespace, target, patch.clone(), now)?;
        let (intent, payload) = match plan {
            SwitchPlan::Stay => {
                if !patch.is_empty() {
                    self.write_config_patch(&patch)?;
                }
                return Ok(None);
            }
            SwitchPlan::Handoff { intent, payload } => (intent, payload),
        };

        if let Err(e) = settings::save_switch_intent(self.settings.as_mut(), &intent) {
            warn!("dashboard: could not persist switch intent: {e}");
        }
        let transition = self.connection.enter_switching();
        self.after_transition(transition);

        if let Err(e) = self.store.set(&self.namespace, StorePath::ConfigUpdate, payload) {
            self.switch.abort();
            self.forget_persisted_intent();
            let transition = self.connection.reevaluate(self.switch.intent_mut(), now);
            self.after_transition(transition);
            return Err(self.write_failed(e));
        }
        Ok(Some(intent.target))
    }

    /// Retargets every subscription at `target`.
    fn navigate(&mut self, target: Namespace) -> Result<(), DashboardError> {
        if let Err(e) = self.store.detach(&self.namespace) {
            warn!("dashboard: detaching {} failed: {e}", self.namespace);
        }
        info!("dashboard: navigating {} -> {target}", self.namespace);
        self.namespace = target;
        self.config.set_route_namespace(&self.namespace);
        self.connection.forget_status();
        self.latest = None;
        self.live = LiveReading::neutral();
        self.attach_current()
    }

    /// Every attachment replays the whole feed, so drawn history goes with
    /// the records it came from.
    fn attach_current(&mut self) -> Result<(), DashboardError> {
        self.map.clear();
        self.chart.clear();
        let generation = self.history.reset(self.namespace.clone());
        self.store
            .attach(&self.namespace, generation)
            .map_err(|e| self.write_failed(e))
    }

    /// Uploads samples into `target`'s history, switching there first when it
    /// is not the current project. The view is then reloaded and snaps to the
    /// last imported position.
    pub fn import_history(&mut self, target: &str, samples: Vec<PositionSample>, now: OffsetDateTime) -> Result<usize, DashboardError> {
        if !self.posture().controls().upload {
            return Err(DashboardError::ControlsLocked);
        }
        if samples.is_empty() {
            return Err(ValidationError::EmptyImport.into());
        }
        let target_ns = Namespace::parse(target)?;
        if target_ns != self.namespace {
            self.begin_switch(target, ConfigPatch::default(), now)?;
        }

        let mut pushed = 0;
        let mut failure = None;
        for sample in &samples {
            match self.store.push(&target_ns, StorePath::History, sample.to_wire()) {
                Ok(_) => pushed += 1,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        info!("dashboard: imported {pushed}/{} samples into {target_ns}", samples.len());

        self.history.request_snap();
        self.navigate(target_ns)?;
        match failure {
            Some(e) => Err(self.write_failed(e)),
            None => Ok(pushed),
        }
    }

    /// Chart click: focus the map on that record. Returns its position, if any.
    pub fn select_chart_point(&mut self, key: &str) -> Result<Option<(f64, f64)>, DashboardError> {
        let record = self
            .history
            .find(key)
            .ok_or_else(|| DashboardError::UnknownRecord(key.to_string()))?;
        let position = record.sample.position();
        if let Some((lat, lon)) = position {
            self.map.focus(lat, lon);
        }
        Ok(position)
    }

    pub fn open_settings(&mut self) -> Result<(), DashboardError> {
        if !self.posture().controls().settings {
            return Err(DashboardError::ControlsLocked);
        }
        self.config.open_editor();
        Ok(())
    }

    pub fn close_settings(&mut self) {
        self.config.close_editor();
    }

    pub fn focus_input(&mut self, field: InputField) {
        match field {
            InputField::Config(f) => self.config.focus(f),
            InputField::Threshold(f) => self.thresholds.focus(f),
        }
    }

    pub fn blur_input(&mut self, field: InputField) {
        match field {
            InputField::Config(f) => self.config.blur(f),
            InputField::Threshold(f) => {
                if let Some(cfg) = self.thresholds.blur(f) {
                    self.thresholds_changed(&cfg);
                }
            }
        }
    }

    pub fn type_into(&mut self, field: ConfigField, text: &str) {
        self.config.type_into(field, text);
    }

    // ---- helpers ----

    fn notify(&mut self, level: NoticeLevel, message: impl Into<String>) {
        if self.notices.len() >= MAX_NOTICES {
            self.notices.remove(0);
        }
        self.notices.push(Notice {
            level,
            message: message.into(),
        });
    }

    fn write_failed(&mut self, err: StoreError) -> DashboardError {
        warn!("dashboard: {err}");
        self.notify(NoticeLevel::Error, format!("remote write failed: {err}"));
        DashboardError::Store(err)
    }

    fn forget_persisted_intent(&mut self) {
        if let Err(e) = settings::clear_switch_intent(self.settings.as_mut()) {
            warn!("dashboard: could not clear persisted switch intent: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{ChartModel, MapModel};
    use crate::settings::{save_switch_intent, MemorySettings};
    use crate::store::MemoryStore;
    use crate::thresholds::Bucket;
    use serde_json::json;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-03-01 12:00:00 UTC);

    struct Fixture {
        dashboard: Dashboard,
        store: Arc<MemoryStore>,
        map: MapModel,
        chart: ChartModel,
    }

    impl Fixture {
        fn with_settings(settings: MemorySettings) -> Self {
            let store = Arc::new(MemoryStore::new());
            let map = MapModel::new();
            let chart = ChartModel::new();
            let mut dashboard = Dashboard::new(
                ns("alpha"),
                store.clone(),
                Box::new(settings),
                Box::new(map.clone()),
                Box::new(chart.clone()),
                EngineOptions::default(),
                NOW,
            );
            dashboard.start().unwrap();
            let mut fixture = Self {
                dashboard,
                store,
                map,
                chart,
            };
            fixture.pump();
            fixture
        }

        fn new() -> Self {
            Self::with_settings(MemorySettings::new())
        }

        fn pump(&mut self) {
            for event in self.store.drain_events() {
                self.dashboard.handle(event, NOW);
            }
        }

        fn status(&mut self, state: &str) {
            let ns = self.dashboard.namespace().clone();
            self.store
                .publish_value(&ns, StorePath::Status, Some(json!({"state": state, "message": ""})));
            self.pump();
        }
    }

    fn ns(s: &str) -> Namespace {
        Namespace::parse(s).unwrap()
    }

    fn sample(ts: &str, lat: f64, conc: f64) -> PositionSample {
        normalize(&json!({"timestamp": ts, "lat": lat, "lon": 121.0, "conc": conc})).unwrap()
    }

    #[test]
    fn test_empty_feed_renders_nothing() {
        let f = Fixture::new();
        assert_eq!(f.map.render_count(), 0);
        assert_eq!(f.chart.render_count(), 0);
        assert_eq!(f.dashboard.state(), ConnectionState::Offline);
        assert!(f.dashboard.view().notices.is_empty());
    }

    #[test]
    fn test_status_sequence_drives_posture_and_live_panel() {
        let mut f = Fixture::new();
        let alpha = ns("alpha");

        f.status("connecting");
        assert_eq!(f.dashboard.posture(), Posture::Recording);
        f.store.publish_value(
            &alpha,
            StorePath::Latest,
            Some(json!({"timestamp": "t1", "lat": 25.0, "lon": 121.0, "conc": 120.0})),
        );
        f.pump();
        assert!(f.dashboard.live().is_neutral());
        assert_eq!(f.map.state().marker, Some((25.0, 121.0)));

        f.status("active");
        assert_eq!(f.dashboard.posture(), Posture::Recording);
        assert_eq!(f.dashboard.live().coords, "25.000000, 121.000000");
        assert_eq!(f.dashboard.live().concentration, "120 ppm");
        assert_eq!(f.dashboard.live().bucket, Some(Bucket::Orange));

        f.status("stopped");
        assert_eq!(f.dashboard.posture(), Posture::Idle);
        assert!(f.dashboard.live().is_neutral());
    }

    #[test]
    fn test_toggle_follows_posture() {
        let mut f = Fixture::new();
        assert_eq!(f.dashboard.toggle_recording().unwrap(), Command::Start);
        f.status("active");
        assert_eq!(f.dashboard.toggle_recording().unwrap(), Command::Stop);
        let written: Vec<_> = f.store.writes_to(StorePath::Command).into_iter().map(|w| w.value).collect();
        assert_eq!(written, [json!("start"), json!("stop")]);
    }

    #[test]
    fn test_history_is_batched_then_appended() {
        let store = Arc::new(MemoryStore::new());
        let alpha = ns("alpha");
        store.append_history(&alpha, sample("t1", 25.0, 10.0).to_wire());
        store.append_history(&alpha, json!({"timestamp": "t2", "conc": 60.0}));
        let map = MapModel::new();
        let chart = ChartModel::new();
        let mut d = Dashboard::new(
            alpha.clone(),
            store.clone(),
            Box::new(MemorySettings::new()),
            Box::new(map.clone()),
            Box::new(chart.clone()),
            EngineOptions::default(),
            NOW,
        );
        d.start().unwrap();
        for e in store.drain_events() {
            d.handle(e, NOW);
        }
        assert_eq!(map.state().batch_renders, 1);
        assert_eq!(map.state().points.len(), 1);
        assert_eq!(chart.state().series.len(), 2);
        assert_eq!(map.state().marker, Some((25.0, 121.0)));

        store.append_history(&alpha, sample("t3", 25.1, 200.0).to_wire());
        for e in store.drain_events() {
            d.handle(e, NOW);
        }
        assert_eq!(map.state().point_renders, 1);
        assert_eq!(map.state().points[1].bucket, Some(Bucket::Red));
        assert_eq!(d.history().len(), 3);
    }

    #[test]
    fn test_second_switch_while_in_flight_writes_once() {
        let mut f = Fixture::new();
        f.dashboard.switch_project("beta", ConfigPatch::default(), NOW).unwrap();
        let err = f
            .dashboard
            .switch_project("beta", ConfigPatch::default(), NOW)
            .unwrap_err();
        assert!(matches!(err, DashboardError::SwitchInProgress(_)));

        let writes = f.store.writes_to(StorePath::ConfigUpdate);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].namespace, ns("alpha"));
        assert_eq!(writes[0].value, json!({"project_id": "beta"}));
        assert_eq!(f.dashboard.namespace(), &ns("beta"));
        assert_eq!(f.dashboard.state(), ConnectionState::Switching);
        assert!(f.store.is_attached(&ns("beta")));
        assert!(!f.store.is_attached(&ns("alpha")));
    }

    #[test]
    fn test_switch_confirmed_by_new_namespace_status() {
        let mut f = Fixture::new();
        f.dashboard.switch_project("beta", ConfigPatch::default(), NOW).unwrap();
        f.pump();
        assert_eq!(f.dashboard.state(), ConnectionState::Switching);
        f.status("offline");
        assert_eq!(f.dashboard.state(), ConnectionState::Switching);
        f.status("stopped");
        assert_eq!(f.dashboard.state(), ConnectionState::Stopped);
        assert!(f.dashboard.switch_intent().is_none());
        assert!(f.dashboard.tick(NOW + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_switch_timeout_falls_back_to_offline() {
        let mut f = Fixture::new();
        f.dashboard.switch_project("beta", ConfigPatch::default(), NOW).unwrap();
        f.pump();
        let t = f.dashboard.tick(NOW + Duration::from_secs(29)).unwrap();
        assert_eq!(t.to, ConnectionState::Switching);
        let t = f.dashboard.tick(NOW + Duration::from_secs(30)).unwrap();
        assert_eq!(t.to, ConnectionState::Offline);
        assert!(f.dashboard.switch_intent().is_none());
        let notices = f.dashboard.take_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].message, "project switch timed out");
    }

    #[test]
    fn test_failed_handoff_write_aborts_without_navigation() {
        let mut f = Fixture::new();
        f.status("stopped");
        f.store.reject_writes(Some("permission denied"));
        let err = f
            .dashboard
            .switch_project("beta", ConfigPatch::default(), NOW)
            .unwrap_err();
        assert!(matches!(err, DashboardError::Store(_)));
        assert_eq!(f.dashboard.namespace(), &ns("alpha"));
        assert_eq!(f.dashboard.posture(), Posture::Idle);
        assert!(f.dashboard.switch_intent().is_none());
        assert_eq!(f.dashboard.take_notices()[0].level, NoticeLevel::Error);
    }

    #[test]
    fn test_empty_target_is_rejected_without_a_write() {
        let mut f = Fixture::new();
        let err = f.dashboard.switch_project("  ", ConfigPatch::default(), NOW).unwrap_err();
        assert!(err.is_local());
        assert!(f.store.writes_to(StorePath::ConfigUpdate).is_empty());
    }

    #[test]
    fn test_config_patch_for_same_project_is_a_plain_update() {
        let mut f = Fixture::new();
        let patch = ConfigPatch {
            namespace: Some("alpha".into()),
            device_port: Some("5000".into()),
            ..Default::default()
        };
        f.dashboard.propose_config_update(patch, NOW).unwrap();
        assert_eq!(f.dashboard.state(), ConnectionState::Offline);
        let writes = f.store.writes_to(StorePath::ConfigUpdate);
        assert_eq!(writes[0].value, json!({"project_id": "alpha", "gps_port": 5000}));
        assert!(matches!(
            f.dashboard.propose_config_update(ConfigPatch::default(), NOW),
            Err(DashboardError::Validation(ValidationError::EmptyPatch))
        ));
    }

    #[test]
    fn test_thresholds_seed_remote_and_restyle() {
        let mut f = Fixture::new();
        // brand-new namespace: local set is published
        let writes = f.store.writes_to(StorePath::Thresholds);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].value, json!({"a": 50.0, "b": 100.0, "c": 150.0}));
        f.pump();

        let alpha = ns("alpha");
        f.store.append_history(&alpha, sample("t1", 25.0, 40.0).to_wire());
        f.pump();
        assert_eq!(f.map.state().points[0].bucket, Some(Bucket::Green));

        assert!(f.dashboard.commit_thresholds("10", "x", "30").is_err());
        assert_eq!(f.store.writes_to(StorePath::Thresholds).len(), 1);

        f.dashboard.commit_thresholds("10", "20", "30").unwrap();
        assert_eq!(f.map.state().restyles, 1);
        assert_eq!(f.map.state().points[0].bucket, Some(Bucket::Red));
        assert_eq!(f.store.writes_to(StorePath::Thresholds).len(), 2);
    }

    #[test]
    fn test_remote_thresholds_wait_for_focus_release() {
        let mut f = Fixture::new();
        let alpha = ns("alpha");
        f.dashboard.focus_input(InputField::Threshold(crate::thresholds::ThresholdField::B));
        f.store
            .publish_value(&alpha, StorePath::Thresholds, Some(json!({"a": 1, "b": 2, "c": 3})));
        f.pump();
        assert_eq!(f.dashboard.thresholds(), ThresholdConfig::default());
        f.dashboard.blur_input(InputField::Threshold(crate::thresholds::ThresholdField::B));
        assert_eq!(f.dashboard.thresholds().c(), 3.0);
    }

    #[test]
    fn test_import_into_other_project_switches_and_snaps() {
        let mut f = Fixture::new();
        f.status("stopped");
        let pushed = f
            .dashboard
            .import_history("gamma", vec![sample("t1", 24.0, 1.0), sample("t2", 24.5, 2.0)], NOW)
            .unwrap();
        assert_eq!(pushed, 2);
        assert_eq!(f.dashboard.namespace(), &ns("gamma"));
        assert_eq!(f.store.writes_to(StorePath::ConfigUpdate).len(), 1);
        f.pump();
        assert_eq!(f.dashboard.history().len(), 2);
        assert_eq!(f.map.state().center, Some((24.5, 121.0)));
        assert_eq!(f.map.state().batch_renders, 1);
    }

    #[test]
    fn test_import_is_refused_while_recording() {
        let mut f = Fixture::new();
        f.status("active");
        let err = f
            .dashboard
            .import_history("alpha", vec![sample("t1", 1.0, 1.0)], NOW)
            .unwrap_err();
        assert!(matches!(err, DashboardError::ControlsLocked));
    }

    #[test]
    fn test_chart_selection_focuses_map() {
        let mut f = Fixture::new();
        let key = f.store.append_history(&ns("alpha"), sample("t1", 22.0, 5.0).to_wire());
        f.pump();
        assert_eq!(f.dashboard.select_chart_point(&key).unwrap(), Some((22.0, 121.0)));
        assert_eq!(f.map.state().center, Some((22.0, 121.0)));
        assert!(matches!(
            f.dashboard.select_chart_point("missing"),
            Err(DashboardError::UnknownRecord(_))
        ));
    }

    #[test]
    fn test_events_from_detached_namespace_are_ignored() {
        let mut f = Fixture::new();
        f.dashboard.handle(
            StoreEvent::Value {
                namespace: ns("other"),
                path: StorePath::Status,
                value: Some(json!({"state": "active"})),
            },
            NOW,
        );
        assert_eq!(f.dashboard.state(), ConnectionState::Offline);
    }

    #[test]
    fn test_persisted_intent_is_resumed_at_startup() {
        let mut settings = MemorySettings::new();
        let intent = SwitchIntent {
            target: ns("alpha"),
            deadline: NOW + Duration::from_secs(20),
        };
        save_switch_intent(&mut settings, &intent).unwrap();
        let mut f = Fixture::with_settings(settings);
        assert_eq!(f.dashboard.state(), ConnectionState::Switching);
        f.status("active");
        assert_eq!(f.dashboard.state(), ConnectionState::Active);
        assert!(f.dashboard.switch_intent().is_none());
    }

    #[test]
    fn test_settings_editor_is_locked_while_recording() {
        let mut f = Fixture::new();
        f.dashboard.open_settings().unwrap();
        assert!(f.dashboard.editor().open);
        f.dashboard.close_settings();
        f.status("active");
        assert!(matches!(f.dashboard.open_settings(), Err(DashboardError::ControlsLocked)));
    }

    #[test]
    fn test_reattach_draws_history_once() {
        let mut f = Fixture::new();
        f.store.append_history(&ns("alpha"), sample("2024-03-01 10:00:00", 25.0, 40.0).to_wire());
        f.dashboard.start().unwrap();
        f.pump();
        assert_eq!(f.map.state().points.len(), 1);

        // broker reconnect
        f.dashboard.start().unwrap();
        f.pump();
        assert_eq!(f.dashboard.history().len(), 1);
        assert_eq!(f.map.state().points.len(), 1);
        assert_eq!(f.chart.state().series.len(), 1);
    }

    #[test]
    fn test_late_append_keeps_chart_in_time_order() {
        let mut f = Fixture::new();
        let alpha = ns("alpha");
        f.store.append_history(&alpha, sample("2024-03-01 10:00:05", 25.0, 40.0).to_wire());
        f.store.append_history(&alpha, sample("2024-03-01 10:00:02", 25.1, 60.0).to_wire());
        f.pump();

        let chart = f.chart.state();
        let order: Vec<_> = chart.series.iter().map(|p| p.timestamp.as_str()).collect();
        assert_eq!(order, ["2024-03-01 10:00:02", "2024-03-01 10:00:05"]);
        assert_eq!(chart.appends, 1);
        assert_eq!(chart.batch_renders, 1);
    }

    #[test]
    fn test_rejected_threshold_write_keeps_previous_set() {
        let mut f = Fixture::new();
        f.store.append_history(&ns("alpha"), sample("t1", 25.0, 40.0).to_wire());
        f.pump();
        f.store.reject_writes(Some("permission denied"));

        let err = f.dashboard.commit_thresholds("10", "20", "30").unwrap_err();
        assert!(matches!(err, DashboardError::Store(_)));
        assert_eq!(f.dashboard.thresholds(), ThresholdConfig::default());
        assert_eq!(f.map.state().restyles, 0);
        assert_eq!(f.map.state().points[0].bucket, Some(Bucket::Green));
    }

    #[test]
    fn test_project_change_is_refused_while_recording() {
        let mut f = Fixture::new();
        f.status("active");
        let err = f
            .dashboard
            .switch_project("beta", ConfigPatch::default(), NOW)
            .unwrap_err();
        assert!(matches!(err, DashboardError::ControlsLocked));

        let patch = ConfigPatch {
            device_address: Some("10.0.0.9".into()),
            ..ConfigPatch::default()
        };
        assert!(matches!(
            f.dashboard.propose_config_update(patch, NOW),
            Err(DashboardError::ControlsLocked)
        ));
        assert_eq!(f.dashboard.namespace(), &ns("alpha"));
        assert!(f.store.writes_to(StorePath::ConfigUpdate).is_empty());
    }

    #[test]
    fn test_notice_queue_is_bounded() {
        let mut f = Fixture::new();
        f.store.reject_writes(Some("offline"));
        for _ in 0..MAX_NOTICES + 8 {
            assert!(f.dashboard.toggle_recording().is_err());
        }
        assert_eq!(f.dashboard.view().notices.len(), MAX_NOTICES);
        assert_eq!(f.dashboard.take_notices().len(), MAX_NOTICES);
        assert!(f.dashboard.view().notices.is_empty());
    }
}
