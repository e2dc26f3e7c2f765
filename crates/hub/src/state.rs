use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::binding::{SensorSource, SourceState};
use crate::garden::{Diagnostics, Garden, Settings};
use crate::problem::EntityState;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<HubState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct HubState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub garden: Garden,
    pub sources: SourceCache,
    pub events: VecDeque<HubEvent>,
}

/// Last value the host reported for every sensor entity it knows about.
/// Entities declared in the config start out known but without a value.
#[derive(Debug, Default)]
pub struct SourceCache {
    entries: HashMap<String, SourceState>,
}

impl SourceCache {
    pub fn declare(&mut self, entity_id: &str, now: OffsetDateTime) {
        self.entries
            .entry(entity_id.to_string())
            .or_insert(SourceState {
                value: None,
                timestamp: now,
            });
    }

    /// Record a report. Older reports never overwrite newer ones.
    pub fn record(&mut self, entity_id: &str, value: Option<f64>, timestamp: OffsetDateTime) {
        match self.entries.get_mut(entity_id) {
            Some(entry) if timestamp < entry.timestamp => {}
            Some(entry) => *entry = SourceState { value, timestamp },
            None => {
                self.entries
                    .insert(entity_id.to_string(), SourceState { value, timestamp });
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SensorSource for SourceCache {
    fn current(&self, entity_id: &str) -> Option<SourceState> {
        self.entries.current(entity_id)
    }
}

#[derive(Clone, Serialize)]
pub struct HubEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Command,
    Species,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub settings: Settings,
    pub plants: usize,
    pub cycles: usize,
    pub plants_with_problems: Vec<String>,
    pub known_sources: usize,
    pub diagnostics: Diagnostics,
    pub events: Vec<HubEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl HubState {
    pub fn new(garden: Garden, sources: SourceCache) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            garden,
            sources,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn into_shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }

    /// Record an accepted sensor report.
    pub fn record_reading(&mut self, entity_id: &str, value: Option<f64>, plants: usize) {
        let shown = value.map_or_else(|| "unavailable".to_string(), |v| v.to_string());
        self.push_event(
            EventKind::Reading,
            format!("{entity_id}={shown} ({plants} plant(s))"),
        );
    }

    /// Record the outcome of a domain command.
    pub fn record_command(&mut self, detail: String) {
        self.push_event(EventKind::Command, detail);
    }

    /// Record the outcome of a species refresh.
    pub fn record_species(&mut self, detail: String) {
        self.push_event(EventKind::Species, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            settings: *self.garden.settings(),
            plants: self.garden.plants().count(),
            cycles: self.garden.cycles().count(),
            plants_with_problems: self
                .garden
                .plants()
                .filter(|p| p.state() == EntityState::Problem)
                .map(|p| p.id().to_string())
                .collect(),
            known_sources: self.sources.len(),
            diagnostics: self.garden.diagnostics(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
