// src/events/mod.rs

//! Append-only audit log partitioned by day.
//!
//! Events live at `<root>/YYYY/MM/DD/HHMMSS-<type>-<id>.json` with mode 0444
//! and are never rewritten. Retention removes whole day directories.

pub mod alerts;
pub mod pruner;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use metrics::increment_counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{CoreError, Result};
use crate::model::{parse_rfc3339, ActorType, Event, EventResult};
use crate::store::atomic::{self, DIR_MODE, EVENT_MODE};

pub use alerts::{Alert, AlertSeverity};
pub use pruner::EventPruner;

/// Query filter; every set field must match
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub tenant_id: Option<u32>,

    /// Exact type, or a prefix when it ends with `.*`
    pub event_type: Option<String>,

    pub actor: Option<String>,
    pub actor_type: Option<ActorType>,
    pub result: Option<EventResult>,
    pub request_id: Option<String>,

    /// Inclusive lower bound
    pub from: Option<DateTime<Utc>>,

    /// Inclusive upper bound
    pub to: Option<DateTime<Utc>>,
}

impl EventFilter {
    fn matches(&self, event: &Event, ts: Option<DateTime<Utc>>) -> bool {
        if let Some(tenant_id) = self.tenant_id {
            if event.tenant_id != Some(tenant_id) {
                return false;
            }
        }
        if let Some(wanted) = &self.event_type {
            let ok = match wanted.strip_suffix(".*") {
                Some(prefix) => event
                    .event_type
                    .strip_prefix(prefix)
                    .map(|rest| rest.starts_with('.'))
                    .unwrap_or(false),
                None => &event.event_type == wanted,
            };
            if !ok {
                return false;
            }
        }
        if self.actor.as_ref().map_or(false, |a| a != &event.actor) {
            return false;
        }
        if self.actor_type.map_or(false, |t| t != event.actor_type) {
            return false;
        }
        if self.result.map_or(false, |r| r != event.result) {
            return false;
        }
        if self
            .request_id
            .as_ref()
            .map_or(false, |r| event.request_id.as_ref() != Some(r))
        {
            return false;
        }
        if self.from.is_some() || self.to.is_some() {
            let Some(ts) = ts else { return false };
            if self.from.map_or(false, |from| ts < from) || self.to.map_or(false, |to| ts > to) {
                return false;
            }
        }
        true
    }
}

/// Aggregates over a window of days
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventStats {
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_result: BTreeMap<String, u64>,
    pub by_actor_type: BTreeMap<String, u64>,
    pub last_event: Option<String>,
}

/// The event log of one node
#[derive(Debug)]
pub struct EventLog {
    root: PathBuf,
    alerts_root: PathBuf,
    node_id: String,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(root: impl Into<PathBuf>, alerts_root: impl Into<PathBuf>, node_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            alerts_root: alerts_root.into(),
            node_id: node_id.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Storage path of an event, derived from its timestamp, type and id
    pub fn event_path(&self, event: &Event) -> Result<PathBuf> {
        let ts = parse_rfc3339(&event.timestamp).ok_or_else(|| {
            CoreError::Validation(crate::validation::ValidationError::new(
                "event.timestamp",
                format!("'{}' is not an RFC 3339 timestamp", event.timestamp),
            ))
        })?;
        let safe_type: String = event
            .event_type
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '_' })
            .collect();
        Ok(self
            .day_dir(ts.date_naive())
            .join(format!(
                "{:02}{:02}{:02}-{}-{}.json",
                ts.hour(),
                ts.minute(),
                ts.second(),
                safe_type,
                event.id
            )))
    }

    fn day_dir(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
    }

    /// Persists an event; the file is created once and never replaced
    pub fn write(&self, mut event: Event) -> Result<Event> {
        if event.node_id.is_empty() {
            event.node_id = self.node_id.clone();
        }
        let path = self.event_path(&event)?;

        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(parent) = path.parent() {
            atomic::ensure_dir(parent, DIR_MODE)?;
        }
        atomic::create_json(&path, &event, EVENT_MODE)?;

        increment_counter!("owehost_events_written_total");
        debug!(event_type = %event.event_type, "Recorded event {}", event.id);
        Ok(event)
    }

    /// Matching events, newest first, after skipping `offset`
    pub fn query(&self, filter: &EventFilter, limit: usize, offset: usize) -> Result<Vec<Event>> {
        let from = filter.from.map(|ts| ts.date_naive());
        let to = filter.to.map(|ts| ts.date_naive());

        let mut matched = Vec::new();
        for (date, dir) in self.day_dirs()? {
            if from.map_or(false, |from| date < from) || to.map_or(false, |to| date > to) {
                continue;
            }
            for event in read_day(&dir) {
                let ts = parse_rfc3339(&event.timestamp);
                if filter.matches(&event, ts) {
                    matched.push((ts, event));
                }
            }
        }

        matched.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.id.cmp(&a.1.id)));
        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, event)| event)
            .collect())
    }

    /// Totals and histograms over the last `days` days
    pub fn stats(&self, days: u32) -> Result<EventStats> {
        let since = Utc::now() - Duration::days(i64::from(days));
        let filter = EventFilter {
            from: Some(since),
            ..EventFilter::default()
        };
        let events = self.query(&filter, usize::MAX, 0)?;

        let mut stats = EventStats {
            total: events.len() as u64,
            last_event: events.first().map(|e| e.timestamp.clone()),
            ..EventStats::default()
        };
        for event in &events {
            *stats.by_type.entry(event.event_type.clone()).or_default() += 1;
            *stats.by_result.entry(label(&event.result)).or_default() += 1;
            *stats.by_actor_type.entry(label(&event.actor_type)).or_default() += 1;
        }
        Ok(stats)
    }

    /// Removes day directories older than `keep_days`; returns how many went
    pub fn prune(&self, keep_days: u32) -> Result<usize> {
        let cutoff = Utc::now().date_naive() - Duration::days(i64::from(keep_days));
        let mut removed = 0;
        for (date, dir) in self.day_dirs()? {
            if date < cutoff {
                atomic::remove_dir_if_exists(&dir)?;
                removed += 1;
            }
        }

        // Month then year directories left empty
        for depth in [2, 1] {
            for entry in WalkDir::new(&self.root)
                .min_depth(depth)
                .max_depth(depth)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_dir())
            {
                let empty = fs::read_dir(entry.path())
                    .map(|mut it| it.next().is_none())
                    .unwrap_or(false);
                if empty {
                    if let Err(e) = fs::remove_dir(entry.path()) {
                        warn!("Failed to remove empty directory {}: {}", entry.path().display(), e);
                    }
                }
            }
        }

        if removed > 0 {
            info!("Pruned {} event day directories older than {}", removed, cutoff);
        }
        Ok(removed)
    }

    /// Every `YYYY/MM/DD` directory with a parseable date, oldest first
    fn day_dirs(&self) -> Result<Vec<(NaiveDate, PathBuf)>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut days = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                CoreError::io(&path, e.into())
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            if let Some(date) = parse_day_dir(&self.root, entry.path()) {
                days.push((date, entry.path().to_path_buf()));
            }
        }
        days.sort();
        Ok(days)
    }
}

fn label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn parse_day_dir(root: &Path, dir: &Path) -> Option<NaiveDate> {
    let rel = dir.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel.iter().filter_map(|p| p.to_str()).collect();
    match parts.as_slice() {
        [y, m, d] => NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?),
        _ => None,
    }
}

/// Events stored in one day directory; unreadable files are skipped
fn read_day(dir: &Path) -> Vec<Event> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot list event directory {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match fs::read(&path).map(|bytes| serde_json::from_slice::<Event>(&bytes)) {
            Ok(Ok(event)) => events.push(event),
            Ok(Err(e)) => warn!("Skipping malformed event {}: {}", path.display(), e),
            Err(e) => warn!("Skipping unreadable event {}: {}", path.display(), e),
        }
    }
    events
}
