// src/events/alerts.rs

use std::collections::BTreeMap;
use std::fs;
use std::io;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::events::EventLog;
use crate::model::now_rfc3339;
use crate::store::atomic::{self, DIR_MODE, FILE_MODE};

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// A mutable operator-facing alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// `alrt_` followed by 32 hex characters
    pub id: String,

    pub severity: AlertSeverity,

    pub title: String,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<u32>,

    pub created_at: String,

    #[serde(default)]
    pub resolved: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,

    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: format!("alrt_{}", Uuid::new_v4().simple()),
            severity,
            title: title.into(),
            message: message.into(),
            tenant_id: None,
            created_at: now_rfc3339(),
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            data: BTreeMap::new(),
        }
    }

    pub fn tenant(mut self, tenant_id: u32) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }
}

impl EventLog {
    fn alert_path(&self, id: &str) -> Result<std::path::PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(CoreError::NotFound(format!("alert {}", id)));
        }
        Ok(self.alerts_root.join(format!("{}.json", id)))
    }

    /// Stores a new alert
    pub fn raise_alert(&self, alert: &Alert) -> Result<()> {
        atomic::ensure_dir(&self.alerts_root, DIR_MODE)?;
        atomic::create_json(&self.alert_path(&alert.id)?, alert, FILE_MODE)?;
        warn!(severity = ?alert.severity, "Alert raised: {}", alert.title);
        Ok(())
    }

    pub fn read_alert(&self, id: &str) -> Result<Alert> {
        let path = self.alert_path(id)?;
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CoreError::NotFound(format!("alert {}", id))
            } else {
                CoreError::io(&path, e)
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|e| CoreError::corrupt(&path, e.to_string()))
    }

    /// Alerts ordered newest first
    pub fn list_alerts(&self, include_resolved: bool) -> Result<Vec<Alert>> {
        let entries = match fs::read_dir(&self.alerts_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoreError::io(&self.alerts_root, e)),
        };

        let mut alerts = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match self.read_alert(id) {
                Ok(alert) if include_resolved || !alert.resolved => alerts.push(alert),
                Ok(_) => {}
                Err(e) => warn!("Skipping alert {}: {}", id, e),
            }
        }
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(alerts)
    }

    /// Marks an alert resolved and rewrites its file
    pub fn resolve_alert(&self, id: &str, actor: &str) -> Result<Alert> {
        let mut alert = self.read_alert(id)?;
        if !alert.resolved {
            alert.resolved = true;
            alert.resolved_at = Some(now_rfc3339());
            alert.resolved_by = Some(actor.to_string());
            atomic::write_json(&self.alert_path(id)?, &alert, FILE_MODE)?;
            info!("Alert {} resolved by {}", id, actor);
        }
        Ok(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn raise_list_resolve() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events"), dir.path().join("alerts"), "node-1");

        let alert = Alert::new(AlertSeverity::Critical, "Disk full", "/srv at 99%").tenant(10001);
        log.raise_alert(&alert).unwrap();
        assert_eq!(log.list_alerts(false).unwrap().len(), 1);

        let resolved = log.resolve_alert(&alert.id, "admin").unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("admin"));
        assert!(log.list_alerts(false).unwrap().is_empty());
        assert_eq!(log.list_alerts(true).unwrap().len(), 1);
        assert_eq!(log.read_alert(&alert.id).unwrap(), resolved);
    }

    #[test]
    fn unknown_alert_is_not_found() {
        let dir = tempdir().unwrap();
        let log = EventLog::new(dir.path().join("events"), dir.path().join("alerts"), "node-1");
        assert!(log.resolve_alert("alrt_missing", "admin").unwrap_err().is_not_found());
        assert!(log.read_alert("../escape").unwrap_err().is_not_found());
    }
}
