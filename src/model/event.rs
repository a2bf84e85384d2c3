// src/model/event.rs

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::now_rfc3339;

/// Kind of principal that caused an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    System,
    Admin,
    Reseller,
    User,
    Api,
}

/// Result recorded on an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventResult {
    Success,
    Failed,
    Pending,
}

/// Immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// `evt_` followed by 32 hex characters
    pub id: String,

    /// Dotted type such as `account.create`
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<u32>,

    /// Actor id or `system`
    pub actor: String,

    pub actor_type: ActorType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_ip: Option<String>,

    /// RFC 3339, second resolution
    pub timestamp: String,

    #[serde(default)]
    pub data: BTreeMap<String, Value>,

    pub result: EventResult,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default)]
    pub node_id: String,
}

impl Event {
    /// New successful event stamped with the current time
    pub fn new(event_type: impl Into<String>, actor: impl Into<String>) -> Self {
        let actor = actor.into();
        let actor_type = if actor == "system" {
            ActorType::System
        } else if actor == "admin" {
            ActorType::Admin
        } else if actor.starts_with("reseller") {
            ActorType::Reseller
        } else {
            ActorType::User
        };

        Self {
            id: new_event_id(),
            event_type: event_type.into(),
            tenant_id: None,
            actor,
            actor_type,
            actor_ip: None,
            timestamp: now_rfc3339(),
            data: BTreeMap::new(),
            result: EventResult::Success,
            error: None,
            duration_ms: 0,
            request_id: None,
            node_id: String::new(),
        }
    }

    pub fn tenant(mut self, tenant_id: u32) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Marks the event failed with an error message
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.result = EventResult::Failed;
        self.error = Some(error.into());
        self
    }

    pub fn pending(mut self) -> Self {
        self.result = EventResult::Pending;
        self
    }
}

/// Generates a fresh event id
pub fn new_event_id() -> String {
    format!("evt_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_hex() {
        let id = new_event_id();
        assert!(id.starts_with("evt_"));
        assert_eq!(id.len(), 36);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn actor_type_is_inferred() {
        assert_eq!(Event::new("x.y", "system").actor_type, ActorType::System);
        assert_eq!(Event::new("x.y", "admin").actor_type, ActorType::Admin);
        assert_eq!(Event::new("x.y", "reseller-4").actor_type, ActorType::Reseller);
    }

    #[test]
    fn failed_sets_result_and_error() {
        let event = Event::new("account.create", "admin").tenant(10001).failed("boom");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "account.create");
        assert_eq!(json["result"], "failed");
        assert_eq!(json["error"], "boom");
        assert_eq!(json["tenant_id"], 10001);
    }
}
