// src/model/mod.rs

pub mod account;
pub mod event;
pub mod resources;
pub mod site;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::validation::ValidationError;

pub use account::{
    AccountState, Auth, DesiredState, Identity, Limits, Metadata, Plan, Status, Tenant,
    FIRST_TENANT_ID, UID_OFFSET, UNLIMITED,
};
pub use event::{ActorType, Event, EventResult};
pub use resources::{CertType, CronJob, DatabaseMeta, DbEngine, DbGrant, RenewalResult, TlsMeta};
pub use site::{NodeSettings, PhpSettings, PythonSettings, Redirect, Runtime, RuntimeSettings, Site};

/// A small JSON document describing one facet of a tenant or resource
pub trait Descriptor: Serialize + DeserializeOwned {
    /// Short name used in error locators and logs
    const KIND: &'static str;

    /// Checks the invariants of this descriptor
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Current time as an RFC 3339 string with second resolution
pub fn now_rfc3339() -> String {
    format_rfc3339(Utc::now())
}

/// Formats a timestamp the way every descriptor stores it
pub fn format_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses a stored RFC 3339 timestamp
pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
