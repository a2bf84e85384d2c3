// src/model/account.rs

use std::collections::BTreeMap;
use std::fmt;
use serde::{Deserialize, Serialize};

use crate::model::Descriptor;
use crate::validation::{self, ValidationError};

/// Offset between a tenant id and its POSIX uid/gid
pub const UID_OFFSET: u32 = 10000;

/// Lowest tenant id ever allocated
pub const FIRST_TENANT_ID: u32 = 10001;

/// Sentinel for an unlimited resource
pub const UNLIMITED: i64 = -1;

/// Hosting plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Starter,
    Standard,
    Premium,
    Enterprise,
}

/// Lifecycle state of a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountState {
    /// Created but never applied successfully
    Pending,

    /// Serving traffic
    Active,

    /// Temporarily disabled
    Suspended,

    /// Permanently disabled, data retained
    Terminated,
}

impl fmt::Display for AccountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountState::Pending => "pending",
            AccountState::Active => "active",
            AccountState::Suspended => "suspended",
            AccountState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Immutable identity of a tenant (`account.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Tenant id (>= 10001)
    pub id: u32,

    /// POSIX login name
    pub name: String,

    /// POSIX uid, always `10000 + id`
    pub uid: u32,

    /// POSIX gid, always `10000 + id`
    pub gid: u32,

    /// `admin`, `reseller-<n>` or `partner-<n>`
    pub owner: String,

    /// Hosting plan
    pub plan: Plan,

    /// Node tag the tenant lives on
    #[serde(default)]
    pub node: String,

    /// Creation timestamp (RFC 3339)
    #[serde(default)]
    pub created_at: String,

    /// Lifecycle state
    pub state: AccountState,
}

impl Identity {
    /// Builds an identity with uid/gid derived from the id
    pub fn new(id: u32, name: impl Into<String>, owner: impl Into<String>, plan: Plan) -> Self {
        Self {
            id,
            name: name.into(),
            uid: UID_OFFSET + id,
            gid: UID_OFFSET + id,
            owner: owner.into(),
            plan,
            node: String::new(),
            created_at: String::new(),
            state: AccountState::Pending,
        }
    }

    /// Name of the FastCGI pool user and socket suffix (`a<id>`)
    pub fn pool_user(&self) -> String {
        format!("a{}", self.id)
    }
}

impl Descriptor for Identity {
    const KIND: &'static str = "identity";

    fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_identity(self)
    }
}

/// Resource limits (`limits.json`); `-1` means unlimited
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub disk_mb: i64,
    pub cpu_percent: i64,
    pub ram_mb: i64,
    pub databases: i64,
    pub domains: i64,
    pub subdomains: i64,
    pub email_accounts: i64,
    pub ftp_accounts: i64,
    pub bandwidth_gb: i64,
    pub inodes: i64,
}

impl Limits {
    /// Default limits for a plan
    pub fn preset(plan: Plan) -> Self {
        match plan {
            Plan::Starter => Self {
                disk_mb: 1024,
                cpu_percent: 100,
                ram_mb: 512,
                databases: 1,
                domains: 1,
                subdomains: 5,
                email_accounts: 5,
                ftp_accounts: 1,
                bandwidth_gb: 10,
                inodes: 100_000,
            },
            Plan::Standard => Self {
                disk_mb: 5120,
                cpu_percent: 100,
                ram_mb: 1024,
                databases: 5,
                domains: 5,
                subdomains: 25,
                email_accounts: 25,
                ftp_accounts: 5,
                bandwidth_gb: 100,
                inodes: 250_000,
            },
            Plan::Premium => Self {
                disk_mb: 20480,
                cpu_percent: 200,
                ram_mb: 2048,
                databases: 25,
                domains: 25,
                subdomains: 100,
                email_accounts: 100,
                ftp_accounts: 25,
                bandwidth_gb: 500,
                inodes: 1_000_000,
            },
            Plan::Enterprise => Self {
                disk_mb: 102_400,
                cpu_percent: 400,
                ram_mb: 8192,
                databases: UNLIMITED,
                domains: UNLIMITED,
                subdomains: UNLIMITED,
                email_accounts: UNLIMITED,
                ftp_accounts: UNLIMITED,
                bandwidth_gb: UNLIMITED,
                inodes: UNLIMITED,
            },
        }
    }
}

impl Descriptor for Limits {
    const KIND: &'static str = "limits";

    fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_limits(self)
    }
}

/// Suspension and locking state (`status.json`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub suspended: bool,

    #[serde(default)]
    pub locked: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
}

impl Descriptor for Status {
    const KIND: &'static str = "status";

    fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_status(self)
    }
}

/// Free-form tenant metadata (`metadata.json`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub custom: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Descriptor for Metadata {
    const KIND: &'static str = "metadata";

    fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_metadata(self)
    }
}

/// Panel credentials (`auth.json`, mode 0600)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    /// bcrypt hash
    pub password_hash: String,

    #[serde(default)]
    pub salt: String,

    #[serde(default)]
    pub login_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login: Option<String>,
}

impl Descriptor for Auth {
    const KIND: &'static str = "auth";

    fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_auth(self)
    }
}

/// Combined view of a tenant's core descriptors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub identity: Identity,
    pub limits: Limits,
    pub status: Status,
    pub metadata: Metadata,
}

/// Desired state handed to the applier; absent parts are left as they are
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub identity: Option<Identity>,

    #[serde(default)]
    pub limits: Option<Limits>,

    #[serde(default)]
    pub status: Option<Status>,

    #[serde(default)]
    pub metadata: Option<Metadata>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_new_derives_posix_ids() {
        let identity = Identity::new(10001, "acme", "admin", Plan::Starter);
        assert_eq!(identity.uid, 20001);
        assert_eq!(identity.gid, 20001);
        assert_eq!(identity.pool_user(), "a10001");
    }

    #[test]
    fn default_status_serializes_two_flags() {
        let json = serde_json::to_value(Status::default()).unwrap();
        assert_eq!(json, serde_json::json!({"suspended": false, "locked": false}));
    }

    #[test]
    fn every_preset_is_valid() {
        for plan in [Plan::Starter, Plan::Standard, Plan::Premium, Plan::Enterprise] {
            assert!(Limits::preset(plan).validate().is_ok(), "{:?}", plan);
        }
    }
}
