// src/model/resources.rs

use serde::{Deserialize, Serialize};

use crate::model::Descriptor;
use crate::validation::{self, ValidationError};

/// Origin of a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertType {
    SelfSigned,
    Letsencrypt,
    Custom,
}

/// Outcome of the last renewal attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalResult {
    pub at: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// TLS metadata (`ssl/<domain>/meta.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMeta {
    pub domain: String,

    #[serde(rename = "type")]
    pub cert_type: CertType,

    #[serde(default)]
    pub issuer: String,

    #[serde(default)]
    pub subject: String,

    #[serde(default)]
    pub san: Vec<String>,

    /// Start of validity (RFC 3339)
    #[serde(default)]
    pub not_before: String,

    /// End of validity (RFC 3339)
    #[serde(default)]
    pub not_after: String,

    #[serde(default)]
    pub auto_renew: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_renewal: Option<RenewalResult>,
}

impl Descriptor for TlsMeta {
    const KIND: &'static str = "tls";

    fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_tls_meta(self)
    }
}

/// Database server flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbEngine {
    Mysql,
    Postgres,
    Mariadb,
}

impl DbEngine {
    /// Directory under `databases/` holding this engine's entries
    pub fn dir_name(&self) -> &'static str {
        match self {
            DbEngine::Mysql | DbEngine::Mariadb => "mysql",
            DbEngine::Postgres => "postgres",
        }
    }
}

/// A user granted access to a database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbGrant {
    pub username: String,

    #[serde(default = "default_grant_host")]
    pub host: String,

    #[serde(default)]
    pub privileges: Vec<String>,

    #[serde(default)]
    pub require_ssl: bool,
}

fn default_grant_host() -> String {
    "localhost".to_string()
}

/// Database entry (`databases/<engine-dir>/<name>/meta.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMeta {
    pub name: String,
    pub engine: DbEngine,

    #[serde(default)]
    pub charset: String,

    #[serde(default)]
    pub collation: String,

    #[serde(default)]
    pub size_mb: u64,

    #[serde(default)]
    pub users: Vec<DbGrant>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl DatabaseMeta {
    /// Entry with engine defaults and no grants
    pub fn new(name: impl Into<String>, engine: DbEngine) -> Self {
        let (charset, collation) = match engine {
            DbEngine::Postgres => ("UTF8", "en_US.UTF-8"),
            DbEngine::Mysql | DbEngine::Mariadb => ("utf8mb4", "utf8mb4_unicode_ci"),
        };
        Self {
            name: name.into(),
            engine,
            charset: charset.to_string(),
            collation: collation.to_string(),
            size_mb: 0,
            users: Vec::new(),
            created_at: None,
        }
    }
}

impl Descriptor for DatabaseMeta {
    const KIND: &'static str = "database";

    fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_database(self)
    }
}

/// Cron job (`cron/<id>.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub schedule: String,
    pub command: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Descriptor for CronJob {
    const KIND: &'static str = "cron";

    fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_cron(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cert_type_is_kebab_case() {
        let json = serde_json::to_string(&CertType::SelfSigned).unwrap();
        assert_eq!(json, "\"self-signed\"");
    }

    #[test]
    fn mariadb_shares_the_mysql_directory() {
        assert_eq!(DbEngine::Mariadb.dir_name(), "mysql");
        assert_eq!(DbEngine::Postgres.dir_name(), "postgres");
    }

    #[test]
    fn tls_meta_type_field_is_renamed() {
        let meta: TlsMeta =
            serde_json::from_str(r#"{"domain":"acme.test","type":"custom"}"#).unwrap();
        assert_eq!(meta.cert_type, CertType::Custom);
        assert!(meta.san.is_empty());
    }
}
