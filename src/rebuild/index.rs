// src/rebuild/index.rs

//! External index seams and a file-backed implementation.
//!
//! The index is a derived copy of the filesystem. A relational database sits
//! behind these traits in production; `JsonIndex` keeps the same records in a
//! single JSON document for recovery nodes without one.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CoreError;
use crate::model::{AccountState, CertType, DatabaseMeta, DbEngine, Identity, Plan, Site, Status, TlsMeta};
use crate::scanner::TlsSnapshot;
use crate::store::atomic::{self, DIR_MODE, FILE_MODE};
use crate::validation::ValidationError;

/// Errors raised by an index backend
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index unavailable: {0}")]
    Unavailable(String),

    #[error("Index rejected {resource}: {message}")]
    Rejected { resource: String, message: String },

    #[error(transparent)]
    Store(#[from] CoreError),
}

impl From<IndexError> for CoreError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Unavailable(message) => CoreError::Io {
                path: PathBuf::from("index"),
                source: io::Error::new(io::ErrorKind::Other, message),
            },
            IndexError::Rejected { resource, message } => {
                CoreError::Validation(ValidationError::new(resource, message))
            }
            IndexError::Store(err) => err,
        }
    }
}

/// Index row for a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: u32,
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub owner: String,
    pub plan: Plan,
    pub state: AccountState,
    pub suspended: bool,
    pub locked: bool,
}

impl TenantRecord {
    pub fn new(identity: &Identity, status: Option<&Status>) -> Self {
        Self {
            id: identity.id,
            name: identity.name.clone(),
            uid: identity.uid,
            gid: identity.gid,
            owner: identity.owner.clone(),
            plan: identity.plan,
            state: identity.state,
            suspended: status.map_or(false, |s| s.suspended),
            locked: status.map_or(false, |s| s.locked),
        }
    }
}

/// Index row for a site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub tenant_id: u32,
    pub domain: String,
    pub runtime: String,
    pub document_root: String,
    pub ssl: bool,
}

impl DomainRecord {
    pub fn new(tenant_id: u32, site: &Site) -> Self {
        Self {
            tenant_id,
            domain: site.domain.clone(),
            runtime: site.runtime.to_string(),
            document_root: site.document_root.clone(),
            ssl: site.ssl,
        }
    }
}

/// Index row for a certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsRecord {
    pub tenant_id: u32,
    pub domain: String,
    pub cert_type: Option<CertType>,
    pub issuer: String,
    pub not_after: String,
    pub has_chain: bool,
}

impl TlsRecord {
    pub fn new(tenant_id: u32, tls: &TlsSnapshot) -> Self {
        let meta: Option<&TlsMeta> = tls.meta.as_ref();
        Self {
            tenant_id,
            domain: tls.domain.clone(),
            cert_type: meta.map(|m| m.cert_type),
            issuer: meta.map(|m| m.issuer.clone()).unwrap_or_default(),
            not_after: meta.map(|m| m.not_after.clone()).unwrap_or_default(),
            has_chain: tls.has_chain,
        }
    }
}

/// Index row for a database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub tenant_id: u32,
    pub name: String,
    pub engine: DbEngine,
    pub users: Vec<String>,
}

impl DatabaseRecord {
    pub fn new(tenant_id: u32, meta: &DatabaseMeta) -> Self {
        Self {
            tenant_id,
            name: meta.name.clone(),
            engine: meta.engine,
            users: meta.users.iter().map(|grant| grant.username.clone()).collect(),
        }
    }
}

/// Write side of the external index
#[async_trait]
pub trait DatabaseWriter: Send + Sync {
    /// Inserts or updates a tenant. Returns whether the stored row changed;
    /// with `force` the row is rewritten even when equal.
    async fn upsert_tenant(&self, record: &TenantRecord, force: bool) -> Result<bool, IndexError>;

    async fn upsert_domain(&self, record: &DomainRecord) -> Result<(), IndexError>;

    async fn upsert_tls(&self, record: &TlsRecord) -> Result<(), IndexError>;

    async fn upsert_database(&self, record: &DatabaseRecord) -> Result<(), IndexError>;

    /// Drops domain and certificate rows of a tenant whose domain is not in
    /// `current_domains`. Returns how many rows went.
    async fn delete_stale_records(&self, tenant_id: u32, current_domains: &[String]) -> Result<usize, IndexError>;

    /// Drops database rows of a tenant whose name is not in `current`.
    /// Backends that keep no database rows leave the default.
    async fn delete_stale_databases(&self, _tenant_id: u32, _current: &[String]) -> Result<usize, IndexError> {
        Ok(0)
    }

    /// Drops every tenant not in `current` together with its domain,
    /// certificate and database rows
    async fn delete_stale_tenants(&self, _current: &[u32]) -> Result<usize, IndexError> {
        Ok(0)
    }
}

/// Read side of the external index
#[async_trait]
pub trait IndexReader: Send + Sync {
    async fn tenants(&self) -> Result<Vec<TenantRecord>, IndexError>;

    async fn domains(&self, tenant_id: u32) -> Result<Vec<DomainRecord>, IndexError>;

    async fn databases(&self, tenant_id: u32) -> Result<Vec<DatabaseRecord>, IndexError>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct IndexData {
    #[serde(default)]
    tenants: BTreeMap<u32, TenantRecord>,

    /// Keyed by `<tenant>/<domain>`
    #[serde(default)]
    domains: BTreeMap<String, DomainRecord>,

    #[serde(default)]
    tls: BTreeMap<String, TlsRecord>,

    #[serde(default)]
    databases: BTreeMap<String, DatabaseRecord>,
}

fn key(tenant_id: u32, name: &str) -> String {
    format!("{}/{}", tenant_id, name)
}

/// Index kept in one JSON file, rewritten atomically on `flush`
#[derive(Debug)]
pub struct JsonIndex {
    path: PathBuf,
    data: Mutex<IndexData>,
}

impl JsonIndex {
    /// Opens the index at `path`; a missing file is an empty index
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| CoreError::corrupt(&path, e.to_string()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => IndexData::default(),
            Err(e) => return Err(CoreError::io(&path, e).into()),
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(path: &Path) -> bool {
        path.is_file()
    }

    /// Writes the current records to disk
    pub async fn flush(&self) -> Result<(), IndexError> {
        let data = self.data.lock().await;
        if let Some(parent) = self.path.parent() {
            atomic::ensure_dir(parent, DIR_MODE)?;
        }
        atomic::write_json(&self.path, &*data, FILE_MODE)?;
        debug!(path = %self.path.display(), tenants = data.tenants.len(), "Flushed index");
        Ok(())
    }

    pub async fn tls_records(&self, tenant_id: u32) -> Vec<TlsRecord> {
        let data = self.data.lock().await;
        data.tls.values().filter(|r| r.tenant_id == tenant_id).cloned().collect()
    }

    pub async fn database_records(&self, tenant_id: u32) -> Vec<DatabaseRecord> {
        let data = self.data.lock().await;
        data.databases
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DatabaseWriter for JsonIndex {
    async fn upsert_tenant(&self, record: &TenantRecord, force: bool) -> Result<bool, IndexError> {
        let mut data = self.data.lock().await;
        if !force && data.tenants.get(&record.id) == Some(record) {
            return Ok(false);
        }
        data.tenants.insert(record.id, record.clone());
        Ok(true)
    }

    async fn upsert_domain(&self, record: &DomainRecord) -> Result<(), IndexError> {
        let mut data = self.data.lock().await;
        if let Some(existing) = data.domains.values().find(|r| r.domain == record.domain) {
            if existing.tenant_id != record.tenant_id {
                return Err(IndexError::Rejected {
                    resource: format!("domain:{}", record.domain),
                    message: format!("already indexed for tenant {}", existing.tenant_id),
                });
            }
        }
        data.domains.insert(key(record.tenant_id, &record.domain), record.clone());
        Ok(())
    }

    async fn upsert_tls(&self, record: &TlsRecord) -> Result<(), IndexError> {
        let mut data = self.data.lock().await;
        data.tls.insert(key(record.tenant_id, &record.domain), record.clone());
        Ok(())
    }

    async fn upsert_database(&self, record: &DatabaseRecord) -> Result<(), IndexError> {
        let mut data = self.data.lock().await;
        data.databases.insert(key(record.tenant_id, &record.name), record.clone());
        Ok(())
    }

    async fn delete_stale_records(&self, tenant_id: u32, current_domains: &[String]) -> Result<usize, IndexError> {
        let mut data = self.data.lock().await;
        let stale = |tid: u32, domain: &str| tid == tenant_id && !current_domains.iter().any(|d| d == domain);

        let before = data.domains.len() + data.tls.len();
        data.domains.retain(|_, r| !stale(r.tenant_id, &r.domain));
        data.tls.retain(|_, r| !stale(r.tenant_id, &r.domain));
        Ok(before - data.domains.len() - data.tls.len())
    }

    async fn delete_stale_databases(&self, tenant_id: u32, current: &[String]) -> Result<usize, IndexError> {
        let mut data = self.data.lock().await;
        let before = data.databases.len();
        data.databases
            .retain(|_, r| r.tenant_id != tenant_id || current.iter().any(|name| *name == r.name));
        Ok(before - data.databases.len())
    }

    async fn delete_stale_tenants(&self, current: &[u32]) -> Result<usize, IndexError> {
        let mut data = self.data.lock().await;
        let keep = |tenant_id: &u32| current.contains(tenant_id);

        let before = data.tenants.len() + data.domains.len() + data.tls.len() + data.databases.len();
        data.tenants.retain(|id, _| keep(id));
        data.domains.retain(|_, r| keep(&r.tenant_id));
        data.tls.retain(|_, r| keep(&r.tenant_id));
        data.databases.retain(|_, r| keep(&r.tenant_id));
        Ok(before - data.tenants.len() - data.domains.len() - data.tls.len() - data.databases.len())
    }
}

#[async_trait]
impl IndexReader for JsonIndex {
    async fn tenants(&self) -> Result<Vec<TenantRecord>, IndexError> {
        Ok(self.data.lock().await.tenants.values().cloned().collect())
    }

    async fn domains(&self, tenant_id: u32) -> Result<Vec<DomainRecord>, IndexError> {
        let data = self.data.lock().await;
        Ok(data
            .domains
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn databases(&self, tenant_id: u32) -> Result<Vec<DatabaseRecord>, IndexError> {
        Ok(self.database_records(tenant_id).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Runtime;
    use tempfile::tempdir;

    fn tenant(state: AccountState) -> TenantRecord {
        let mut identity = Identity::new(10001, "acme", "admin", Plan::Starter);
        identity.state = state;
        TenantRecord::new(&identity, None)
    }

    #[tokio::test]
    async fn equal_tenant_is_not_rewritten_unless_forced() {
        let dir = tempdir().unwrap();
        let index = JsonIndex::open(dir.path().join("index.json")).unwrap();
        let record = tenant(AccountState::Active);

        assert!(index.upsert_tenant(&record, false).await.unwrap());
        assert!(!index.upsert_tenant(&record, false).await.unwrap());
        assert!(index.upsert_tenant(&record, true).await.unwrap());
        assert!(index.upsert_tenant(&tenant(AccountState::Suspended), false).await.unwrap());
    }

    #[tokio::test]
    async fn stale_domains_and_certificates_are_dropped() {
        let dir = tempdir().unwrap();
        let index = JsonIndex::open(dir.path().join("index.json")).unwrap();
        for domain in ["a.test", "b.test"] {
            index
                .upsert_domain(&DomainRecord::new(10001, &Site::new(domain, Runtime::Static)))
                .await
                .unwrap();
        }
        index
            .upsert_tls(&TlsRecord {
                tenant_id: 10001,
                domain: "b.test".into(),
                cert_type: None,
                issuer: String::new(),
                not_after: String::new(),
                has_chain: false,
            })
            .await
            .unwrap();

        let removed = index
            .delete_stale_records(10001, &["a.test".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        let domains = index.domains(10001).await.unwrap();
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].domain, "a.test");
    }

    #[tokio::test]
    async fn stale_databases_and_tenants_are_dropped() {
        let dir = tempdir().unwrap();
        let index = JsonIndex::open(dir.path().join("index.json")).unwrap();
        index.upsert_tenant(&tenant(AccountState::Active), false).await.unwrap();
        let mut other = Identity::new(10002, "globex", "admin", Plan::Starter);
        other.state = AccountState::Active;
        index.upsert_tenant(&TenantRecord::new(&other, None), false).await.unwrap();
        for (tenant_id, name) in [(10001, "shop"), (10001, "blog"), (10002, "crm")] {
            index
                .upsert_database(&DatabaseRecord::new(tenant_id, &DatabaseMeta::new(name, DbEngine::Mysql)))
                .await
                .unwrap();
        }
        index
            .upsert_domain(&DomainRecord::new(10002, &Site::new("globex.test", Runtime::Static)))
            .await
            .unwrap();

        assert_eq!(index.delete_stale_databases(10001, &["shop".to_string()]).await.unwrap(), 1);
        let names: Vec<String> = index.database_records(10001).await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["shop"]);
        assert_eq!(index.database_records(10002).await.len(), 1);

        // Tenant row, domain and database of 10002 all go
        assert_eq!(index.delete_stale_tenants(&[10001]).await.unwrap(), 3);
        assert_eq!(index.tenants().await.unwrap(), vec![tenant(AccountState::Active)]);
        assert!(index.domains(10002).await.unwrap().is_empty());
        assert!(index.databases(10002).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn domain_owned_by_another_tenant_is_rejected() {
        let dir = tempdir().unwrap();
        let index = JsonIndex::open(dir.path().join("index.json")).unwrap();
        let site = Site::new("shared.test", Runtime::Static);
        index.upsert_domain(&DomainRecord::new(10001, &site)).await.unwrap();
        let err = index.upsert_domain(&DomainRecord::new(10002, &site)).await.unwrap_err();
        assert!(matches!(err, IndexError::Rejected { .. }));
    }

    #[tokio::test]
    async fn flush_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index").join("index.json");
        let index = JsonIndex::open(&path).unwrap();
        index.upsert_tenant(&tenant(AccountState::Active), false).await.unwrap();
        index.flush().await.unwrap();

        let reopened = JsonIndex::open(&path).unwrap();
        assert_eq!(reopened.tenants().await.unwrap(), vec![tenant(AccountState::Active)]);
    }

    #[test]
    fn unparseable_index_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, "[").unwrap();
        let err: CoreError = JsonIndex::open(&path).unwrap_err().into();
        assert_eq!(err.kind(), crate::error::ErrorKind::Corrupt);
    }
}
