// src/scanner/mod.rs

//! Reads the on-disk layout back into memory.
//!
//! Scanning never mutates anything. Problems with a single descriptor are
//! recorded in the tenant's snapshot and the scan carries on.

pub mod integrity;

use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{CoreError, ErrorKind, Result};
use crate::host::tls::TlsFiles;
use crate::model::{
    now_rfc3339, CronJob, DatabaseMeta, Identity, Limits, Metadata, Site, Status, TlsMeta,
};
use crate::store::atomic;
use crate::store::{check_cancel, Store};

pub use integrity::{validate_integrity, IntegrityIssue, Severity};

/// A soft error found while scanning one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanError {
    /// What failed, e.g. `identity` or `site:acme.test`
    pub resource: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ScanError {
    fn new(resource: impl Into<String>, err: &CoreError) -> Self {
        Self {
            resource: resource.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// TLS material of one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSnapshot {
    pub domain: String,
    pub has_cert: bool,
    pub has_key: bool,
    pub has_chain: bool,
    pub has_fullchain: bool,

    /// Permission bits of `key.pem` when present
    pub key_mode: Option<u32>,

    pub meta: Option<TlsMeta>,
}

impl TlsSnapshot {
    /// Certificate and key are both present
    pub fn is_complete(&self) -> bool {
        self.has_cert && self.has_key
    }
}

/// Everything the filesystem says about one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSnapshot {
    pub tenant_id: u32,
    pub identity: Option<Identity>,
    pub limits: Option<Limits>,
    pub status: Option<Status>,
    pub metadata: Option<Metadata>,
    pub sites: Vec<Site>,
    pub tls: Vec<TlsSnapshot>,
    pub databases: Vec<DatabaseMeta>,
    pub cron: Vec<CronJob>,
    pub errors: Vec<ScanError>,
}

impl TenantSnapshot {
    fn empty(tenant_id: u32) -> Self {
        Self {
            tenant_id,
            identity: None,
            limits: None,
            status: None,
            metadata: None,
            sites: Vec::new(),
            tls: Vec::new(),
            databases: Vec::new(),
            cron: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Domains of every readable site
    pub fn domains(&self) -> Vec<String> {
        self.sites.iter().map(|site| site.domain.clone()).collect()
    }
}

/// Output of a full or scoped scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub scanned_at: String,
    pub tenants: Vec<TenantSnapshot>,
}

impl ScanResult {
    /// Soft errors across every tenant
    pub fn error_count(&self) -> usize {
        self.tenants.iter().map(|t| t.errors.len()).sum()
    }
}

/// Walks tenants under the shared side of their locks
#[derive(Debug, Clone)]
pub struct Scanner {
    store: Arc<Store>,
}

impl Scanner {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Scans one tenant, or all of them when `tenant_id` is `None`
    pub async fn scan(&self, tenant_id: Option<u32>, token: &CancellationToken) -> Result<ScanResult> {
        match tenant_id {
            Some(id) => Ok(ScanResult {
                scanned_at: now_rfc3339(),
                tenants: vec![self.scan_tenant(id, token).await?],
            }),
            None => self.scan_all(token).await,
        }
    }

    /// Scans every tenant; only failing to list the root is fatal
    pub async fn scan_all(&self, token: &CancellationToken) -> Result<ScanResult> {
        let scanned_at = now_rfc3339();
        let ids = self.store.list_tenants()?;
        let mut tenants = Vec::with_capacity(ids.len());
        for id in ids {
            match self.scan_tenant(id, token).await {
                Ok(snapshot) => tenants.push(snapshot),
                // Deleted between listing and scanning
                Err(CoreError::NotFound(_)) => debug!(tenant_id = id, "Tenant vanished during scan"),
                Err(e) => return Err(e),
            }
        }
        let result = ScanResult { scanned_at, tenants };
        info!(
            tenants = result.tenants.len(),
            errors = result.error_count(),
            "Scan complete"
        );
        Ok(result)
    }

    /// Snapshot of one tenant
    pub async fn scan_tenant(&self, tenant_id: u32, token: &CancellationToken) -> Result<TenantSnapshot> {
        check_cancel(token)?;
        let _guard = self.store.locks().shared(tenant_id).await;
        if !self.store.exists_tenant(tenant_id) {
            return Err(CoreError::NotFound(format!("tenant {}", tenant_id)));
        }

        let store = &self.store;
        let mut snapshot = TenantSnapshot::empty(tenant_id);

        match store.read_identity(tenant_id) {
            Ok(identity) => snapshot.identity = Some(identity),
            Err(e) => snapshot.errors.push(ScanError::new("identity", &e)),
        }
        match store.read_limits(tenant_id) {
            Ok(limits) => snapshot.limits = limits,
            Err(e) => snapshot.errors.push(ScanError::new("limits", &e)),
        }
        match store.read_status(tenant_id) {
            Ok(status) => snapshot.status = status,
            Err(e) => snapshot.errors.push(ScanError::new("status", &e)),
        }
        match store.read_metadata(tenant_id) {
            Ok(metadata) => snapshot.metadata = metadata,
            Err(e) => snapshot.errors.push(ScanError::new("metadata", &e)),
        }

        check_cancel(token)?;
        for domain in store.list_sites(tenant_id)? {
            match store.read_site(tenant_id, &domain) {
                Ok(site) => snapshot.sites.push(site),
                Err(e) => snapshot.errors.push(ScanError::new(format!("site:{}", domain), &e)),
            }
        }

        for domain in store.list_tls_domains(tenant_id)? {
            let tls = self.scan_tls(tenant_id, &domain, &mut snapshot.errors);
            snapshot.tls.push(tls);
        }

        check_cancel(token)?;
        for entry in store.list_databases(tenant_id)? {
            let resource = format!("database:{}/{}", entry.engine_dir, entry.name);
            let meta = match store.read_database_meta(tenant_id, &entry) {
                Ok(Some(meta)) => meta,
                Ok(None) => DatabaseMeta::new(entry.name.clone(), entry.default_engine()),
                Err(e) => {
                    snapshot.errors.push(ScanError::new(resource, &e));
                    DatabaseMeta::new(entry.name.clone(), entry.default_engine())
                }
            };
            snapshot.databases.push(meta);
        }

        for job_id in store.list_cron_jobs(tenant_id)? {
            match store.read_cron_job(tenant_id, &job_id) {
                Ok(job) => snapshot.cron.push(job),
                Err(e) => snapshot.errors.push(ScanError::new(format!("cron:{}", job_id), &e)),
            }
        }

        debug!(
            tenant_id,
            sites = snapshot.sites.len(),
            tls = snapshot.tls.len(),
            databases = snapshot.databases.len(),
            errors = snapshot.errors.len(),
            "Scanned tenant"
        );
        Ok(snapshot)
    }

    fn scan_tls(&self, tenant_id: u32, domain: &str, errors: &mut Vec<ScanError>) -> TlsSnapshot {
        let files = TlsFiles::new(self.store.layout().ssl_dir(tenant_id, domain));
        let resource = format!("tls:{}", domain);

        let meta = match self.store.read_tls_meta(tenant_id, domain) {
            Ok(meta) => meta,
            Err(e) => {
                errors.push(ScanError::new(resource.clone(), &e));
                None
            }
        };

        let snapshot = TlsSnapshot {
            domain: domain.to_string(),
            has_cert: files.cert.is_file(),
            has_key: files.key.is_file(),
            has_chain: files.chain.is_file(),
            has_fullchain: files.fullchain.is_file(),
            key_mode: atomic::file_mode(&files.key).ok(),
            meta,
        };

        if snapshot.has_cert != snapshot.has_key {
            let missing = if snapshot.has_cert { "key.pem" } else { "cert.pem" };
            errors.push(ScanError {
                resource,
                kind: ErrorKind::Corrupt,
                message: format!("incomplete TLS material: {} missing", missing),
            });
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use crate::config::PathsConfig;
    use crate::model::{AccountState, CronJob, DbEngine, Plan, Runtime};
    use crate::store::Layout;
    use tempfile::tempdir;

    fn store(base: &std::path::Path) -> Arc<Store> {
        Arc::new(Store::new(Layout::new(PathsConfig::under(base))))
    }

    fn seed(store: &Store, id: u32, name: &str) {
        store.create_tenant_skeleton(id).unwrap();
        let mut identity = Identity::new(id, name, "admin", Plan::Starter);
        identity.state = AccountState::Active;
        store.write_identity(&identity).unwrap();
        store.write_limits(id, &Limits::preset(Plan::Starter)).unwrap();
    }

    #[tokio::test]
    async fn collects_every_resource_kind() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        seed(&store, 10001, "acme");
        store
            .write_site(10001, &Site::new("acme.test", Runtime::Static))
            .unwrap();
        store
            .write_database_meta(10001, &DatabaseMeta::new("shop", DbEngine::Mariadb))
            .unwrap();
        fs::create_dir_all(store.layout().database_dir(10001, DbEngine::Postgres, "bare")).unwrap();
        store
            .write_cron_job(
                10001,
                &CronJob {
                    id: "nightly".into(),
                    schedule: "0 3 * * *".into(),
                    command: "php artisan schedule:run".into(),
                    enabled: true,
                },
            )
            .unwrap();

        let snapshot = Scanner::new(store)
            .scan_tenant(10001, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(snapshot.identity.as_ref().map(|i| i.name.as_str()), Some("acme"));
        assert_eq!(snapshot.domains(), vec!["acme.test".to_string()]);
        assert_eq!(snapshot.databases.len(), 2);
        assert_eq!(snapshot.databases[0].engine, DbEngine::Mariadb);
        assert_eq!(snapshot.databases[1].name, "bare");
        assert_eq!(snapshot.databases[1].engine, DbEngine::Postgres);
        assert_eq!(snapshot.cron.len(), 1);
        assert!(snapshot.errors.is_empty(), "{:?}", snapshot.errors);
    }

    #[tokio::test]
    async fn soft_errors_do_not_abort() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        seed(&store, 10001, "acme");
        seed(&store, 10002, "beta");
        fs::write(store.layout().tenant_file(10002, "account.json"), "{not json").unwrap();
        let ssl = store.layout().ssl_dir(10001, "acme.test");
        fs::create_dir_all(&ssl).unwrap();
        fs::write(ssl.join("cert.pem"), "x").unwrap();

        let result = Scanner::new(store).scan_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.tenants.len(), 2);

        let acme = &result.tenants[0];
        assert_eq!(acme.tls.len(), 1);
        assert!(acme.tls[0].has_cert && !acme.tls[0].has_key);
        assert_eq!(acme.errors.len(), 1);
        assert!(acme.errors[0].message.contains("key.pem missing"));

        let beta = &result.tenants[1];
        assert!(beta.identity.is_none());
        assert_eq!(beta.errors[0].resource, "identity");
        assert_eq!(beta.errors[0].kind, ErrorKind::Corrupt);
    }

    #[tokio::test]
    async fn missing_tenant_is_not_found() {
        let dir = tempdir().unwrap();
        let err = Scanner::new(store(dir.path()))
            .scan_tenant(10001, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn scan_does_not_mutate() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        seed(&store, 10001, "acme");
        let before = fs::read(store.layout().tenant_file(10001, "account.json")).unwrap();
        Scanner::new(store.clone())
            .scan(None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fs::read(store.layout().tenant_file(10001, "account.json")).unwrap(), before);
        assert!(!store.layout().tenant_file(10001, "status.json").exists());
    }
}
