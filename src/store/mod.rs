// src/store/mod.rs

//! Filesystem-authoritative state store.
//!
//! Every tenant owns `a-<id>` under the accounts root. Descriptors are small
//! JSON files written through [`atomic`]; reads decode and validate them.

pub mod atomic;
pub mod layout;
pub mod locks;

use std::fs;
use std::io;
use std::path::Path;
use serde_json::error::Category;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::model::{
    Auth, CronJob, DatabaseMeta, DbEngine, Descriptor, Identity, Limits, Metadata, Site, Status,
    Tenant, TlsMeta, FIRST_TENANT_ID,
};
use crate::validation::ValidationError;

pub use layout::Layout;
pub use locks::TenantLocks;

use atomic::{DIR_MODE, FILE_MODE, SECRET_MODE, SSL_DIR_MODE};
use layout::{
    parse_tenant_dir_name, ACCOUNT_FILE, AUTH_FILE, LIMITS_FILE, METADATA_FILE, META_FILE,
    SITE_SUBDIRS, SKELETON, STATUS_FILE,
};

/// Database directory found under `databases/<engine-dir>/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseEntry {
    /// `mysql` or `postgres`
    pub engine_dir: String,
    pub name: String,
}

impl DatabaseEntry {
    /// Engine implied by the directory when no descriptor says otherwise
    pub fn default_engine(&self) -> DbEngine {
        if self.engine_dir == "postgres" {
            DbEngine::Postgres
        } else {
            DbEngine::Mysql
        }
    }
}

/// Returns `Aborted` once cancellation has been requested
pub fn check_cancel(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(CoreError::Aborted)
    } else {
        Ok(())
    }
}

/// Typed access to tenant descriptors and directory lifecycle
#[derive(Debug)]
pub struct Store {
    layout: Layout,
    locks: TenantLocks,
}

impl Store {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            locks: TenantLocks::new(),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn locks(&self) -> &TenantLocks {
        &self.locks
    }

    /// Reads, decodes and validates a descriptor
    pub fn read_descriptor<T: Descriptor>(&self, path: &Path) -> Result<T> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(CoreError::io(path, e)),
        };
        decode(path, &bytes)
    }

    /// Like [`Store::read_descriptor`] but absence is `None`
    pub fn read_optional<T: Descriptor>(&self, path: &Path) -> Result<Option<T>> {
        match self.read_descriptor(path) {
            Ok(value) => Ok(Some(value)),
            Err(CoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Validates then atomically writes a descriptor
    pub fn write_descriptor<T: Descriptor>(&self, path: &Path, value: &T, mode: u32) -> Result<()> {
        value.validate()?;
        atomic::write_json(path, value, mode)
    }

    pub fn exists_tenant(&self, tenant_id: u32) -> bool {
        self.layout.tenant_dir(tenant_id).is_dir()
    }

    /// Fails with `NotFound` when the accounts root is missing or unmounted
    pub fn require_accounts_root(&self) -> Result<()> {
        let root = self.layout.accounts_root();
        if root.is_dir() {
            Ok(())
        } else {
            Err(CoreError::NotFound(format!("accounts root {}", root.display())))
        }
    }

    /// Ids of every `a-<int>` directory, ascending; other entries are skipped
    pub fn list_tenants(&self) -> Result<Vec<u32>> {
        let root = self.layout.accounts_root();
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoreError::io(root, e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CoreError::io(root, e))?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(parse_tenant_dir_name) else {
                debug!("Skipping non-tenant entry {:?}", name);
                continue;
            };
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Highest existing id plus one, never below 10001
    pub fn next_tenant_id(&self) -> Result<u32> {
        let max = self.list_tenants()?.into_iter().max();
        Ok(match max {
            Some(id) if id >= FIRST_TENANT_ID => id + 1,
            _ => FIRST_TENANT_ID,
        })
    }

    /// Finds the tenant currently holding a name
    pub fn find_tenant_by_name(&self, name: &str) -> Result<Option<u32>> {
        for id in self.list_tenants()? {
            match self.read_optional::<Identity>(&self.layout.tenant_file(id, ACCOUNT_FILE)) {
                Ok(Some(identity)) if identity.name == name => return Ok(Some(id)),
                Ok(_) => {}
                Err(e) => warn!(tenant_id = id, "Unreadable identity while checking names: {}", e),
            }
        }
        Ok(None)
    }

    pub fn read_identity(&self, tenant_id: u32) -> Result<Identity> {
        let path = self.layout.tenant_file(tenant_id, ACCOUNT_FILE);
        let identity: Identity = self.read_descriptor(&path)?;
        if identity.id != tenant_id {
            return Err(CoreError::corrupt(
                &path,
                format!("identity id {} does not match directory", identity.id),
            ));
        }
        Ok(identity)
    }

    pub fn write_identity(&self, identity: &Identity) -> Result<()> {
        let path = self.layout.tenant_file(identity.id, ACCOUNT_FILE);
        self.write_descriptor(&path, identity, FILE_MODE)
    }

    pub fn read_limits(&self, tenant_id: u32) -> Result<Option<Limits>> {
        self.read_optional(&self.layout.tenant_file(tenant_id, LIMITS_FILE))
    }

    pub fn write_limits(&self, tenant_id: u32, limits: &Limits) -> Result<()> {
        let path = self.layout.tenant_file(tenant_id, LIMITS_FILE);
        self.write_descriptor(&path, limits, FILE_MODE)
    }

    pub fn read_status(&self, tenant_id: u32) -> Result<Option<Status>> {
        self.read_optional(&self.layout.tenant_file(tenant_id, STATUS_FILE))
    }

    pub fn write_status(&self, tenant_id: u32, status: &Status) -> Result<()> {
        let path = self.layout.tenant_file(tenant_id, STATUS_FILE);
        self.write_descriptor(&path, status, FILE_MODE)
    }

    pub fn read_metadata(&self, tenant_id: u32) -> Result<Option<Metadata>> {
        self.read_optional(&self.layout.tenant_file(tenant_id, METADATA_FILE))
    }

    pub fn write_metadata(&self, tenant_id: u32, metadata: &Metadata) -> Result<()> {
        let path = self.layout.tenant_file(tenant_id, METADATA_FILE);
        self.write_descriptor(&path, metadata, FILE_MODE)
    }

    pub fn read_auth(&self, tenant_id: u32) -> Result<Option<Auth>> {
        self.read_optional(&self.layout.tenant_file(tenant_id, AUTH_FILE))
    }

    pub fn write_auth(&self, tenant_id: u32, auth: &Auth) -> Result<()> {
        let path = self.layout.tenant_file(tenant_id, AUTH_FILE);
        self.write_descriptor(&path, auth, SECRET_MODE)
    }

    /// Identity plus limits, status and metadata; only identity is required
    pub fn read_tenant(&self, tenant_id: u32) -> Result<Tenant> {
        let identity = self.read_identity(tenant_id)?;
        let limits = self
            .read_limits(tenant_id)?
            .unwrap_or_else(|| Limits::preset(identity.plan));
        Ok(Tenant {
            limits,
            status: self.read_status(tenant_id)?.unwrap_or_default(),
            metadata: self.read_metadata(tenant_id)?.unwrap_or_default(),
            identity,
        })
    }

    /// [`Store::read_tenant`] under the tenant's shared lock
    pub async fn load_tenant(&self, tenant_id: u32, token: &CancellationToken) -> Result<Tenant> {
        check_cancel(token)?;
        let _guard = self.locks.shared(tenant_id).await;
        self.read_tenant(tenant_id)
    }

    /// Creates the tenant directory and the standard subdirectories
    pub fn create_tenant_skeleton(&self, tenant_id: u32) -> Result<()> {
        let dir = self.layout.tenant_dir(tenant_id);
        let created = !dir.exists();
        atomic::ensure_dir(&dir, DIR_MODE)?;
        for (sub, mode) in SKELETON {
            atomic::ensure_dir(&dir.join(sub), *mode)?;
        }
        if created {
            info!(tenant_id, "Created tenant skeleton at {}", dir.display());
        }
        Ok(())
    }

    /// Recursively removes the tenant directory. Returns whether it existed.
    pub fn delete_tenant_skeleton(&self, tenant_id: u32) -> Result<bool> {
        let dir = self.layout.tenant_dir(tenant_id);
        let removed = atomic::remove_dir_if_exists(&dir)?;
        if removed {
            info!(tenant_id, "Removed tenant directory {}", dir.display());
        }
        Ok(removed)
    }

    /// Domains under `web/` that carry a `site.json`
    pub fn list_sites(&self, tenant_id: u32) -> Result<Vec<String>> {
        let web = self.layout.web_dir(tenant_id);
        Ok(list_subdirs(&web)?
            .into_iter()
            .filter(|domain| web.join(domain).join(layout::SITE_FILE).is_file())
            .collect())
    }

    pub fn read_site(&self, tenant_id: u32, domain: &str) -> Result<Site> {
        let path = self.layout.site_file(tenant_id, domain);
        let site: Site = self.read_descriptor(&path)?;
        if site.domain != domain {
            return Err(CoreError::corrupt(
                &path,
                format!("site domain {} does not match directory", site.domain),
            ));
        }
        Ok(site)
    }

    /// Writes `site.json`, creating the site directory and its fixed subdirectories
    pub fn write_site(&self, tenant_id: u32, site: &Site) -> Result<()> {
        site.validate()?;
        let dir = self.layout.site_dir(tenant_id, &site.domain);
        atomic::ensure_dir(&dir, DIR_MODE)?;
        for sub in SITE_SUBDIRS {
            atomic::ensure_dir(&dir.join(sub), DIR_MODE)?;
        }
        self.write_descriptor(&self.layout.site_file(tenant_id, &site.domain), site, FILE_MODE)
    }

    pub fn delete_site_dir(&self, tenant_id: u32, domain: &str) -> Result<bool> {
        atomic::remove_dir_if_exists(&self.layout.site_dir(tenant_id, domain))
    }

    /// Domains with a directory under `ssl/`
    pub fn list_tls_domains(&self, tenant_id: u32) -> Result<Vec<String>> {
        list_subdirs(&self.layout.ssl_root(tenant_id))
    }

    pub fn read_tls_meta(&self, tenant_id: u32, domain: &str) -> Result<Option<TlsMeta>> {
        self.read_optional(&self.layout.ssl_dir(tenant_id, domain).join(META_FILE))
    }

    pub fn write_tls_meta(&self, tenant_id: u32, meta: &TlsMeta) -> Result<()> {
        let dir = self.layout.ssl_dir(tenant_id, &meta.domain);
        atomic::ensure_dir(&dir, SSL_DIR_MODE)?;
        self.write_descriptor(&dir.join(META_FILE), meta, FILE_MODE)
    }

    pub fn delete_tls_dir(&self, tenant_id: u32, domain: &str) -> Result<bool> {
        atomic::remove_dir_if_exists(&self.layout.ssl_dir(tenant_id, domain))
    }

    /// Database directories under `databases/mysql` and `databases/postgres`
    pub fn list_databases(&self, tenant_id: u32) -> Result<Vec<DatabaseEntry>> {
        let mut entries = Vec::new();
        for engine_dir in ["mysql", "postgres"] {
            for name in list_subdirs(&self.layout.databases_dir(tenant_id, engine_dir))? {
                entries.push(DatabaseEntry {
                    engine_dir: engine_dir.to_string(),
                    name,
                });
            }
        }
        Ok(entries)
    }

    pub fn read_database_meta(&self, tenant_id: u32, entry: &DatabaseEntry) -> Result<Option<DatabaseMeta>> {
        let path = self
            .layout
            .databases_dir(tenant_id, &entry.engine_dir)
            .join(&entry.name)
            .join(META_FILE);
        self.read_optional(&path)
    }

    pub fn write_database_meta(&self, tenant_id: u32, meta: &DatabaseMeta) -> Result<()> {
        meta.validate()?;
        let dir = self.layout.database_dir(tenant_id, meta.engine, &meta.name);
        atomic::ensure_dir(&dir, DIR_MODE)?;
        self.write_descriptor(&dir.join(META_FILE), meta, FILE_MODE)
    }

    /// Ids of `cron/*.json`, ascending
    pub fn list_cron_jobs(&self, tenant_id: u32) -> Result<Vec<String>> {
        let dir = self.layout.cron_dir(tenant_id);
        let mut ids: Vec<String> = read_dir_names(&dir)?
            .into_iter()
            .filter_map(|name| name.strip_suffix(".json").map(str::to_string))
            .filter(|id| !id.is_empty())
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn read_cron_job(&self, tenant_id: u32, job_id: &str) -> Result<CronJob> {
        self.read_descriptor(&self.layout.cron_file(tenant_id, job_id))
    }

    pub fn write_cron_job(&self, tenant_id: u32, job: &CronJob) -> Result<()> {
        job.validate()?;
        atomic::ensure_dir(&self.layout.cron_dir(tenant_id), DIR_MODE)?;
        self.write_descriptor(&self.layout.cron_file(tenant_id, &job.id), job, FILE_MODE)
    }

    pub fn delete_cron_job(&self, tenant_id: u32, job_id: &str) -> Result<bool> {
        atomic::remove_file_if_exists(&self.layout.cron_file(tenant_id, job_id))
    }
}

/// Decodes a descriptor. Type errors are validation failures, malformed JSON
/// and invariant violations mean the file is corrupt.
fn decode<T: Descriptor>(path: &Path, bytes: &[u8]) -> Result<T> {
    let value: T = serde_json::from_slice(bytes).map_err(|e| match e.classify() {
        Category::Data => CoreError::Validation(ValidationError::new(
            format!("{} ({})", T::KIND, path.display()),
            e.to_string(),
        )),
        _ => CoreError::corrupt(path, e.to_string()),
    })?;
    value
        .validate()
        .map_err(|e| CoreError::corrupt(path, e.to_string()))?;
    Ok(value)
}

/// Names of entries in a directory; a missing directory is empty
fn read_dir_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CoreError::io(dir, e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CoreError::io(dir, e))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Sorted names of subdirectories
fn list_subdirs(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = read_dir_names(dir)?
        .into_iter()
        .filter(|name| dir.join(name).is_dir() && !name.starts_with('.'))
        .collect();
    names.sort();
    Ok(names)
}
