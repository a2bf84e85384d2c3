// src/generator/mod.rs

//! Regenerates external-service configuration from the filesystem.
//!
//! Used for disaster recovery: after a node is restored from a backup of the
//! accounts root, every POSIX user, cgroup, vhost and pool can be rebuilt from
//! the descriptors alone.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::applier::{install_pool, install_vhost};
use crate::error::{CoreError, Result};
use crate::events::EventLog;
use crate::host::tls::TlsFiles;
use crate::host::{cgroup, run_checked, users, HostOps};
use crate::model::{Event, Limits};
use crate::rebuild::ResourceError;
use crate::render::Renderer;
use crate::scanner::{ScanResult, Scanner, TenantSnapshot};
use crate::store::atomic::{self, DIR_MODE, FILE_MODE};
use crate::store::check_cancel;
use crate::store::layout::{config_file_name, parse_config_file_name};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub tenant_id: Option<u32>,
    pub dry_run: bool,
    pub skip_nginx: bool,
    pub skip_phpfpm: bool,
    pub skip_users: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateReport {
    pub dry_run: bool,
    pub duration_ms: u64,
    pub tenants: usize,
    pub users_created: usize,
    pub cgroups: usize,
    pub nginx_configs: usize,
    pub pool_configs: usize,

    /// Services reloaded after generation
    pub reloaded: Vec<String>,

    pub errors: Vec<ResourceError>,
    pub warnings: Vec<String>,
}

/// Services touched by `reload_services`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSummary {
    pub reloaded: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Generator {
    scanner: Scanner,
    host: Arc<dyn HostOps>,
    renderer: Arc<Renderer>,
    events: Arc<EventLog>,
    php_versions: Vec<String>,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("php_versions", &self.php_versions)
            .finish_non_exhaustive()
    }
}

impl Generator {
    pub fn new(
        scanner: Scanner,
        host: Arc<dyn HostOps>,
        renderer: Arc<Renderer>,
        events: Arc<EventLog>,
        php_versions: Vec<String>,
    ) -> Self {
        Self {
            scanner,
            host,
            renderer,
            events,
            php_versions,
        }
    }

    /// Ensures users and cgroups and renders every vhost and pool, then
    /// reloads the services that were touched. A failing `nginx -t` aborts
    /// before any reload.
    pub async fn generate_all(
        &self,
        opts: &GenerateOptions,
        actor: &str,
        token: &CancellationToken,
    ) -> Result<GenerateReport> {
        let started = Instant::now();
        let mut report = GenerateReport {
            dry_run: opts.dry_run,
            ..GenerateReport::default()
        };

        self.scanner.store().require_accounts_root()?;
        let scan = self.scanner.scan(opts.tenant_id, token).await?;
        for snapshot in &scan.tenants {
            check_cancel(token)?;
            self.generate_tenant(snapshot, opts, &mut report).await;
        }

        if !opts.dry_run {
            if !opts.skip_nginx {
                self.generate_main_nginx_include()?;
            }
            let summary = self.reload_services(!opts.skip_nginx, !opts.skip_phpfpm).await?;
            report.reloaded = summary.reloaded;
            report
                .warnings
                .extend(summary.failed.into_iter().map(|unit| format!("reload {} failed", unit)));
            counter!(
                "owehost_configs_generated_total",
                (report.nginx_configs + report.pool_configs) as u64
            );
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        let event = Event::new("system.config.change", actor)
            .with("phase", "generate")
            .with("dry_run", opts.dry_run)
            .with("tenant_id", opts.tenant_id)
            .with("nginx_configs", report.nginx_configs as u64)
            .with("pool_configs", report.pool_configs as u64)
            .with("errors", report.errors.len() as u64)
            .duration_ms(report.duration_ms);
        if let Err(e) = self.events.write(event) {
            warn!("Failed to record generate event: {}", e);
            report.warnings.push(format!("event: {}", e));
        }

        info!(
            tenants = report.tenants,
            nginx = report.nginx_configs,
            pools = report.pool_configs,
            errors = report.errors.len(),
            dry_run = opts.dry_run,
            "Generated configs in {}ms",
            report.duration_ms
        );
        Ok(report)
    }

    async fn generate_tenant(&self, snapshot: &TenantSnapshot, opts: &GenerateOptions, report: &mut GenerateReport) {
        let id = snapshot.tenant_id;
        let Some(identity) = &snapshot.identity else {
            report.warnings.push(format!("tenant {} skipped: no readable identity", id));
            return;
        };
        report.tenants += 1;

        let store = self.scanner.store();
        let layout = store.layout();
        let _guard = store.locks().exclusive(id).await;

        if !opts.skip_users && !opts.dry_run {
            match users::ensure_user(self.host.as_ref(), identity, &layout.home_dir(id)).await {
                Ok(true) => report.users_created += 1,
                Ok(false) => {}
                Err(e) => report.errors.push(ResourceError::new(id, "user", &e)),
            }
        }

        if !opts.dry_run {
            let limits = snapshot
                .limits
                .clone()
                .unwrap_or_else(|| Limits::preset(identity.plan));
            match cgroup::apply_limits(layout, id, &limits) {
                Ok(true) => report.cgroups += 1,
                Ok(false) => debug!(tenant_id = id, "cgroup hierarchy not available"),
                Err(e) => {
                    warn!(tenant_id = id, "cgroup: {}", e);
                    report.warnings.push(format!("tenant {} cgroup: {}", id, e));
                }
            }
        }

        for site in &snapshot.sites {
            if !opts.skip_nginx {
                let tls = TlsFiles::new(layout.ssl_dir(id, &site.domain));
                let result = if site.ssl && !tls.has_pair() {
                    Err(CoreError::NotFound(format!("TLS key pair in {}", tls.dir.display())))
                } else if opts.dry_run {
                    self.renderer.render_vhost(id, site).map(|_| ())
                } else {
                    install_vhost(layout, &self.renderer, id, site)
                };
                match result {
                    Ok(()) => report.nginx_configs += 1,
                    Err(e) => report
                        .errors
                        .push(ResourceError::new(id, format!("nginx:{}", site.domain), &e)),
                }
            }

            let Some(version) = site.runtime.php_version() else {
                continue;
            };
            if opts.skip_phpfpm {
                continue;
            }
            let resource = format!("pool:{}", site.domain);
            if !self.php_versions.iter().any(|v| v == version) {
                report.errors.push(ResourceError::new(
                    id,
                    resource,
                    &CoreError::NotFound(format!("PHP {} is not installed", version)),
                ));
                continue;
            }
            let result = if opts.dry_run {
                self.renderer.render_pool(id, site).map(|_| ())
            } else {
                install_pool(layout, &self.renderer, &self.php_versions, id, site)
            };
            match result {
                Ok(()) => report.pool_configs += 1,
                Err(e) => report.errors.push(ResourceError::new(id, resource, &e)),
            }
        }
    }

    /// `nginx -t` then `nginx -s reload`, followed by a reload of every
    /// active PHP-FPM unit. Only the nginx config test is fatal.
    pub async fn reload_services(&self, nginx: bool, php: bool) -> Result<ReloadSummary> {
        let host = self.host.as_ref();
        let mut summary = ReloadSummary::default();

        if nginx {
            run_checked(host, "nginx", &["-t"], &[]).await?;
            match run_checked(host, "nginx", &["-s", "reload"], &[]).await {
                Ok(_) => summary.reloaded.push("nginx".to_string()),
                Err(e) => {
                    warn!("nginx reload failed: {}", e);
                    summary.failed.push("nginx".to_string());
                }
            }
        }

        if php {
            for version in &self.php_versions {
                let unit = format!("php{}-fpm", version);
                let active = host
                    .run("systemctl", vec!["is-active".into(), "--quiet".into(), unit.clone()])
                    .await?;
                if !active.success() {
                    debug!(unit = %unit, "Unit not active, skipping reload");
                    continue;
                }
                match run_checked(host, "systemctl", &["reload", &unit], &[]).await {
                    Ok(_) => summary.reloaded.push(unit),
                    Err(e) => {
                        warn!(unit = %unit, "Reload failed: {}", e);
                        summary.failed.push(unit);
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Config basenames in `sites-available/` or `sites-enabled/` that no
    /// site on disk accounts for, sorted. A missing accounts root is an error.
    pub async fn find_stale_configs(&self, token: &CancellationToken) -> Result<Vec<String>> {
        self.scanner.store().require_accounts_root()?;
        let scan = self.scanner.scan_all(token).await?;
        let expected = expected_configs(&scan);
        let layout = self.scanner.store().layout();

        let mut stale = BTreeSet::new();
        for dir in [layout.sites_available_dir(), layout.sites_enabled_dir()] {
            for name in config_names(&dir)? {
                if !expected.contains(&name) {
                    stale.insert(name);
                }
            }
        }
        Ok(stale.into_iter().collect())
    }

    /// Removes the available file and enabled link of every stale config.
    /// Each candidate is checked again under its tenant's lock before it goes.
    /// Returns the removed basenames.
    pub async fn cleanup_stale_configs(&self, dry_run: bool, token: &CancellationToken) -> Result<Vec<String>> {
        let stale = self.find_stale_configs(token).await?;
        if dry_run {
            return Ok(stale);
        }
        self.remove_stale_configs(stale, token).await
    }

    async fn remove_stale_configs(&self, stale: Vec<String>, token: &CancellationToken) -> Result<Vec<String>> {
        let store = self.scanner.store();
        let layout = store.layout();

        let mut removed = Vec::new();
        for (tenant_id, names) in by_tenant(stale) {
            check_cancel(token)?;
            let _guard = store.locks().shared(tenant_id).await;
            store.require_accounts_root()?;
            for (name, domain) in names {
                if self.site_claims(tenant_id, &domain, None) {
                    debug!(config = %name, "Site appeared since the scan, keeping config");
                    continue;
                }
                atomic::remove_file_if_exists(&layout.sites_enabled_dir().join(&name))?;
                atomic::remove_file_if_exists(&layout.sites_available_dir().join(&name))?;
                info!(config = %name, "Removed stale nginx config");
                removed.push(name);
            }
        }
        removed.sort();
        Ok(removed)
    }

    /// Removes pool files with no matching PHP site. Returns their paths.
    pub async fn cleanup_stale_pools(&self, dry_run: bool, token: &CancellationToken) -> Result<Vec<PathBuf>> {
        let store = self.scanner.store();
        store.require_accounts_root()?;
        let scan = self.scanner.scan_all(token).await?;
        let layout = store.layout();

        let mut candidates = Vec::new();
        for version in &self.php_versions {
            let dir = layout.pool_dir(version);
            for name in config_names(&dir)? {
                let wanted = scan.tenants.iter().any(|t| {
                    let on_version = t.sites.iter().any(|site| {
                        site.runtime.php_version() == Some(version.as_str())
                            && config_file_name(t.tenant_id, &site.domain) == name
                    });
                    let unreadable = t.errors.iter().any(|e| {
                        e.resource
                            .strip_prefix("site:")
                            .map_or(false, |domain| config_file_name(t.tenant_id, domain) == name)
                    });
                    on_version || unreadable
                });
                if !wanted {
                    candidates.push((version.as_str(), dir.join(&name), name));
                }
            }
        }
        if dry_run {
            return Ok(candidates.into_iter().map(|(_, path, _)| path).collect());
        }

        let mut removed = Vec::new();
        for (version, path, name) in candidates {
            check_cancel(token)?;
            let Some((tenant_id, domain)) = parse_config_file_name(&name) else {
                continue;
            };
            let _guard = store.locks().shared(tenant_id).await;
            store.require_accounts_root()?;
            if self.site_claims(tenant_id, &domain, Some(version)) {
                continue;
            }
            atomic::remove_file_if_exists(&path)?;
            info!(path = %path.display(), "Removed stale PHP-FPM pool");
            removed.push(path);
        }
        Ok(removed)
    }

    /// Whether a site currently on disk still owns its configs. With a PHP
    /// version only a site on that version counts. A descriptor that cannot
    /// be read keeps its configs.
    fn site_claims(&self, tenant_id: u32, domain: &str, php_version: Option<&str>) -> bool {
        match self.scanner.store().read_site(tenant_id, domain) {
            Ok(site) => php_version.map_or(true, |v| site.runtime.php_version() == Some(v)),
            Err(CoreError::NotFound(_)) => false,
            Err(e) => {
                debug!(tenant_id, domain, "Unreadable site keeps its configs: {}", e);
                true
            }
        }
    }

    /// Writes the include line that pulls every enabled site into nginx
    pub fn generate_main_nginx_include(&self) -> Result<PathBuf> {
        let path = self.scanner.store().layout().nginx_main_include();
        let body = self.renderer.render_main_include()?;
        if let Some(parent) = path.parent() {
            atomic::ensure_dir(parent, DIR_MODE)?;
        }
        atomic::write_bytes(&path, &body, FILE_MODE)?;
        Ok(path)
    }
}

/// Basenames every scanned site accounts for. Sites whose descriptor could
/// not be read still claim their config.
fn expected_configs(scan: &ScanResult) -> BTreeSet<String> {
    let mut expected = BTreeSet::new();
    for tenant in &scan.tenants {
        for site in &tenant.sites {
            expected.insert(config_file_name(tenant.tenant_id, &site.domain));
        }
        for err in &tenant.errors {
            if let Some(domain) = err.resource.strip_prefix("site:") {
                expected.insert(config_file_name(tenant.tenant_id, domain));
            }
        }
    }
    expected
}

/// Groups config basenames by the tenant id in their name
fn by_tenant(names: Vec<String>) -> BTreeMap<u32, Vec<(String, String)>> {
    let mut grouped: BTreeMap<u32, Vec<(String, String)>> = BTreeMap::new();
    for name in names {
        if let Some((tenant_id, domain)) = parse_config_file_name(&name) {
            grouped.entry(tenant_id).or_default().push((name, domain));
        }
    }
    grouped
}

/// `a-<id>-<domain>.conf` entries of a directory, sorted
fn config_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CoreError::io(dir, e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CoreError::io(dir, e))?;
        if let Some(name) = entry.file_name().to_str() {
            if parse_config_file_name(name).is_some() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}
