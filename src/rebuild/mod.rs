// src/rebuild/mod.rs

//! Drives an external index to match the filesystem.

pub mod index;

use std::sync::Arc;
use std::time::Instant;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{CoreError, ErrorKind, Result};
use crate::events::EventLog;
use crate::model::Event;
use crate::scanner::{validate_integrity, ScanError, Scanner, Severity, TenantSnapshot};
use crate::store::check_cancel;

pub use index::{
    DatabaseRecord, DatabaseWriter, DomainRecord, IndexError, IndexReader, JsonIndex, TenantRecord,
    TlsRecord,
};

const CONFIG_CHANGE: &str = "system.config.change";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildOptions {
    /// Scan and count without calling the writer
    pub dry_run: bool,

    /// Limit the run to one tenant
    pub tenant_id: Option<u32>,

    /// Report only scan errors, not integrity findings
    pub skip_validation: bool,

    /// Rewrite tenant rows even when they already match
    pub force_overwrite: bool,
}

/// A failure tied to one resource of one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceError {
    pub tenant_id: u32,
    pub resource: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ResourceError {
    pub(crate) fn new(tenant_id: u32, resource: impl Into<String>, err: &CoreError) -> Self {
        Self {
            tenant_id,
            resource: resource.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    fn from_scan(tenant_id: u32, err: &ScanError) -> Self {
        Self {
            tenant_id,
            resource: err.resource.clone(),
            kind: err.kind,
            message: err.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub dry_run: bool,
    pub duration_ms: u64,
    pub tenants_scanned: usize,
    pub tenants_updated: usize,
    pub sites: usize,
    pub tls: usize,
    pub databases: usize,
    pub stale_removed: usize,
    pub errors: Vec<ResourceError>,
    pub warnings: Vec<String>,
}

impl RebuildReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A field that differs between the filesystem and the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub tenant_id: u32,
    pub field: String,
    pub filesystem: String,
    pub index: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub mismatches: Vec<Mismatch>,

    /// Resources on disk the index does not know, e.g. `tenant:10001`
    pub missing_in_index: Vec<String>,

    /// Index rows with nothing behind them on disk
    pub missing_on_filesystem: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty() && self.missing_in_index.is_empty() && self.missing_on_filesystem.is_empty()
    }
}

pub struct Rebuilder {
    scanner: Scanner,
    events: Arc<EventLog>,
}

impl std::fmt::Debug for Rebuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rebuilder").finish_non_exhaustive()
    }
}

impl Rebuilder {
    pub fn new(scanner: Scanner, events: Arc<EventLog>) -> Self {
        Self { scanner, events }
    }

    /// Scans and pushes every tenant into `writer`. Per-resource failures are
    /// collected in the report; only scan failures and cancellation abort.
    pub async fn rebuild(
        &self,
        writer: &dyn DatabaseWriter,
        opts: &RebuildOptions,
        actor: &str,
        token: &CancellationToken,
    ) -> Result<RebuildReport> {
        let started = Instant::now();
        self.scanner.store().require_accounts_root()?;
        let mut report = RebuildReport {
            dry_run: opts.dry_run,
            ..RebuildReport::default()
        };

        self.record(
            Event::new(CONFIG_CHANGE, actor)
                .with("phase", "rebuild.start")
                .with("dry_run", opts.dry_run)
                .with("tenant_id", opts.tenant_id),
            &mut report,
        );

        let scan = self.scanner.scan(opts.tenant_id, token).await?;
        for snapshot in &scan.tenants {
            check_cancel(token)?;
            report.tenants_scanned += 1;
            self.collect_findings(snapshot, opts.skip_validation, &mut report);
            self.rebuild_tenant(writer, snapshot, opts, &mut report).await;
        }

        // Only a full run knows which tenants are gone
        if opts.tenant_id.is_none() && !opts.dry_run {
            let present: Vec<u32> = scan.tenants.iter().map(|t| t.tenant_id).collect();
            match writer.delete_stale_tenants(&present).await {
                Ok(removed) => report.stale_removed += removed,
                Err(e) => report.errors.push(ResourceError::new(0, "stale:tenants", &CoreError::from(e))),
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.record(
            Event::new(CONFIG_CHANGE, actor)
                .with("phase", "rebuild.complete")
                .with("dry_run", opts.dry_run)
                .with("tenants_scanned", report.tenants_scanned as u64)
                .with("tenants_updated", report.tenants_updated as u64)
                .with("errors", report.errors.len() as u64)
                .duration_ms(report.duration_ms),
            &mut report,
        );

        info!(
            tenants = report.tenants_scanned,
            updated = report.tenants_updated,
            sites = report.sites,
            errors = report.errors.len(),
            dry_run = opts.dry_run,
            "Rebuild finished in {}ms",
            report.duration_ms
        );
        Ok(report)
    }

    fn collect_findings(&self, snapshot: &TenantSnapshot, skip_validation: bool, report: &mut RebuildReport) {
        let id = snapshot.tenant_id;
        if skip_validation {
            report
                .errors
                .extend(snapshot.errors.iter().map(|e| ResourceError::from_scan(id, e)));
            return;
        }
        for issue in validate_integrity(snapshot) {
            match issue.severity {
                Severity::Error => report.errors.push(ResourceError {
                    tenant_id: id,
                    resource: issue.resource,
                    kind: issue.kind,
                    message: issue.message,
                }),
                Severity::Warning => report
                    .warnings
                    .push(format!("tenant {} {}: {}", id, issue.resource, issue.message)),
            }
        }
    }

    /// Tenant row first, then domains, certificates and databases, then the
    /// stale sweep. A tenant row that fails skips the rest of the tenant.
    async fn rebuild_tenant(
        &self,
        writer: &dyn DatabaseWriter,
        snapshot: &TenantSnapshot,
        opts: &RebuildOptions,
        report: &mut RebuildReport,
    ) {
        let id = snapshot.tenant_id;
        let identity = match &snapshot.identity {
            Some(identity) => identity,
            None => {
                report.warnings.push(format!("tenant {} skipped: no readable identity", id));
                return;
            }
        };

        let record = TenantRecord::new(identity, snapshot.status.as_ref());
        if opts.dry_run {
            report.tenants_updated += 1;
        } else {
            match writer.upsert_tenant(&record, opts.force_overwrite).await {
                Ok(true) => report.tenants_updated += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors.push(ResourceError::new(id, "tenant", &CoreError::from(e)));
                    return;
                }
            }
        }

        for site in &snapshot.sites {
            let resource = format!("domain:{}", site.domain);
            let result = if opts.dry_run {
                Ok(())
            } else {
                writer.upsert_domain(&DomainRecord::new(id, site)).await
            };
            match result {
                Ok(()) => report.sites += 1,
                Err(e) => report.errors.push(ResourceError::new(id, resource, &CoreError::from(e))),
            }
        }

        for tls in snapshot.tls.iter().filter(|tls| tls.is_complete()) {
            let resource = format!("tls:{}", tls.domain);
            let result = if opts.dry_run {
                Ok(())
            } else {
                writer.upsert_tls(&TlsRecord::new(id, tls)).await
            };
            match result {
                Ok(()) => report.tls += 1,
                Err(e) => report.errors.push(ResourceError::new(id, resource, &CoreError::from(e))),
            }
        }

        for db in &snapshot.databases {
            let resource = format!("database:{}", db.name);
            let result = if opts.dry_run {
                Ok(())
            } else {
                writer.upsert_database(&DatabaseRecord::new(id, db)).await
            };
            match result {
                Ok(()) => report.databases += 1,
                Err(e) => report.errors.push(ResourceError::new(id, resource, &CoreError::from(e))),
            }
        }

        if !opts.dry_run {
            match writer.delete_stale_records(id, &snapshot.domains()).await {
                Ok(removed) => report.stale_removed += removed,
                Err(e) => report.errors.push(ResourceError::new(id, "stale", &CoreError::from(e))),
            }
            let databases: Vec<String> = snapshot.databases.iter().map(|db| db.name.clone()).collect();
            match writer.delete_stale_databases(id, &databases).await {
                Ok(removed) => report.stale_removed += removed,
                Err(e) => report.errors.push(ResourceError::new(id, "stale", &CoreError::from(e))),
            }
        }
    }

    /// Compares the filesystem with the index in both directions
    pub async fn verify_consistency(
        &self,
        reader: &dyn IndexReader,
        token: &CancellationToken,
    ) -> Result<ConsistencyReport> {
        let scan = self.scanner.scan_all(token).await?;
        let indexed = reader.tenants().await?;
        let mut report = ConsistencyReport::default();

        for snapshot in &scan.tenants {
            check_cancel(token)?;
            let id = snapshot.tenant_id;
            let identity = match &snapshot.identity {
                Some(identity) => identity,
                None => continue,
            };

            match indexed.iter().find(|r| r.id == id) {
                None => {
                    report.missing_in_index.push(format!("tenant:{}", id));
                    report
                        .missing_in_index
                        .extend(snapshot.sites.iter().map(|s| format!("domain:{}/{}", id, s.domain)));
                    report
                        .missing_in_index
                        .extend(snapshot.databases.iter().map(|db| format!("database:{}/{}", id, db.name)));
                    continue;
                }
                Some(row) => {
                    let disk = TenantRecord::new(identity, snapshot.status.as_ref());
                    compare(&mut report, id, "name", &disk.name, &row.name);
                    compare(&mut report, id, "owner", &disk.owner, &row.owner);
                    compare(&mut report, id, "plan", &label(&disk.plan), &label(&row.plan));
                    compare(&mut report, id, "state", &disk.state.to_string(), &row.state.to_string());
                    compare(&mut report, id, "status.suspended", &disk.suspended, &row.suspended);
                    compare(&mut report, id, "status.locked", &disk.locked, &row.locked);
                }
            }

            let domains = reader.domains(id).await?;
            for site in &snapshot.sites {
                match domains.iter().find(|d| d.domain == site.domain) {
                    None => report.missing_in_index.push(format!("domain:{}/{}", id, site.domain)),
                    Some(row) => {
                        let disk = DomainRecord::new(id, site);
                        let field = |name: &str| format!("{}.{}", site.domain, name);
                        compare(&mut report, id, &field("runtime"), &disk.runtime, &row.runtime);
                        compare(&mut report, id, &field("ssl"), &disk.ssl, &row.ssl);
                    }
                }
            }
            for row in &domains {
                if !snapshot.sites.iter().any(|s| s.domain == row.domain) {
                    report
                        .missing_on_filesystem
                        .push(format!("domain:{}/{}", id, row.domain));
                }
            }

            let databases = reader.databases(id).await?;
            for db in &snapshot.databases {
                if !databases.iter().any(|row| row.name == db.name) {
                    report.missing_in_index.push(format!("database:{}/{}", id, db.name));
                }
            }
            for row in &databases {
                if !snapshot.databases.iter().any(|db| db.name == row.name) {
                    report
                        .missing_on_filesystem
                        .push(format!("database:{}/{}", id, row.name));
                }
            }
        }

        for row in &indexed {
            if !scan.tenants.iter().any(|t| t.tenant_id == row.id) {
                report.missing_on_filesystem.push(format!("tenant:{}", row.id));
            }
        }

        if !report.is_consistent() {
            warn!(
                mismatches = report.mismatches.len(),
                missing_in_index = report.missing_in_index.len(),
                missing_on_filesystem = report.missing_on_filesystem.len(),
                "Index out of sync with filesystem"
            );
        }
        Ok(report)
    }

    fn record(&self, event: Event, report: &mut RebuildReport) {
        if let Err(e) = self.events.write(event) {
            warn!("Failed to record rebuild event: {}", e);
            report.warnings.push(format!("event: {}", e));
        }
    }
}

fn compare<T: PartialEq + ToString + ?Sized>(
    report: &mut ConsistencyReport,
    tenant_id: u32,
    field: &str,
    disk: &T,
    index: &T,
) {
    if disk != index {
        report.mismatches.push(Mismatch {
            tenant_id,
            field: field.to_string(),
            filesystem: disk.to_string(),
            index: index.to_string(),
        });
    }
}

/// Serialized form of a unit enum, e.g. `starter`
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}
