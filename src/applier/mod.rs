// src/applier/mod.rs

//! Reconciles a desired tenant state into the filesystem and the host.
//!
//! Phases run in a fixed order and each one is safe to repeat. A failing phase
//! aborts the rest but nothing already done is rolled back; the next apply
//! converges from whatever is on disk.

mod lifecycle;
mod site;

pub(crate) use site::{install_pool, install_vhost};

use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Instant;
use metrics::{histogram, increment_counter};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::events::EventLog;
use crate::host::{self, cgroup, quota, users, HostOps};
use crate::model::{
    now_rfc3339, AccountState, DesiredState, Descriptor, Event, Identity, Limits, Metadata, Status,
};
use crate::render::Renderer;
use crate::store::{check_cancel, Store};
use crate::validation::ValidationError;

/// Subdirectories owned by the tenant user
const TENANT_OWNED: &[&str] = &["home", "web", "mail", "tmp"];

/// Subdirectories owned by root and readable by the tenant group
const GROUP_READABLE: &[&str] = &["logs", "backups"];

/// Mode of [`GROUP_READABLE`] directories
const GROUP_READABLE_MODE: u32 = 0o750;

/// Outcome of an applier entry point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub tenant_id: u32,

    /// The call created the tenant (or site) rather than updating it
    pub created: bool,

    /// Best-effort steps that failed
    pub warnings: Vec<String>,

    pub duration_ms: u64,
}

impl ApplyResult {
    fn new(tenant_id: u32) -> Self {
        Self {
            tenant_id,
            ..Self::default()
        }
    }

    fn warn(&mut self, step: &str, err: impl std::fmt::Display) {
        let message = format!("{}: {}", step, err);
        warn!(tenant_id = self.tenant_id, "{}", message);
        self.warnings.push(message);
    }
}

/// The reconciler
pub struct Applier {
    store: Arc<Store>,
    events: Arc<EventLog>,
    host: Arc<dyn HostOps>,
    renderer: Arc<Renderer>,

    /// PHP versions installed on this node
    php_versions: Vec<String>,

    /// Node tag written into new identities
    node_id: String,
}

impl Applier {
    pub fn new(
        store: Arc<Store>,
        events: Arc<EventLog>,
        host: Arc<dyn HostOps>,
        renderer: Arc<Renderer>,
        php_versions: Vec<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            events,
            host,
            renderer,
            php_versions,
            node_id: node_id.into(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Converges tenant `tenant_id` to `desired`
    pub async fn apply(
        &self,
        tenant_id: u32,
        desired: &DesiredState,
        actor: &str,
        token: &CancellationToken,
    ) -> Result<ApplyResult> {
        let started = Instant::now();
        increment_counter!("owehost_apply_total");

        let result = self.apply_tenant(tenant_id, desired, actor, token, started).await;

        histogram!("owehost_apply_duration_ms", started.elapsed().as_millis() as f64);
        if let Err(e) = &result {
            increment_counter!("owehost_apply_failures_total");
            warn!(tenant_id, "Apply failed: {}", e);
        }
        result
    }

    async fn apply_tenant(
        &self,
        tenant_id: u32,
        desired: &DesiredState,
        actor: &str,
        token: &CancellationToken,
        started: Instant,
    ) -> Result<ApplyResult> {
        // Phase 1: validate everything before touching anything
        check_cancel(token)?;
        validate_desired(tenant_id, desired)?;

        let _guard = self.store.locks().exclusive(tenant_id).await;
        let layout = self.store.layout();
        let mut result = ApplyResult::new(tenant_id);

        let existing = match self.store.read_identity(tenant_id) {
            Ok(identity) => Some(identity),
            Err(CoreError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        result.created = existing.is_none();
        let identity = self.resolve_identity(tenant_id, desired, existing.as_ref())?;

        // Phase 2: skeleton
        check_cancel(token)?;
        self.store.create_tenant_skeleton(tenant_id)?;

        // Phase 3: POSIX user
        check_cancel(token)?;
        users::ensure_user(self.host.as_ref(), &identity, &layout.home_dir(tenant_id)).await?;

        // Phase 4: descriptors
        check_cancel(token)?;
        self.store.write_identity(&identity)?;

        let limits = match &desired.limits {
            Some(limits) => limits.clone(),
            None => self
                .store
                .read_limits(tenant_id)?
                .unwrap_or_else(|| Limits::preset(identity.plan)),
        };
        self.store.write_limits(tenant_id, &limits)?;

        let status = match &desired.status {
            Some(status) => status.clone(),
            None => self.store.read_status(tenant_id)?.unwrap_or_default(),
        };
        self.store.write_status(tenant_id, &status)?;

        if desired.metadata.is_some() || result.created {
            let mut metadata = desired.metadata.clone().unwrap_or_else(Metadata::default);
            metadata.updated_at = Some(now_rfc3339());
            self.store.write_metadata(tenant_id, &metadata)?;
        }

        // Phase 5: ownership
        check_cancel(token)?;
        self.apply_ownership(&identity)?;

        // Phase 6: best-effort resource limits
        check_cancel(token)?;
        match cgroup::apply_limits(layout, tenant_id, &limits) {
            Ok(true) => {}
            Ok(false) => debug!(tenant_id, "cgroup limits skipped"),
            Err(e) => result.warn("cgroup", e),
        }
        if let Err(e) = quota::apply_quota(self.host.as_ref(), identity.uid, &limits, layout.quota_mount()).await {
            result.warn("quota", e);
        }

        // First successful apply activates a pending tenant
        let mut identity = identity;
        if identity.state == AccountState::Pending {
            identity.state = AccountState::Active;
            self.store.write_identity(&identity)?;
            info!(tenant_id, "Tenant {} activated", identity.name);
        }

        // Phase 7: event
        result.duration_ms = started.elapsed().as_millis() as u64;
        let event_type = if result.created {
            "account.create"
        } else {
            "account.update"
        };
        let event = Event::new(event_type, actor)
            .tenant(tenant_id)
            .with("name", identity.name.as_str())
            .with("plan", serde_json::to_value(identity.plan).unwrap_or_default())
            .with("state", identity.state.to_string())
            .duration_ms(result.duration_ms);
        self.record(event, &mut result);

        info!(
            tenant_id,
            created = result.created,
            warnings = result.warnings.len(),
            "Applied tenant {}",
            identity.name
        );
        Ok(result)
    }

    /// Merges the desired identity with what is already on disk
    fn resolve_identity(
        &self,
        tenant_id: u32,
        desired: &DesiredState,
        existing: Option<&Identity>,
    ) -> Result<Identity> {
        let Some(existing) = existing else {
            let mut identity = desired.identity.clone().ok_or_else(|| {
                ValidationError::new("identity", "required to create a tenant")
            })?;
            if let Some(other) = self.store.find_tenant_by_name(&identity.name)? {
                if other != tenant_id {
                    return Err(CoreError::AlreadyExists(format!(
                        "tenant name {} is used by tenant {}",
                        identity.name, other
                    )));
                }
            }
            if identity.created_at.is_empty() {
                identity.created_at = now_rfc3339();
            }
            if identity.node.is_empty() {
                identity.node = self.node_id.clone();
            }
            return Ok(identity);
        };

        let Some(wanted) = &desired.identity else {
            return Ok(existing.clone());
        };
        for (field, unchanged) in [
            ("identity.id", wanted.id == existing.id),
            ("identity.uid", wanted.uid == existing.uid),
            ("identity.gid", wanted.gid == existing.gid),
            ("identity.name", wanted.name == existing.name),
        ] {
            if !unchanged {
                return Err(ValidationError::new(field, "is immutable once written").into());
            }
        }

        let mut identity = wanted.clone();
        identity.created_at = existing.created_at.clone();
        if identity.node.is_empty() {
            identity.node = existing.node.clone();
        }
        // An apply never demotes a live tenant back to pending
        if identity.state == AccountState::Pending && existing.state != AccountState::Pending {
            identity.state = existing.state;
        }
        Ok(identity)
    }

    /// Tenant-owned trees to uid:gid, logs and backups to root:gid 0750
    fn apply_ownership(&self, identity: &Identity) -> Result<()> {
        let layout = self.store.layout();
        for sub in TENANT_OWNED {
            let path = layout.tenant_subdir(identity.id, sub);
            host::chown_recursive(self.host.as_ref(), &path, Some(identity.uid), Some(identity.gid))?;
        }
        for sub in GROUP_READABLE {
            let path = layout.tenant_subdir(identity.id, sub);
            host::chown_recursive(self.host.as_ref(), &path, Some(0), Some(identity.gid))?;
            fs::set_permissions(&path, Permissions::from_mode(GROUP_READABLE_MODE))
                .map_err(|e| CoreError::io(&path, e))?;
        }
        debug!(tenant_id = identity.id, "Ownership applied");
        Ok(())
    }

    /// Writes an event; a failure becomes a warning since state is already converged
    fn record(&self, event: Event, result: &mut ApplyResult) {
        if let Err(e) = self.events.write(event) {
            result.warn("event", e);
        }
    }
}

/// Runs every validator over the supplied parts of a desired state
pub fn validate_desired(tenant_id: u32, desired: &DesiredState) -> Result<()> {
    if let Some(identity) = &desired.identity {
        identity.validate()?;
        if identity.id != tenant_id {
            return Err(ValidationError::new(
                "identity.id",
                format!("{} does not match tenant {}", identity.id, tenant_id),
            )
            .into());
        }
    }
    if let Some(limits) = &desired.limits {
        limits.validate()?;
    }
    if let Some(status) = &desired.status {
        status.validate()?;
    }
    if let Some(metadata) = &desired.metadata {
        metadata.validate()?;
    }
    Ok(())
}

impl std::fmt::Debug for Applier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applier")
            .field("php_versions", &self.php_versions)
            .field("node_id", &self.node_id)
            .finish()
    }
}

/// Status used by the suspend-style transitions
fn suspended_status(existing: Option<Status>, reason: &str, actor: &str, lock: bool) -> Status {
    let now = now_rfc3339();
    let mut status = existing.unwrap_or_default();
    status.suspended = true;
    status.reason = Some(reason.to_string());
    status.suspended_at = Some(now.clone());
    status.suspended_by = Some(actor.to_string());
    if lock {
        status.locked = true;
        status.locked_at = Some(now);
        status.locked_by = Some(actor.to_string());
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use crate::error::ErrorKind;
    use crate::host::{CommandOutput, MockHostOps};
    use crate::model::Plan;
    use crate::store::Layout;
    use tempfile::tempdir;

    fn ok() -> CommandOutput {
        CommandOutput {
            code: Some(0),
            ..CommandOutput::default()
        }
    }

    fn applier(base: &std::path::Path, host: MockHostOps) -> Applier {
        let layout = Layout::new(PathsConfig::under(base));
        let events = EventLog::new(layout.events_root(), layout.alerts_root(), "node-1");
        Applier::new(
            Arc::new(Store::new(layout.clone())),
            Arc::new(events),
            Arc::new(host),
            Arc::new(Renderer::new(layout).unwrap()),
            vec!["8.2".into()],
            "node-1",
        )
    }

    fn acme() -> DesiredState {
        DesiredState {
            identity: Some(Identity::new(10001, "acme", "admin", Plan::Starter)),
            ..DesiredState::default()
        }
    }

    #[tokio::test]
    async fn invalid_identity_touches_nothing() {
        let dir = tempdir().unwrap();
        let applier = applier(dir.path(), MockHostOps::new());
        let mut desired = acme();
        if let Some(identity) = desired.identity.as_mut() {
            identity.uid = 999;
        }
        let err = applier
            .apply(10001, &desired, "admin", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!applier.store().exists_tenant(10001));
    }

    #[tokio::test]
    async fn mismatched_id_is_rejected() {
        let dir = tempdir().unwrap();
        let applier = applier(dir.path(), MockHostOps::new());
        let err = applier
            .apply(10002, &acme(), "admin", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn create_requires_identity() {
        let dir = tempdir().unwrap();
        let applier = applier(dir.path(), MockHostOps::new());
        let err = applier
            .apply(10001, &DesiredState::default(), "admin", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_mutation() {
        let dir = tempdir().unwrap();
        let applier = applier(dir.path(), MockHostOps::new());
        let token = CancellationToken::new();
        token.cancel();
        let err = applier.apply(10001, &acme(), "admin", &token).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Aborted);
        assert!(!applier.store().exists_tenant(10001));
    }

    #[tokio::test]
    async fn pending_tenant_is_activated_and_quota_failure_is_a_warning() {
        let dir = tempdir().unwrap();
        let mut host = MockHostOps::new();
        host.expect_run().returning(|program, _| {
            Ok(match program {
                "id" => CommandOutput {
                    code: Some(1),
                    ..CommandOutput::default()
                },
                "setquota" => CommandOutput {
                    code: Some(1),
                    stderr: "quotas not enabled".into(),
                    ..CommandOutput::default()
                },
                _ => ok(),
            })
        });
        host.expect_chown().returning(|_, _, _| Ok(()));
        let applier = applier(dir.path(), host);

        let result = applier
            .apply(10001, &acme(), "admin", &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.created);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].starts_with("quota"));

        let identity = applier.store().read_identity(10001).unwrap();
        assert_eq!(identity.state, AccountState::Active);
        assert_eq!(identity.node, "node-1");
        assert!(!identity.created_at.is_empty());
        assert_eq!(
            applier.store().read_limits(10001).unwrap(),
            Some(Limits::preset(Plan::Starter))
        );
    }

    #[tokio::test]
    async fn useradd_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let mut host = MockHostOps::new();
        host.expect_run().returning(|program, _| {
            Ok(match program {
                "id" | "useradd" => CommandOutput {
                    code: Some(1),
                    ..CommandOutput::default()
                },
                _ => ok(),
            })
        });
        let applier = applier(dir.path(), host);
        let err = applier
            .apply(10001, &acme(), "admin", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OsExec);
        // The skeleton phase already ran and is left in place
        assert!(applier.store().exists_tenant(10001));
        assert!(applier.store().read_identity(10001).is_err());
    }
}
