// src/applier/lifecycle.rs

//! Suspend, unsuspend, terminate and delete. These bypass the full apply and
//! touch only the descriptors the transition changes.

use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{suspended_status, Applier, ApplyResult};
use crate::error::{CoreError, Result};
use crate::host::{cgroup, users};
use crate::model::{AccountState, Event, Identity, UID_OFFSET};
use crate::store::atomic;
use crate::store::check_cancel;
use crate::store::layout::parse_config_file_name;
use crate::validation::ValidationError;

impl Applier {
    /// Suspends a tenant with a reason
    pub async fn suspend(
        &self,
        tenant_id: u32,
        reason: &str,
        actor: &str,
        token: &CancellationToken,
    ) -> Result<ApplyResult> {
        let started = Instant::now();
        check_cancel(token)?;
        let _guard = self.store.locks().exclusive(tenant_id).await;

        let mut identity = self.store.read_identity(tenant_id)?;
        refuse_terminated(&identity, "suspend")?;

        let status = suspended_status(self.store.read_status(tenant_id)?, reason, actor, false);
        self.store.write_status(tenant_id, &status)?;
        identity.state = AccountState::Suspended;
        self.store.write_identity(&identity)?;

        info!(tenant_id, "Suspended tenant {}: {}", identity.name, reason);
        Ok(self.finish(
            tenant_id,
            Event::new("account.suspend", actor).with("reason", reason),
            started,
        ))
    }

    /// Lifts a suspension; reason and suspension stamps are cleared
    pub async fn unsuspend(&self, tenant_id: u32, actor: &str, token: &CancellationToken) -> Result<ApplyResult> {
        let started = Instant::now();
        check_cancel(token)?;
        let _guard = self.store.locks().exclusive(tenant_id).await;

        let mut identity = self.store.read_identity(tenant_id)?;
        refuse_terminated(&identity, "unsuspend")?;

        let mut status = self.store.read_status(tenant_id)?.unwrap_or_default();
        status.suspended = false;
        status.reason = None;
        status.suspended_at = None;
        status.suspended_by = None;
        self.store.write_status(tenant_id, &status)?;
        identity.state = AccountState::Active;
        self.store.write_identity(&identity)?;

        info!(tenant_id, "Unsuspended tenant {}", identity.name);
        Ok(self.finish(tenant_id, Event::new("account.unsuspend", actor), started))
    }

    /// Locks a tenant for good. The POSIX user and all data stay in place.
    pub async fn terminate(
        &self,
        tenant_id: u32,
        reason: &str,
        actor: &str,
        token: &CancellationToken,
    ) -> Result<ApplyResult> {
        let started = Instant::now();
        check_cancel(token)?;
        let _guard = self.store.locks().exclusive(tenant_id).await;

        let mut identity = self.store.read_identity(tenant_id)?;
        let status = suspended_status(self.store.read_status(tenant_id)?, reason, actor, true);
        self.store.write_status(tenant_id, &status)?;
        identity.state = AccountState::Terminated;
        self.store.write_identity(&identity)?;

        info!(tenant_id, "Terminated tenant {}: {}", identity.name, reason);
        Ok(self.finish(
            tenant_id,
            Event::new("account.terminate", actor).with("reason", reason),
            started,
        ))
    }

    /// Removes the POSIX user, cgroup, generated configs and the tenant
    /// directory. Parts already gone are skipped.
    pub async fn delete(&self, tenant_id: u32, actor: &str, token: &CancellationToken) -> Result<ApplyResult> {
        let started = Instant::now();
        check_cancel(token)?;
        let guard = self.store.locks().exclusive(tenant_id).await;

        let identity = match self.store.read_identity(tenant_id) {
            Ok(identity) => Some(identity),
            Err(CoreError::NotFound(_)) => None,
            Err(e) => {
                debug!(tenant_id, "Deleting tenant with unreadable identity: {}", e);
                None
            }
        };

        // Without a readable identity the login is found through the derived uid
        let login = match &identity {
            Some(identity) => Some(identity.name.clone()),
            None => match UID_OFFSET.checked_add(tenant_id) {
                Some(uid) => users::user_name(self.host.as_ref(), uid).await?,
                None => None,
            },
        };
        if let Some(login) = &login {
            users::remove_user(self.host.as_ref(), login).await?;
        }

        check_cancel(token)?;
        cgroup::remove(self.store.layout(), tenant_id)?;
        let removed_configs = self.remove_tenant_configs(tenant_id)?;
        let existed = self.store.delete_tenant_skeleton(tenant_id)?;

        drop(guard);
        self.store.locks().forget(tenant_id);

        if login.is_none() && !existed && removed_configs == 0 {
            debug!(tenant_id, "Tenant already absent");
            return Ok(ApplyResult::new(tenant_id));
        }

        let mut event = Event::new("account.delete", actor).with("configs_removed", removed_configs as u64);
        if let Some(login) = &login {
            event = event.with("name", login.as_str());
        }
        info!(tenant_id, "Deleted tenant");
        Ok(self.finish(tenant_id, event, started))
    }

    /// Removes every `a-<id>-*.conf` vhost, enabled link and pool of a tenant
    fn remove_tenant_configs(&self, tenant_id: u32) -> Result<usize> {
        let layout = self.store.layout();
        let mut dirs = vec![layout.sites_enabled_dir(), layout.sites_available_dir()];
        dirs.extend(self.php_versions.iter().map(|version| layout.pool_dir(version)));

        let mut removed = 0;
        for dir in dirs {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(CoreError::io(&dir, e)),
            };
            for entry in entries {
                let entry = entry.map_err(|e| CoreError::io(&dir, e))?;
                let name = entry.file_name();
                let owned = name
                    .to_str()
                    .and_then(parse_config_file_name)
                    .map_or(false, |(id, _)| id == tenant_id);
                if owned && atomic::remove_file_if_exists(&entry.path())? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Stamps and records the transition event
    pub(super) fn finish(&self, tenant_id: u32, event: Event, started: Instant) -> ApplyResult {
        let mut result = ApplyResult::new(tenant_id);
        result.duration_ms = started.elapsed().as_millis() as u64;
        let event = event.tenant(tenant_id).duration_ms(result.duration_ms);
        self.record(event, &mut result);
        result
    }
}

pub(super) fn refuse_terminated(identity: &Identity, action: &str) -> Result<()> {
    if identity.state == AccountState::Terminated {
        return Err(ValidationError::new(
            "identity.state",
            format!("cannot {} a terminated tenant", action),
        )
        .into());
    }
    Ok(())
}
