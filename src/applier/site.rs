// src/applier/site.rs

//! Site apply and delete.
//!
//! A site's nginx config is either absent or enabled: the available file is
//! written first and removed again if the enabled symlink cannot be created.
//! Neither operation reloads services; callers batch reloads through the
//! generator.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::lifecycle::refuse_terminated;
use super::{Applier, ApplyResult};
use crate::error::{CoreError, Result};
use crate::host::{self, tls};
use crate::model::{CertType, Descriptor, Event, Site};
use crate::render::Renderer;
use crate::store::atomic::{self, DIR_MODE, FILE_MODE, SSL_DIR_MODE};
use crate::store::{check_cancel, Layout};
use crate::validation::{self, ValidationError};

/// Placeholder page written into an empty document root
const DEFAULT_INDEX: &str = r#"<!DOCTYPE html>
<html>
<head><title>{domain}</title></head>
<body><h1>{domain}</h1><p>This site is hosted here but has no content yet.</p></body>
</html>
"#;

impl Applier {
    /// Writes a site and its service configs, setting up TLS when enabled
    pub async fn apply_site(
        &self,
        tenant_id: u32,
        site: &Site,
        actor: &str,
        token: &CancellationToken,
    ) -> Result<ApplyResult> {
        let started = Instant::now();
        let layout = self.store.layout();

        check_cancel(token)?;
        site.validate()?;
        let document_root = layout.document_root(tenant_id, &site.domain, &site.document_root)?;
        if let Some(version) = site.runtime.php_version() {
            if !self.php_versions.iter().any(|v| v == version) {
                return Err(ValidationError::new(
                    "site.runtime",
                    format!("PHP {} is not installed on this node", version),
                )
                .into());
            }
        }

        let _guard = self.store.locks().exclusive(tenant_id).await;
        let identity = self.store.read_identity(tenant_id)?;
        refuse_terminated(&identity, "add a site to")?;
        let mut result = ApplyResult::new(tenant_id);
        result.created = !layout.site_file(tenant_id, &site.domain).is_file();

        // TLS comes first: a site is only stored with ssl on when its pair exists
        check_cancel(token)?;
        let mut site = site.clone();
        if site.ssl && !self.ensure_tls(tenant_id, &site.domain, &mut result).await? {
            site.ssl = false;
            site.ssl_redirect = false;
        }
        let site = &site;

        // Descriptor and content
        self.store.write_site(tenant_id, site)?;
        atomic::ensure_dir(&document_root, DIR_MODE)?;
        if is_empty_dir(&document_root)? {
            let index = DEFAULT_INDEX.replace("{domain}", &site.domain);
            atomic::write_bytes(&document_root.join("index.html"), index.as_bytes(), FILE_MODE)?;
        }

        // Service configs
        check_cancel(token)?;
        install_vhost(layout, &self.renderer, tenant_id, site)?;
        install_pool(layout, &self.renderer, &self.php_versions, tenant_id, site)?;

        host::chown_recursive(
            self.host.as_ref(),
            &layout.site_dir(tenant_id, &site.domain),
            Some(identity.uid),
            Some(identity.gid),
        )?;

        result.duration_ms = started.elapsed().as_millis() as u64;
        let event_type = if result.created { "site.create" } else { "site.update" };
        let event = Event::new(event_type, actor)
            .tenant(tenant_id)
            .with("domain", site.domain.as_str())
            .with("runtime", site.runtime.to_string())
            .with("ssl", site.ssl)
            .duration_ms(result.duration_ms);
        self.record(event, &mut result);

        info!(tenant_id, domain = %site.domain, created = result.created, "Applied site");
        Ok(result)
    }

    /// Removes a site's enabled link, configs, directory and TLS material
    pub async fn delete_site(
        &self,
        tenant_id: u32,
        domain: &str,
        actor: &str,
        token: &CancellationToken,
    ) -> Result<ApplyResult> {
        let started = Instant::now();
        check_cancel(token)?;
        validation::validate_domain(domain)?;

        let _guard = self.store.locks().exclusive(tenant_id).await;
        let layout = self.store.layout();

        let mut existed = atomic::remove_file_if_exists(&layout.nginx_enabled(tenant_id, domain))?;
        existed |= atomic::remove_file_if_exists(&layout.nginx_available(tenant_id, domain))?;
        for version in &self.php_versions {
            existed |= atomic::remove_file_if_exists(&layout.pool_file(version, tenant_id, domain))?;
        }
        existed |= self.store.delete_site_dir(tenant_id, domain)?;
        existed |= self.store.delete_tls_dir(tenant_id, domain)?;

        if !existed {
            debug!(tenant_id, domain, "Site already absent");
            return Ok(ApplyResult::new(tenant_id));
        }
        info!(tenant_id, domain, "Deleted site");
        Ok(self.finish(
            tenant_id,
            Event::new("site.delete", actor).with("domain", domain),
            started,
        ))
    }

    /// Reuses or generates the key pair, then refreshes meta, fullchain and modes.
    /// Returns `false` with a warning when no pair could be produced.
    async fn ensure_tls(&self, tenant_id: u32, domain: &str, result: &mut ApplyResult) -> Result<bool> {
        let layout = self.store.layout();
        atomic::ensure_dir(&layout.ssl_root(tenant_id), SSL_DIR_MODE)?;
        let files = tls::TlsFiles::new(layout.ssl_dir(tenant_id, domain));

        let mut generated = false;
        if !files.has_pair() {
            match tls::generate_self_signed(self.host.as_ref(), &files, domain).await {
                Ok(()) => generated = true,
                Err(e) => {
                    result.warn("self-signed certificate", format!("{}; ssl left off for {}", e, domain));
                    return Ok(false);
                }
            }
        }

        if generated || self.store.read_tls_meta(tenant_id, domain)?.is_none() {
            let cert_type = if generated {
                CertType::SelfSigned
            } else {
                CertType::Custom
            };
            match tls::inspect_certificate(&files.cert, domain, cert_type) {
                Ok(meta) => self.store.write_tls_meta(tenant_id, &meta)?,
                Err(e) if generated => {
                    debug!(domain, "Falling back to placeholder TLS meta: {}", e);
                    self.store.write_tls_meta(tenant_id, &tls::self_signed_meta(domain))?;
                }
                Err(e) => result.warn("tls meta", e),
            }
        }

        tls::rebuild_fullchain(&files)?;
        tls::enforce_modes(&files)?;
        Ok(true)
    }
}

/// Renders and installs a site's vhost, then enables it
pub(crate) fn install_vhost(layout: &Layout, renderer: &Renderer, tenant_id: u32, site: &Site) -> Result<()> {
    let config = renderer.render_vhost(tenant_id, site)?;

    let available = layout.nginx_available(tenant_id, &site.domain);
    let enabled = layout.nginx_enabled(tenant_id, &site.domain);
    atomic::ensure_dir(&layout.sites_available_dir(), DIR_MODE)?;
    atomic::ensure_dir(&layout.sites_enabled_dir(), DIR_MODE)?;
    atomic::write_bytes(&available, &config, FILE_MODE)?;

    if let Err(e) = enable(&available, &enabled) {
        atomic::remove_file_if_exists(&available)?;
        return Err(e);
    }
    debug!(tenant_id, domain = %site.domain, "vhost enabled");
    Ok(())
}

/// Writes the pool of a PHP site and drops pools left on other versions
pub(crate) fn install_pool(
    layout: &Layout,
    renderer: &Renderer,
    php_versions: &[String],
    tenant_id: u32,
    site: &Site,
) -> Result<()> {
    let current = site.runtime.php_version();
    for version in php_versions {
        if Some(version.as_str()) != current {
            atomic::remove_file_if_exists(&layout.pool_file(version, tenant_id, &site.domain))?;
        }
    }
    let Some(version) = current else {
        return Ok(());
    };

    let pool = renderer.render_pool(tenant_id, site)?;
    atomic::ensure_dir(&layout.pool_dir(version), DIR_MODE)?;
    atomic::write_bytes(&layout.pool_file(version, tenant_id, &site.domain), &pool, FILE_MODE)?;
    debug!(tenant_id, domain = %site.domain, version = %version, "PHP-FPM pool written");
    Ok(())
}

/// Points `enabled` at `available`, replacing whatever was there
fn enable(available: &Path, enabled: &Path) -> Result<()> {
    if let Ok(target) = fs::read_link(enabled) {
        if target == available {
            return Ok(());
        }
    }
    atomic::remove_file_if_exists(enabled)?;
    symlink(available, enabled).map_err(|e| CoreError::io(enabled, e))
}

fn is_empty_dir(dir: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(dir).map_err(|e| CoreError::io(dir, e))?;
    match entries.next() {
        None => Ok(true),
        Some(Ok(_)) => Ok(false),
        Some(Err(e)) => Err(CoreError::io(dir, e)),
    }
}
