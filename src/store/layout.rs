// src/store/layout.rs

//! Deterministic on-disk naming for tenants, sites and generated configs.

use std::path::{Component, Path, PathBuf};

use crate::config::PathsConfig;
use crate::model::DbEngine;
use crate::validation::{self, ValidationError};

/// Subdirectories created for every tenant, with their modes
pub const SKELETON: &[(&str, u32)] = &[
    ("home", 0o755),
    ("web", 0o755),
    ("mail", 0o755),
    ("databases", 0o755),
    ("databases/mysql", 0o755),
    ("databases/postgres", 0o755),
    ("dns", 0o755),
    ("ssl", 0o700),
    ("cron", 0o755),
    ("runtime", 0o755),
    ("backups", 0o755),
    ("logs", 0o755),
    ("tmp", 0o755),
];

pub const ACCOUNT_FILE: &str = "account.json";
pub const LIMITS_FILE: &str = "limits.json";
pub const STATUS_FILE: &str = "status.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const AUTH_FILE: &str = "auth.json";
pub const SITE_FILE: &str = "site.json";
pub const META_FILE: &str = "meta.json";

/// Subdirectories created next to a site's document root
pub const SITE_SUBDIRS: &[&str] = &["logs", "tmp", "cache"];

/// Directory name of a tenant (`a-<id>`)
pub fn tenant_dir_name(tenant_id: u32) -> String {
    format!("a-{}", tenant_id)
}

/// Parses `a-<id>`; anything else is not a tenant directory
pub fn parse_tenant_dir_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("a-")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Basename of a generated nginx or pool config (`a-<id>-<domain>.conf`)
pub fn config_file_name(tenant_id: u32, domain: &str) -> String {
    format!("a-{}-{}.conf", tenant_id, domain)
}

/// Parses `a-<id>-<domain>.conf`
pub fn parse_config_file_name(name: &str) -> Option<(u32, String)> {
    let stem = name.strip_prefix("a-")?.strip_suffix(".conf")?;
    let (id, domain) = stem.split_once('-')?;
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) || domain.is_empty() {
        return None;
    }
    Some((id.parse().ok()?, domain.to_string()))
}

/// Resolves every generated path from the configured roots
#[derive(Debug, Clone)]
pub struct Layout {
    paths: PathsConfig,
}

impl Layout {
    pub fn new(paths: PathsConfig) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &PathsConfig {
        &self.paths
    }

    pub fn accounts_root(&self) -> &Path {
        &self.paths.accounts_root
    }

    pub fn tenant_dir(&self, tenant_id: u32) -> PathBuf {
        self.paths.accounts_root.join(tenant_dir_name(tenant_id))
    }

    pub fn tenant_subdir(&self, tenant_id: u32, sub: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join(sub)
    }

    /// Path of a tenant-level descriptor such as `account.json`
    pub fn tenant_file(&self, tenant_id: u32, file: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join(file)
    }

    pub fn home_dir(&self, tenant_id: u32) -> PathBuf {
        self.tenant_subdir(tenant_id, "home")
    }

    pub fn web_dir(&self, tenant_id: u32) -> PathBuf {
        self.tenant_subdir(tenant_id, "web")
    }

    pub fn site_dir(&self, tenant_id: u32, domain: &str) -> PathBuf {
        self.web_dir(tenant_id).join(domain)
    }

    pub fn site_file(&self, tenant_id: u32, domain: &str) -> PathBuf {
        self.site_dir(tenant_id, domain).join(SITE_FILE)
    }

    /// Effective document root, guaranteed to lie inside the site directory
    pub fn document_root(
        &self,
        tenant_id: u32,
        domain: &str,
        document_root: &str,
    ) -> Result<PathBuf, ValidationError> {
        validation::validate_document_root(document_root)?;
        let site_dir = self.site_dir(tenant_id, domain);
        let joined = normalize(&site_dir.join(document_root));
        if !joined.starts_with(&site_dir) || joined == site_dir {
            return Err(ValidationError::new(
                "site.document_root",
                "must resolve inside the site directory",
            ));
        }
        Ok(joined)
    }

    pub fn ssl_root(&self, tenant_id: u32) -> PathBuf {
        self.tenant_subdir(tenant_id, "ssl")
    }

    pub fn ssl_dir(&self, tenant_id: u32, domain: &str) -> PathBuf {
        self.ssl_root(tenant_id).join(domain)
    }

    pub fn databases_dir(&self, tenant_id: u32, engine_dir: &str) -> PathBuf {
        self.tenant_subdir(tenant_id, "databases").join(engine_dir)
    }

    pub fn database_dir(&self, tenant_id: u32, engine: DbEngine, name: &str) -> PathBuf {
        self.databases_dir(tenant_id, engine.dir_name()).join(name)
    }

    pub fn cron_dir(&self, tenant_id: u32) -> PathBuf {
        self.tenant_subdir(tenant_id, "cron")
    }

    pub fn cron_file(&self, tenant_id: u32, job_id: &str) -> PathBuf {
        self.cron_dir(tenant_id).join(format!("{}.json", job_id))
    }

    pub fn events_root(&self) -> PathBuf {
        self.paths.opt_root.join("logs").join("events")
    }

    pub fn alerts_root(&self) -> PathBuf {
        self.paths.opt_root.join("logs").join("alerts")
    }

    pub fn index_file(&self) -> PathBuf {
        self.paths.opt_root.join("index").join("index.json")
    }

    pub fn sites_available_dir(&self) -> PathBuf {
        self.paths.nginx_root.join("sites-available")
    }

    pub fn sites_enabled_dir(&self) -> PathBuf {
        self.paths.nginx_root.join("sites-enabled")
    }

    pub fn nginx_available(&self, tenant_id: u32, domain: &str) -> PathBuf {
        self.sites_available_dir()
            .join(config_file_name(tenant_id, domain))
    }

    pub fn nginx_enabled(&self, tenant_id: u32, domain: &str) -> PathBuf {
        self.sites_enabled_dir().join(config_file_name(tenant_id, domain))
    }

    /// One-line include pulling every enabled site into nginx
    pub fn nginx_main_include(&self) -> PathBuf {
        self.paths.nginx_root.join("conf.d").join("owehost.conf")
    }

    pub fn pool_dir(&self, php_version: &str) -> PathBuf {
        self.paths
            .php_root
            .join(php_version)
            .join("fpm")
            .join("pool.d")
    }

    pub fn pool_file(&self, php_version: &str, tenant_id: u32, domain: &str) -> PathBuf {
        self.pool_dir(php_version)
            .join(config_file_name(tenant_id, domain))
    }

    /// FastCGI socket shared by a tenant's sites on one PHP version
    pub fn php_socket(&self, php_version: &str, tenant_id: u32) -> PathBuf {
        self.paths
            .php_run_dir
            .join(format!("php{}-fpm-a{}.sock", php_version, tenant_id))
    }

    pub fn cgroup_root(&self) -> &Path {
        &self.paths.cgroup_root
    }

    pub fn cgroup_dir(&self, tenant_id: u32) -> PathBuf {
        self.paths
            .cgroup_root
            .join(format!("account-{}", tenant_id))
    }

    pub fn quota_mount(&self) -> &Path {
        &self.paths.quota_mount
    }
}

/// Lexical normalization; `..` pops, `.` is dropped, nothing is resolved on disk
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn layout() -> Layout {
        Layout::new(PathsConfig::default())
    }

    #[test]
    fn tenant_names_round_trip() {
        assert_eq!(tenant_dir_name(10001), "a-10001");
        assert_eq!(parse_tenant_dir_name("a-10001"), Some(10001));
        assert_eq!(parse_tenant_dir_name("a-"), None);
        assert_eq!(parse_tenant_dir_name("a-12x"), None);
        assert_eq!(parse_tenant_dir_name("b-10001"), None);
        assert_eq!(parse_tenant_dir_name("a--1"), None);
    }

    #[test]
    fn config_names_parse_domains_with_dashes() {
        assert_eq!(config_file_name(10001, "acme.test"), "a-10001-acme.test.conf");
        assert_eq!(
            parse_config_file_name("a-10002-my-shop.test.conf"),
            Some((10002, "my-shop.test".to_string()))
        );
        assert_eq!(parse_config_file_name("default"), None);
        assert_eq!(parse_config_file_name("a-x-y.conf"), None);
    }

    #[test]
    fn stock_paths() {
        let layout = layout();
        assert_eq!(
            layout.nginx_available(10001, "acme.test"),
            PathBuf::from("/etc/nginx/sites-available/a-10001-acme.test.conf")
        );
        assert_eq!(
            layout.pool_file("8.2", 10001, "acme.test"),
            PathBuf::from("/etc/php/8.2/fpm/pool.d/a-10001-acme.test.conf")
        );
        assert_eq!(
            layout.php_socket("8.2", 10001),
            PathBuf::from("/run/php/php8.2-fpm-a10001.sock")
        );
        assert_eq!(
            layout.cgroup_dir(10001),
            PathBuf::from("/sys/fs/cgroup/owehost/account-10001")
        );
        assert_eq!(
            layout.database_dir(10001, DbEngine::Mariadb, "shop"),
            PathBuf::from("/srv/accounts/a-10001/databases/mysql/shop")
        );
    }

    #[test]
    fn document_root_is_contained() {
        let layout = layout();
        assert_eq!(
            layout.document_root(10001, "acme.test", "public").unwrap(),
            PathBuf::from("/srv/accounts/a-10001/web/acme.test/public")
        );
        assert!(layout.document_root(10001, "acme.test", "../etc").is_err());
        assert!(layout.document_root(10001, "acme.test", "/etc").is_err());
        assert!(layout.document_root(10001, "acme.test", ".").is_err());
    }

    proptest! {
        #[test]
        fn accepted_document_roots_stay_inside_the_site(
            id in 10001u32..20000,
            segments in proptest::collection::vec("[A-Za-z0-9_.-]{1,8}", 1..4),
        ) {
            let layout = layout();
            let docroot = segments.join("/");
            let site_dir = layout.site_dir(id, "acme.test");
            if let Ok(path) = layout.document_root(id, "acme.test", &docroot) {
                prop_assert!(path.starts_with(&site_dir));
                prop_assert_ne!(path, site_dir);
            }
        }
    }
}
