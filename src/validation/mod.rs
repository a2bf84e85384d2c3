// src/validation/mod.rs

//! Pure validators for every descriptor kind.
//!
//! Nothing here touches the filesystem; the applier calls these before any
//! mutation and the store calls them after every read.

pub mod sanitize;

use std::path::{Component, Path};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::model::{
    Auth, CronJob, DatabaseMeta, Identity, Limits, Metadata, Site, Status, TlsMeta, UID_OFFSET,
    FIRST_TENANT_ID, UNLIMITED,
};

pub use sanitize::{sanitize_domain, sanitize_name};

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").unwrap());
static OWNER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(admin|reseller-[0-9]+|partner-[0-9]+)$").unwrap());
static LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").unwrap());
static DOCROOT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._/-]+$").unwrap());
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").unwrap());
static BCRYPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$2[abxy]?\$[0-9]{2}\$[./A-Za-z0-9]{53}$").unwrap());
static DB_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]{1,64}$").unwrap());
static HEADER_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9-]{1,64}$").unwrap());
static CRON_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());
static CRON_FIELD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9A-Za-z*/,-]+$").unwrap());

const CRON_MACROS: &[&str] = &[
    "@reboot", "@yearly", "@annually", "@monthly", "@weekly", "@daily", "@midnight", "@hourly",
];

/// A descriptor failed one of its invariants
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Validation failed for {field}: {message}")]
pub struct ValidationError {
    /// Dotted locator of the offending field
    pub field: String,

    /// Human readable reason
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

type Result<T = ()> = std::result::Result<T, ValidationError>;

fn ensure(condition: bool, field: &str, message: impl Into<String>) -> Result {
    if condition {
        Ok(())
    } else {
        Err(ValidationError::new(field, message))
    }
}

/// Validates a POSIX-style tenant name
pub fn validate_name(name: &str) -> Result {
    ensure(
        (3..=32).contains(&name.len()),
        "name",
        "must be between 3 and 32 characters",
    )?;
    ensure(
        NAME_RE.is_match(name),
        "name",
        "must start with a letter and contain only a-z, 0-9 and _",
    )
}

/// Validates an RFC 1035 host name
pub fn validate_domain(domain: &str) -> Result {
    ensure(!domain.is_empty(), "domain", "must not be empty")?;
    ensure(domain.len() <= 253, "domain", "must be at most 253 characters")?;
    ensure(
        domain.contains('.'),
        "domain",
        "must contain at least two labels",
    )?;
    for label in domain.split('.') {
        ensure(
            LABEL_RE.is_match(label),
            "domain",
            format!("invalid label '{}'", label),
        )?;
    }
    Ok(())
}

/// Validates an RFC 3339 timestamp
pub fn validate_timestamp(field: &str, value: &str) -> Result {
    ensure(
        crate::model::parse_rfc3339(value).is_some(),
        field,
        format!("'{}' is not an RFC 3339 timestamp", value),
    )
}

pub fn validate_email(email: &str) -> Result {
    ensure(EMAIL_RE.is_match(email), "contact_email", "invalid email address")
}

pub fn validate_identity(identity: &Identity) -> Result {
    ensure(
        identity.id >= FIRST_TENANT_ID,
        "identity.id",
        format!("must be at least {}", FIRST_TENANT_ID),
    )?;
    validate_name(&identity.name).map_err(|e| ValidationError::new("identity.name", e.message))?;

    let expected = UID_OFFSET + identity.id;
    ensure(
        identity.uid == expected,
        "identity.uid",
        format!("must equal {}", expected),
    )?;
    ensure(
        identity.gid == expected,
        "identity.gid",
        format!("must equal {}", expected),
    )?;
    ensure(identity.uid >= 1000, "identity.uid", "must be at least 1000")?;
    ensure(
        OWNER_RE.is_match(&identity.owner),
        "identity.owner",
        "must be admin, reseller-<n> or partner-<n>",
    )?;

    if !identity.created_at.is_empty() {
        validate_timestamp("identity.created_at", &identity.created_at)?;
    }
    Ok(())
}

// Upper bounds; scaled to bytes or quota blocks they still fit in a u64
pub const MAX_DISK_MB: i64 = 1 << 30;
pub const MAX_RAM_MB: i64 = 1 << 24;
pub const MAX_INODES: i64 = 1 << 40;
pub const MAX_BANDWIDTH_GB: i64 = 1 << 30;
pub const MAX_COUNT: i64 = 1_000_000;

fn limit_field(field: &str, value: i64, minimum: i64, maximum: i64) -> Result {
    if value == UNLIMITED {
        return Ok(());
    }
    ensure(
        value >= minimum,
        field,
        format!("must be -1 (unlimited) or at least {}", minimum),
    )?;
    ensure(value <= maximum, field, format!("must not exceed {}", maximum))
}

pub fn validate_limits(limits: &Limits) -> Result {
    limit_field("limits.disk_mb", limits.disk_mb, 100, MAX_DISK_MB)?;
    limit_field("limits.ram_mb", limits.ram_mb, 128, MAX_RAM_MB)?;
    limit_field("limits.domains", limits.domains, 1, MAX_COUNT)?;
    limit_field("limits.cpu_percent", limits.cpu_percent, 1, 400)?;
    limit_field("limits.databases", limits.databases, 0, MAX_COUNT)?;
    limit_field("limits.subdomains", limits.subdomains, 0, MAX_COUNT)?;
    limit_field("limits.email_accounts", limits.email_accounts, 0, MAX_COUNT)?;
    limit_field("limits.ftp_accounts", limits.ftp_accounts, 0, MAX_COUNT)?;
    limit_field("limits.bandwidth_gb", limits.bandwidth_gb, 0, MAX_BANDWIDTH_GB)?;
    limit_field("limits.inodes", limits.inodes, 0, MAX_INODES)
}

pub fn validate_status(status: &Status) -> Result {
    if let Some(ts) = &status.suspended_at {
        validate_timestamp("status.suspended_at", ts)?;
    }
    if let Some(ts) = &status.locked_at {
        validate_timestamp("status.locked_at", ts)?;
    }
    if let Some(reason) = &status.reason {
        ensure(reason.len() <= 512, "status.reason", "must be at most 512 characters")?;
    }
    Ok(())
}

pub fn validate_metadata(metadata: &Metadata) -> Result {
    if let Some(email) = &metadata.contact_email {
        validate_email(email).map_err(|e| ValidationError::new("metadata.contact_email", e.message))?;
    }
    for tag in &metadata.tags {
        ensure(
            TAG_RE.is_match(tag),
            "metadata.tags",
            format!("invalid tag '{}'", tag),
        )?;
    }
    if let Some(ts) = &metadata.updated_at {
        validate_timestamp("metadata.updated_at", ts)?;
    }
    Ok(())
}

pub fn validate_auth(auth: &Auth) -> Result {
    ensure(
        auth.password_hash.len() == 60 && BCRYPT_RE.is_match(&auth.password_hash),
        "auth.password_hash",
        "must be a bcrypt hash",
    )?;
    if let Some(ts) = &auth.last_login {
        validate_timestamp("auth.last_login", ts)?;
    }
    Ok(())
}

/// Validates a document root relative to the site directory
pub fn validate_document_root(document_root: &str) -> Result {
    let field = "site.document_root";
    ensure(!document_root.is_empty(), field, "must not be empty")?;
    ensure(
        DOCROOT_RE.is_match(document_root),
        field,
        "contains forbidden characters",
    )?;
    ensure(!document_root.starts_with('/'), field, "must be relative")?;

    for component in Path::new(document_root).components() {
        ensure(
            matches!(component, Component::Normal(_) | Component::CurDir),
            field,
            "must not traverse outside the site directory",
        )?;
    }
    ensure(!document_root.contains(".."), field, "must not contain '..'")
}

/// Rejects characters that would terminate or nest an nginx directive
fn ensure_directive_safe(field: &str, value: &str) -> Result {
    ensure(!value.is_empty(), field, "must not be empty")?;
    ensure(
        !value
            .chars()
            .any(|c| matches!(c, ';' | '{' | '}' | '"' | '\'' | '\\' | '\n' | '\r') || c.is_control()),
        field,
        "contains characters not allowed in a server directive",
    )
}

pub fn validate_site(site: &Site) -> Result {
    validate_domain(&site.domain).map_err(|e| ValidationError::new("site.domain", e.message))?;
    validate_document_root(&site.document_root)?;

    for alias in &site.aliases {
        validate_domain(alias).map_err(|e| ValidationError::new("site.aliases", e.message))?;
    }

    ensure(
        !site.ssl_redirect || site.ssl,
        "site.ssl_redirect",
        "requires ssl to be enabled",
    )?;

    for redirect in &site.redirects {
        ensure(
            matches!(redirect.code, 301 | 302 | 307 | 308),
            "site.redirects.code",
            format!("{} is not one of 301, 302, 307, 308", redirect.code),
        )?;
        ensure(
            !(redirect.regex && redirect.wildcard),
            "site.redirects",
            "regex and wildcard are mutually exclusive",
        )?;
        ensure_directive_safe("site.redirects.source", &redirect.source)?;
        ensure(
            !redirect.source.contains(char::is_whitespace),
            "site.redirects.source",
            "must not contain whitespace",
        )?;
        if !redirect.regex {
            ensure(
                redirect.source.starts_with('/'),
                "site.redirects.source",
                "must start with '/'",
            )?;
        }
        ensure_directive_safe("site.redirects.target", &redirect.target)?;
        ensure(
            !redirect.target.contains(char::is_whitespace),
            "site.redirects.target",
            "must not contain whitespace",
        )?;
    }

    for (code, page) in &site.error_pages {
        ensure(
            (400..=599).contains(code),
            "site.error_pages",
            format!("{} is not an HTTP error status", code),
        )?;
        ensure_directive_safe("site.error_pages", page)?;
        ensure(
            page.starts_with('/') && !page.contains("..") && !page.contains(char::is_whitespace),
            "site.error_pages",
            format!("'{}' must be an absolute URI path", page),
        )?;
    }

    for (name, value) in &site.headers {
        ensure(
            HEADER_NAME_RE.is_match(name),
            "site.headers",
            format!("invalid header name '{}'", name),
        )?;
        ensure_directive_safe("site.headers", value)?;
    }

    if let Some(settings) = &site.settings {
        ensure(
            settings.matches(&site.runtime),
            "site.settings",
            format!("settings block does not match runtime {}", site.runtime),
        )?;
        if let crate::model::RuntimeSettings::Php(php) = settings {
            for (field, value) in [
                ("site.settings.memory_limit", &php.memory_limit),
                ("site.settings.post_max_size", &php.post_max_size),
                ("site.settings.upload_max_filesize", &php.upload_max_filesize),
            ] {
                ensure(
                    is_php_size(value),
                    field,
                    format!("'{}' is not a PHP size", value),
                )?;
            }
        }
    }
    Ok(())
}

/// `-1` or digits with an optional K/M/G suffix
fn is_php_size(value: &str) -> bool {
    if value == "-1" {
        return true;
    }
    let digits = value.trim_end_matches(['K', 'M', 'G', 'k', 'm', 'g']);
    !digits.is_empty()
        && digits.len() + 1 >= value.len()
        && digits.chars().all(|c| c.is_ascii_digit())
}

pub fn validate_tls_meta(meta: &TlsMeta) -> Result {
    validate_domain(&meta.domain).map_err(|e| ValidationError::new("tls.domain", e.message))?;
    if !meta.not_before.is_empty() {
        validate_timestamp("tls.not_before", &meta.not_before)?;
    }
    if !meta.not_after.is_empty() {
        validate_timestamp("tls.not_after", &meta.not_after)?;
    }
    Ok(())
}

pub fn validate_database(meta: &DatabaseMeta) -> Result {
    ensure(
        DB_NAME_RE.is_match(&meta.name),
        "database.name",
        "must be 1-64 characters of A-Z, a-z, 0-9 and _",
    )?;
    for grant in &meta.users {
        ensure(
            DB_NAME_RE.is_match(&grant.username),
            "database.users.username",
            format!("invalid username '{}'", grant.username),
        )?;
        ensure(
            !grant.host.is_empty() && !grant.host.contains(char::is_whitespace),
            "database.users.host",
            "invalid host",
        )?;
    }
    if let Some(ts) = &meta.created_at {
        validate_timestamp("database.created_at", ts)?;
    }
    Ok(())
}

pub fn validate_cron(job: &CronJob) -> Result {
    ensure(CRON_ID_RE.is_match(&job.id), "cron.id", "invalid job id")?;
    ensure(!job.command.trim().is_empty(), "cron.command", "must not be empty")?;
    ensure(
        !job.command.contains('\n') && !job.command.contains('\r'),
        "cron.command",
        "must be a single line",
    )?;

    let schedule = job.schedule.trim();
    if schedule.starts_with('@') {
        return ensure(
            CRON_MACROS.contains(&schedule),
            "cron.schedule",
            format!("unknown macro '{}'", schedule),
        );
    }
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    ensure(fields.len() == 5, "cron.schedule", "must have five fields")?;
    for field in fields {
        ensure(
            CRON_FIELD_RE.is_match(field),
            "cron.schedule",
            format!("invalid field '{}'", field),
        )?;
    }
    Ok(())
}
