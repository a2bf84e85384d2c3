// src/scanner/integrity.rs

use serde::{Deserialize, Serialize};

use super::TenantSnapshot;
use crate::error::ErrorKind;
use crate::model::Descriptor;
use crate::store::atomic::SECRET_MODE;
use crate::validation::validate_document_root;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// One finding of an integrity pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub tenant_id: u32,
    pub resource: String,
    pub severity: Severity,
    pub kind: ErrorKind,
    pub message: String,
}

impl IntegrityIssue {
    fn error(tenant_id: u32, resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tenant_id,
            resource: resource.into(),
            severity: Severity::Error,
            kind: ErrorKind::Validation,
            message: message.into(),
        }
    }

    fn warning(tenant_id: u32, resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(tenant_id, resource, message)
        }
    }
}

/// Checks a snapshot for problems a reload or rebuild would trip over.
/// Scan errors are reported first, then cross-resource checks.
pub fn validate_integrity(snapshot: &TenantSnapshot) -> Vec<IntegrityIssue> {
    let id = snapshot.tenant_id;
    let mut issues: Vec<IntegrityIssue> = snapshot
        .errors
        .iter()
        .map(|e| IntegrityIssue {
            kind: e.kind,
            ..IntegrityIssue::error(id, e.resource.clone(), e.message.clone())
        })
        .collect();

    let scan_failed = |resource: &str| snapshot.errors.iter().any(|e| e.resource == resource);

    match &snapshot.identity {
        Some(identity) if identity.id != id => issues.push(IntegrityIssue::error(
            id,
            "identity",
            format!("account.json names tenant {}", identity.id),
        )),
        Some(_) => {}
        None if !scan_failed("identity") => {
            issues.push(IntegrityIssue::error(id, "identity", "account.json missing"))
        }
        None => {}
    }

    if snapshot.limits.is_none() && !scan_failed("limits") {
        issues.push(IntegrityIssue::warning(id, "limits", "limits.json missing, plan preset applies"));
    }

    for site in &snapshot.sites {
        let resource = format!("site:{}", site.domain);
        if let Err(e) = site.validate() {
            issues.push(IntegrityIssue::error(id, resource.clone(), e.to_string()));
        }
        if let Err(e) = validate_document_root(&site.document_root) {
            issues.push(IntegrityIssue::error(id, resource.clone(), e.to_string()));
        }
        if site.ssl {
            let complete = snapshot
                .tls
                .iter()
                .any(|tls| tls.domain == site.domain && tls.is_complete());
            if !complete {
                issues.push(IntegrityIssue::error(
                    id,
                    resource,
                    "ssl enabled but no certificate and key",
                ));
            }
        }
    }

    for tls in &snapshot.tls {
        let resource = format!("tls:{}", tls.domain);
        if let Some(mode) = tls.key_mode {
            if mode != SECRET_MODE {
                issues.push(IntegrityIssue::error(
                    id,
                    resource.clone(),
                    format!("key.pem mode {:o}, expected {:o}", mode, SECRET_MODE),
                ));
            }
        }
        if let Some(meta) = &tls.meta {
            if meta.domain != tls.domain {
                issues.push(IntegrityIssue::warning(
                    id,
                    resource.clone(),
                    format!("meta.json describes {}", meta.domain),
                ));
            }
        }
        if !snapshot.sites.iter().any(|site| site.domain == tls.domain) {
            issues.push(IntegrityIssue::warning(id, resource, "no site for this domain"));
        }
    }

    issues
}
