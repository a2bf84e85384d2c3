// src/host/tls.rs

//! Per-domain TLS material under `ssl/<domain>/`.

use std::fs::{self, Permissions};
use std::io::{self, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use chrono::{Duration, TimeZone, Utc};
use tracing::{debug, info};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::parse_x509_certificate;

use crate::error::{CoreError, Result};
use crate::host::{run_checked, HostOps};
use crate::model::{format_rfc3339, CertType, TlsMeta};
use crate::store::atomic::{self, FILE_MODE, SECRET_MODE, SSL_DIR_MODE};

pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";
pub const CHAIN_FILE: &str = "chain.pem";
pub const FULLCHAIN_FILE: &str = "fullchain.pem";

/// Days a placeholder certificate stays valid
pub const SELF_SIGNED_DAYS: i64 = 365;

/// Paths of the material in one TLS directory
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub dir: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub chain: PathBuf,
    pub fullchain: PathBuf,
}

impl TlsFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            cert: dir.join(CERT_FILE),
            key: dir.join(KEY_FILE),
            chain: dir.join(CHAIN_FILE),
            fullchain: dir.join(FULLCHAIN_FILE),
            dir,
        }
    }

    /// Both halves of the key pair are present
    pub fn has_pair(&self) -> bool {
        self.cert.is_file() && self.key.is_file()
    }
}

/// Generates a placeholder self-signed pair with `openssl`
pub async fn generate_self_signed(host: &dyn HostOps, files: &TlsFiles, domain: &str) -> Result<()> {
    atomic::ensure_dir(&files.dir, SSL_DIR_MODE)?;
    let key = files.key.to_string_lossy().into_owned();
    let cert = files.cert.to_string_lossy().into_owned();
    let days = SELF_SIGNED_DAYS.to_string();
    let subject = format!("/CN={}", domain);

    run_checked(
        host,
        "openssl",
        &[
            "req", "-x509", "-nodes", "-newkey", "rsa:2048", "-keyout", &key, "-out", &cert,
            "-days", &days, "-subj", &subject,
        ],
        &[],
    )
    .await?;

    if !files.has_pair() {
        return Err(CoreError::OsExec {
            program: "openssl".to_string(),
            code: Some(0),
            stderr: format!("no key pair written to {}", files.dir.display()),
        });
    }
    info!(domain, "Generated self-signed certificate");
    Ok(())
}

/// Writes `fullchain.pem` as the certificate followed by the chain, if any
pub fn rebuild_fullchain(files: &TlsFiles) -> Result<()> {
    let mut bundle = fs::read(&files.cert).map_err(|e| CoreError::io(&files.cert, e))?;
    match fs::read(&files.chain) {
        Ok(chain) => {
            if !bundle.ends_with(b"\n") {
                bundle.push(b'\n');
            }
            bundle.extend_from_slice(&chain);
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(CoreError::io(&files.chain, e)),
    }
    atomic::write_bytes(&files.fullchain, &bundle, FILE_MODE)
}

/// Key 0600; certificate, chain and fullchain 0644
pub fn enforce_modes(files: &TlsFiles) -> Result<()> {
    for (path, mode) in [
        (&files.key, SECRET_MODE),
        (&files.cert, FILE_MODE),
        (&files.chain, FILE_MODE),
        (&files.fullchain, FILE_MODE),
    ] {
        match fs::set_permissions(path, Permissions::from_mode(mode)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CoreError::io(path, e)),
        }
    }
    debug!("TLS modes enforced in {}", files.dir.display());
    Ok(())
}

/// Derives metadata from the first certificate of a PEM file
pub fn inspect_certificate(path: &Path, domain: &str, cert_type: CertType) -> Result<TlsMeta> {
    let file = fs::File::open(path).map_err(|e| CoreError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).map_err(|e| CoreError::io(path, e))?;
    let der = certs
        .first()
        .ok_or_else(|| CoreError::corrupt(path, "no certificate in PEM file"))?;

    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| CoreError::corrupt(path, format!("invalid certificate: {}", e)))?;

    let mut san = Vec::new();
    if let Ok(Some(ext)) = cert.subject_alternative_name() {
        for name in &ext.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                san.push(dns.to_string());
            }
        }
    }

    let validity = cert.validity();
    Ok(TlsMeta {
        domain: domain.to_string(),
        cert_type,
        issuer: cert.issuer().to_string(),
        subject: cert.subject().to_string(),
        san,
        not_before: timestamp(validity.not_before.timestamp()),
        not_after: timestamp(validity.not_after.timestamp()),
        auto_renew: false,
        last_renewal: None,
    })
}

fn timestamp(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(format_rfc3339)
        .unwrap_or_default()
}

/// Metadata for a placeholder certificate when the file cannot be inspected
pub fn self_signed_meta(domain: &str) -> TlsMeta {
    let now = Utc::now();
    TlsMeta {
        domain: domain.to_string(),
        cert_type: CertType::SelfSigned,
        issuer: format!("CN={}", domain),
        subject: format!("CN={}", domain),
        san: vec![domain.to_string()],
        not_before: format_rfc3339(now),
        not_after: format_rfc3339(now + Duration::days(SELF_SIGNED_DAYS)),
        auto_renew: false,
        last_renewal: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::atomic::file_mode;
    use tempfile::tempdir;

    const CERT: &str = include_str!("../../tests/fixtures/acme.test.crt");
    const KEY: &str = include_str!("../../tests/fixtures/acme.test.key");

    fn material(with_chain: bool) -> (tempfile::TempDir, TlsFiles) {
        let dir = tempdir().unwrap();
        let files = TlsFiles::new(dir.path().join("acme.test"));
        fs::create_dir_all(&files.dir).unwrap();
        fs::write(&files.cert, CERT).unwrap();
        fs::write(&files.key, KEY).unwrap();
        if with_chain {
            fs::write(&files.chain, CERT).unwrap();
        }
        (dir, files)
    }

    #[test]
    fn inspects_subject_and_san() {
        let (_dir, files) = material(false);
        let meta = inspect_certificate(&files.cert, "acme.test", CertType::Custom).unwrap();
        assert!(meta.subject.contains("acme.test"));
        assert_eq!(meta.san, vec!["acme.test".to_string(), "www.acme.test".to_string()]);
        assert!(meta.not_before < meta.not_after);
        assert_eq!(meta.cert_type, CertType::Custom);
    }

    #[test]
    fn garbage_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cert.pem");
        fs::write(&path, "not a certificate").unwrap();
        assert!(inspect_certificate(&path, "acme.test", CertType::Custom).is_err());
    }

    #[test]
    fn fullchain_concatenates_chain() {
        let (_dir, files) = material(true);
        rebuild_fullchain(&files).unwrap();
        let fullchain = fs::read_to_string(&files.fullchain).unwrap();
        assert_eq!(fullchain.matches("BEGIN CERTIFICATE").count(), 2);

        fs::remove_file(&files.chain).unwrap();
        rebuild_fullchain(&files).unwrap();
        assert_eq!(fs::read_to_string(&files.fullchain).unwrap(), CERT);
    }

    #[test]
    fn modes_are_enforced() {
        let (_dir, files) = material(false);
        fs::set_permissions(&files.key, Permissions::from_mode(0o644)).unwrap();
        rebuild_fullchain(&files).unwrap();
        enforce_modes(&files).unwrap();
        assert_eq!(file_mode(&files.key).unwrap(), 0o600);
        assert_eq!(file_mode(&files.cert).unwrap(), 0o644);
        assert_eq!(file_mode(&files.fullchain).unwrap(), 0o644);
    }
}
