//! Local root Certificate Authority: generation, persistence, and loading.
//!
//! Grounded on the teacher's `proxy::cert_manager::CertManager::new`/
//! `generate_root` (self-signed root over a freshly generated key, written as
//! cert+key PEM pairs) with the permission discipline from the wider pack's
//! CA implementations (restrictive `0600` on the key file, `0700` on its
//! directory) and the §3/§4.1 invariants: P-384 key, `pathLen = 0`, one-year
//! validity, a 128-bit random serial, and cert-rollback if the key write
//! fails.

use std::fs;
use std::path::{Path, PathBuf};

use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa,
    KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P384_SHA384,
};
use rcgen::KeyPair;
use time::{Duration, OffsetDateTime};

use crate::error::CaError;

const CERT_FILE: &str = "root-ca.pem";
const KEY_FILE: &str = "root-ca-key.pem";
const COMMON_NAME: &str = "devproxy Local CA";
const ORG_NAME: &str = "devproxy";

/// A loaded or freshly generated root CA, holding the parsed certificate and
/// key pair needed to sign leaf certificates.
pub struct CertificateAuthority {
    ca_dir: PathBuf,
    pub cert: Certificate,
    pub key: KeyPair,
}

impl CertificateAuthority {
    fn cert_path(ca_dir: &Path) -> PathBuf {
        ca_dir.join(CERT_FILE)
    }

    fn key_path(ca_dir: &Path) -> PathBuf {
        ca_dir.join(KEY_FILE)
    }

    /// Whether both CA files are already present on disk.
    pub fn exists(ca_dir: &Path) -> bool {
        Self::cert_path(ca_dir).exists() && Self::key_path(ca_dir).exists()
    }

    /// Load an existing CA from disk. Malformed PEM or parse failure is a
    /// hard error; this function never writes.
    pub fn load(ca_dir: &Path) -> Result<Self, CaError> {
        let cert_path = Self::cert_path(ca_dir);
        let key_path = Self::key_path(ca_dir);

        let cert_pem = fs::read_to_string(&cert_path).map_err(|source| CaError::Io {
            path: cert_path.clone(),
            source,
        })?;
        let key_pem = fs::read_to_string(&key_path).map_err(|source| CaError::Io {
            path: key_path.clone(),
            source,
        })?;

        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| CaError::PemParse(format!("CA key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| CaError::PemParse(format!("CA certificate: {e}")))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| CaError::CertBuild(e.to_string()))?;

        Ok(Self {
            ca_dir: ca_dir.to_path_buf(),
            cert,
            key,
        })
    }

    /// Generate a fresh root CA and persist it. The only writer of CA
    /// material: creates the CA directory (`0700`), writes the certificate
    /// (`0644`), then the key (`0600`); if the key write fails the
    /// certificate file is removed before returning the error.
    pub fn generate(ca_dir: &Path) -> Result<Self, CaError> {
        fs::create_dir_all(ca_dir).map_err(|source| CaError::Io {
            path: ca_dir.to_path_buf(),
            source,
        })?;
        set_dir_mode(ca_dir, 0o700).map_err(|source| CaError::Io {
            path: ca_dir.to_path_buf(),
            source,
        })?;

        let key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)
            .map_err(|e| CaError::CertBuild(format!("generating CA key: {e}")))?;
        let params = Self::build_params();
        let cert = params
            .self_signed(&key)
            .map_err(|e| CaError::CertBuild(e.to_string()))?;

        let cert_path = Self::cert_path(ca_dir);
        let key_path = Self::key_path(ca_dir);

        fs::write(&cert_path, cert.pem()).map_err(|source| CaError::Io {
            path: cert_path.clone(),
            source,
        })?;
        set_file_mode(&cert_path, 0o644).map_err(|source| CaError::Io {
            path: cert_path.clone(),
            source,
        })?;

        if let Err(source) = fs::write(&key_path, key.serialize_pem()) {
            let _ = fs::remove_file(&cert_path);
            return Err(CaError::KeyWriteRollback(source));
        }
        if let Err(source) = set_file_mode(&key_path, 0o600) {
            let _ = fs::remove_file(&cert_path);
            let _ = fs::remove_file(&key_path);
            return Err(CaError::KeyWriteRollback(source));
        }

        Ok(Self {
            ca_dir: ca_dir.to_path_buf(),
            cert,
            key,
        })
    }

    /// `exists ? load : generate`.
    pub fn load_or_generate(ca_dir: &Path) -> Result<Self, CaError> {
        if Self::exists(ca_dir) {
            Self::load(ca_dir)
        } else {
            Self::generate(ca_dir)
        }
    }

    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    fn build_params() -> CertificateParams {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, COMMON_NAME);
        dn.push(DnType::OrganizationName, ORG_NAME);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(random_serial());

        let now = OffsetDateTime::now_utc();
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        params.not_after = now.checked_add(Duration::days(365)).unwrap_or(now);

        params
    }
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    SerialNumber::from_slice(&bytes)
}

#[cfg(unix)]
fn set_dir_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generates_ca_once_and_reuses_existing_files() {
        let dir = tempdir().unwrap();
        let ca_dir = dir.path().join("ca");

        let original_pem = {
            let ca = CertificateAuthority::load_or_generate(&ca_dir).expect("initial creation");
            ca.cert.pem()
        };
        assert!(CertificateAuthority::cert_path(&ca_dir).exists());

        let reloaded = CertificateAuthority::load_or_generate(&ca_dir).expect("reuse existing");
        assert_eq!(reloaded.cert.pem(), original_pem);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let ca_dir = dir.path().join("ca");
        CertificateAuthority::generate(&ca_dir).expect("generate");

        let key_meta = fs::metadata(CertificateAuthority::key_path(&ca_dir)).unwrap();
        assert_eq!(key_meta.permissions().mode() & 0o777, 0o600);

        let dir_meta = fs::metadata(&ca_dir).unwrap();
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn load_rejects_malformed_pem() {
        let dir = tempdir().unwrap();
        let ca_dir = dir.path().join("ca");
        fs::create_dir_all(&ca_dir).unwrap();
        fs::write(CertificateAuthority::cert_path(&ca_dir), "not a cert").unwrap();
        fs::write(CertificateAuthority::key_path(&ca_dir), "not a key").unwrap();

        assert!(CertificateAuthority::load(&ca_dir).is_err());
    }
}
