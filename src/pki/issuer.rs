//! On-demand leaf-certificate issuer: wildcard keying, memory+disk cache, and
//! the SNI-driven `certificateForSni` lookup.
//!
//! Grounded on the teacher's `CertManager::server_config_for_host` /
//! `issue_leaf_cert` (issue-on-miss, cache the built `rustls::ServerConfig`,
//! never hold the cache lock across the signing/IO path) generalized from a
//! single cache keyed by literal host to the two-level wildcard-key scheme
//! and persistent disk cache required by §4.2.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use rcgen::{
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, KeyPair, KeyUsagePurpose,
    SanType,
};
use rcgen::CertificateParams;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::ServerConfig;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

use crate::error::IssuerError;
use crate::pki::ca::CertificateAuthority;

/// Leaves become eligible for renewal 7 days before they expire.
const RENEWAL_WINDOW: Duration = Duration::days(7);
const LEAF_VALIDITY: Duration = Duration::days(30);
const MAX_SANITIZED_NAME_BYTES: usize = 200;

struct CachedLeaf {
    server_config: Arc<ServerConfig>,
    not_after: OffsetDateTime,
}

impl CachedLeaf {
    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        self.not_after - now > RENEWAL_WINDOW
    }
}

pub struct CertificateIssuer {
    ca: Arc<CertificateAuthority>,
    leaf_dir: PathBuf,
    cache: RwLock<HashMap<String, CachedLeaf>>,
}

impl CertificateIssuer {
    pub fn new(ca: Arc<CertificateAuthority>, leaf_dir: impl Into<PathBuf>) -> Self {
        Self {
            ca,
            leaf_dir: leaf_dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Compute the wildcard key for a lowercased server name: the name itself
    /// for ≤2 labels, otherwise `*.` + everything after the first label.
    /// Idempotent: `wildcard_key(wildcard_key(x)) == wildcard_key(x)`.
    pub fn wildcard_key(server_name: &str) -> String {
        let lower = server_name.to_ascii_lowercase();
        let labels: Vec<&str> = lower.split('.').collect();
        if labels.len() <= 2 {
            lower
        } else {
            format!("*.{}", labels[1..].join("."))
        }
    }

    /// The wildcard key with any leading `*.` stripped.
    fn base(wildcard_key: &str) -> String {
        wildcard_key
            .strip_prefix("*.")
            .map(str::to_string)
            .unwrap_or_else(|| wildcard_key.to_string())
    }

    fn sanitize_filename(wildcard_key: &str) -> String {
        let replaced = wildcard_key.replace('*', "_wildcard_").replace(':', "_");
        if replaced.len() <= MAX_SANITIZED_NAME_BYTES {
            return replaced;
        }
        let digest = Sha256::digest(wildcard_key.as_bytes());
        hex::encode(&digest[..16])
    }

    fn cert_path(&self, sanitized: &str) -> PathBuf {
        self.leaf_dir.join(format!("{sanitized}.pem"))
    }

    fn key_path(&self, sanitized: &str) -> PathBuf {
        self.leaf_dir.join(format!("{sanitized}-key.pem"))
    }

    /// Resolve (issuing if necessary) the TLS server config to present for a
    /// given SNI server name.
    pub fn certificate_for_sni(&self, server_name: &str) -> Result<Arc<ServerConfig>, IssuerError> {
        if server_name.is_empty() {
            return Err(IssuerError::InvalidHostname);
        }
        let key = Self::wildcard_key(server_name);
        let now = OffsetDateTime::now_utc();

        if let Some(config) = self.memory_hit(&key, now) {
            return Ok(config);
        }

        if let Some(config) = self.disk_hit(&key, now)? {
            return Ok(config);
        }

        self.issue(&key, server_name, now)
    }

    fn memory_hit(&self, key: &str, now: OffsetDateTime) -> Option<Arc<ServerConfig>> {
        let cache = self.cache.read().expect("issuer cache poisoned");
        cache
            .get(key)
            .filter(|leaf| leaf.is_fresh(now))
            .map(|leaf| leaf.server_config.clone())
    }

    fn disk_hit(
        &self,
        key: &str,
        now: OffsetDateTime,
    ) -> Result<Option<Arc<ServerConfig>>, IssuerError> {
        let sanitized = Self::sanitize_filename(key);
        let cert_path = self.cert_path(&sanitized);
        let key_path = self.key_path(&sanitized);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let cert_pem = match fs::read_to_string(&cert_path) {
            Ok(pem) => pem,
            Err(e) => {
                tracing::warn!(path = %cert_path.display(), error = %e, "failed to read cached leaf certificate");
                return Ok(None);
            }
        };
        let key_pem = match fs::read_to_string(&key_path) {
            Ok(pem) => pem,
            Err(e) => {
                tracing::warn!(path = %key_path.display(), error = %e, "failed to read cached leaf key");
                return Ok(None);
            }
        };

        let Some((cert_der, not_after)) = parse_cert_pem(&cert_pem) else {
            tracing::warn!(path = %cert_path.display(), "failed to parse cached leaf certificate");
            return Ok(None);
        };
        if now >= not_after - RENEWAL_WINDOW {
            return Ok(None);
        }
        let Some(key_der) = parse_key_pem(&key_pem) else {
            tracing::warn!(path = %key_path.display(), "failed to parse cached leaf key");
            return Ok(None);
        };

        let server_config = build_server_config(vec![cert_der], key_der)?;
        let server_config = Arc::new(server_config);

        let mut cache = self.cache.write().expect("issuer cache poisoned");
        cache.insert(
            key.to_string(),
            CachedLeaf {
                server_config: server_config.clone(),
                not_after,
            },
        );
        Ok(Some(server_config))
    }

    fn issue(
        &self,
        key: &str,
        server_name: &str,
        now: OffsetDateTime,
    ) -> Result<Arc<ServerConfig>, IssuerError> {
        let base = Self::base(key);
        let mut sans = Vec::new();
        for candidate in [key.to_string(), base, server_name.to_ascii_lowercase()] {
            if !sans.contains(&candidate) {
                sans.push(candidate);
            }
        }

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, key);
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = now.checked_sub(Duration::hours(1)).unwrap_or(now);
        let not_after = now.checked_add(LEAF_VALIDITY).unwrap_or(now);
        params.not_after = not_after;
        params.subject_alt_names = sans
            .iter()
            .map(|s| {
                Ia5String::try_from(s.as_str())
                    .map(SanType::DnsName)
                    .map_err(|_| IssuerError::Issue(format!("invalid SAN {s}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let leaf_key = KeyPair::generate()
            .map_err(|e| IssuerError::Issue(format!("generating leaf key: {e}")))?;
        let cert = params
            .signed_by(&leaf_key, &self.ca.cert, &self.ca.key)
            .map_err(|e| IssuerError::Issue(format!("signing leaf certificate: {e}")))?;

        self.persist_to_disk(key, &cert.pem(), &leaf_key.serialize_pem());

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let server_config = Arc::new(build_server_config(vec![cert_der], key_der)?);

        let mut cache = self.cache.write().expect("issuer cache poisoned");
        cache.insert(
            key.to_string(),
            CachedLeaf {
                server_config: server_config.clone(),
                not_after,
            },
        );
        Ok(server_config)
    }

    /// Disk cache failures never fail issuance — the leaf is still served
    /// from memory.
    fn persist_to_disk(&self, key: &str, cert_pem: &str, key_pem: &str) {
        if let Err(e) = fs::create_dir_all(&self.leaf_dir) {
            tracing::warn!(error = %e, "failed to create leaf cache directory");
            return;
        }

        let sanitized = Self::sanitize_filename(key);
        let cert_path = self.cert_path(&sanitized);
        let key_path = self.key_path(&sanitized);

        if let Err(e) = fs::write(&cert_path, cert_pem) {
            tracing::warn!(path = %cert_path.display(), error = %e, "failed to write leaf certificate to disk cache");
            return;
        }
        let _ = set_file_mode(&cert_path, 0o644);

        if let Err(e) = fs::write(&key_path, key_pem) {
            tracing::warn!(path = %key_path.display(), error = %e, "failed to write leaf key, rolling back cached certificate");
            let _ = fs::remove_file(&cert_path);
            return;
        }
        let _ = set_file_mode(&key_path, 0o600);
    }

    /// Drop every cached leaf, in memory only (disk cache is left alone and
    /// will be reused on next lookup if still fresh).
    pub fn clear_memory_cache(&self) {
        self.cache.write().expect("issuer cache poisoned").clear();
    }
}

fn build_server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key_der: PrivateKeyDer<'static>,
) -> Result<ServerConfig, IssuerError> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key_der)
        .map_err(|e| IssuerError::Issue(format!("building TLS server config: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn parse_cert_pem(pem: &str) -> Option<(CertificateDer<'static>, OffsetDateTime)> {
    let params = CertificateParams::from_ca_cert_pem(pem).ok()?;
    let not_after = params.not_after;
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    let der = rustls_pemfile::certs(&mut reader).next()?.ok()?;
    Some((der, not_after))
}

fn parse_key_pem(pem: &str) -> Option<PrivateKeyDer<'static>> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader).ok().flatten()
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
    fn wildcard_key_rules() {
        assert_eq!(CertificateIssuer::wildcard_key("example.localhost"), "example.localhost");
        assert_eq!(
            CertificateIssuer::wildcard_key("api.example.localhost"),
            "*.example.localhost"
        );
        assert_eq!(
            CertificateIssuer::wildcard_key("v1.api.example.localhost"),
            "*.api.example.localhost"
        );
    }

    #[test]
    fn wildcard_key_is_idempotent() {
        for input in ["example.localhost", "api.example.localhost", "v1.api.example.localhost"] {
            let once = CertificateIssuer::wildcard_key(input);
            let twice = CertificateIssuer::wildcard_key(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn sanitize_replaces_wildcard_and_colon() {
        assert_eq!(
            CertificateIssuer::sanitize_filename("*.example.localhost"),
            "_wildcard_.example.localhost"
        );
        assert_eq!(CertificateIssuer::sanitize_filename("a:b"), "a_b");
    }

    fn new_issuer(dir: &Path) -> CertificateIssuer {
        let ca = CertificateAuthority::generate(&dir.join("ca")).expect("ca");
        CertificateIssuer::new(Arc::new(ca), dir.join("leaves"))
    }

    #[test]
    fn issues_and_caches_leaf_with_expected_alpn() {
        let dir = tempdir().unwrap();
        let issuer = new_issuer(dir.path());

        let config = issuer
            .certificate_for_sni("api.example.localhost")
            .expect("issue leaf");
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        // Second call should hit the in-memory cache without touching disk again.
        let sanitized = CertificateIssuer::sanitize_filename("*.example.localhost");
        let cert_path = issuer.cert_path(&sanitized);
        let modified_before = fs::metadata(&cert_path).unwrap().modified().unwrap();
        let _ = issuer.certificate_for_sni("api.example.localhost").unwrap();
        let modified_after = fs::metadata(&cert_path).unwrap().modified().unwrap();
        assert_eq!(modified_before, modified_after);
    }

    /// Parses the disk-cached PEM back with rcgen's own `x509-parser`-backed
    /// decoder and returns its DNS SAN entries as `SanType::DnsName` values,
    /// in order.
    fn issued_sans(issuer: &CertificateIssuer, wildcard_key: &str) -> Vec<SanType> {
        let sanitized = CertificateIssuer::sanitize_filename(wildcard_key);
        let cert_pem = fs::read_to_string(issuer.cert_path(&sanitized)).expect("cached cert pem");
        let params = CertificateParams::from_ca_cert_pem(&cert_pem).expect("parse issued cert");
        params.subject_alt_names
    }

    fn dns_san(name: &str) -> SanType {
        SanType::DnsName(Ia5String::try_from(name).unwrap())
    }

    #[test]
    fn issued_leaf_has_wildcard_base_and_exact_name_sans() {
        let dir = tempdir().unwrap();
        let issuer = new_issuer(dir.path());
        issuer
            .certificate_for_sni("api.example.localhost")
            .expect("issue leaf");

        let sans = issued_sans(&issuer, "*.example.localhost");
        assert_eq!(
            sans,
            vec![
                dns_san("*.example.localhost"),
                dns_san("example.localhost"),
                dns_san("api.example.localhost"),
            ]
        );
    }

    #[test]
    fn issued_leaf_dedups_sans_when_wildcard_key_equals_server_name() {
        let dir = tempdir().unwrap();
        let issuer = new_issuer(dir.path());
        issuer
            .certificate_for_sni("example.localhost")
            .expect("issue leaf");

        let sans = issued_sans(&issuer, "example.localhost");
        assert_eq!(sans, vec![dns_san("example.localhost")]);
    }

    #[test]
    fn empty_server_name_is_invalid() {
        let dir = tempdir().unwrap();
        let issuer = new_issuer(dir.path());
        assert!(matches!(
            issuer.certificate_for_sni(""),
            Err(IssuerError::InvalidHostname)
        ));
    }
}
