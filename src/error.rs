//! Typed error taxonomy for the core PKI, registry, and parsing subsystems.
//!
//! Application-level call sites (entrypoints, the synchronizer, `main.rs`) fold
//! these into `anyhow::Error` via `.context(...)`; library-ish modules return
//! these directly so a caller can match on the variant that matters to it
//! (e.g. the registry distinguishing exact-exists from wildcard-exists).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse CA PEM material: {0}")]
    PemParse(String),
    #[error("failed to build CA certificate: {0}")]
    CertBuild(String),
    #[error("CA key write failed, certificate rolled back: {0}")]
    KeyWriteRollback(std::io::Error),
}

#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("empty server name")]
    InvalidHostname,
    #[error("CA unavailable: {0}")]
    CaUnavailable(#[from] CaError),
    #[error("failed to issue leaf certificate: {0}")]
    Issue(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("route for host {0} already exists")]
    Exists(String),
    #[error("route for wildcard pattern {0} already exists")]
    WildcardExists(String),
    #[error("no route for host {0}")]
    NotFound(String),
    #[error("invalid host {0}")]
    InvalidHost(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    #[error("not a TLS ClientHello")]
    NotTls,
    #[error("invalid ClientHello: {0}")]
    InvalidClientHello(&'static str),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("missing host label")]
    MissingHost,
    #[error("invalid host {0}")]
    InvalidHost(String),
    #[error("invalid port {0}")]
    InvalidPort(String),
}
