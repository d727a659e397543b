//! Local CA and on-demand leaf-certificate issuance.

pub mod ca;
pub mod issuer;

pub use ca::CertificateAuthority;
pub use issuer::CertificateIssuer;
