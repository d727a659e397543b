use super::TrustStoreAdapter;
use anyhow::{anyhow, Result};
use std::path::Path;

pub struct NoopTrustStore;

impl NoopTrustStore {
    pub const fn new() -> Self {
        Self
    }
}

impl TrustStoreAdapter for NoopTrustStore {
    fn install(&self, _cert_path: &Path) -> Result<()> {
        Err(anyhow!("CA trust-store installation unsupported on this platform"))
    }

    fn uninstall(&self, _common_name: &str) -> Result<()> {
        Err(anyhow!("CA trust-store removal unsupported on this platform"))
    }

    fn is_trusted(&self, _common_name: &str) -> Result<bool> {
        Ok(false)
    }

    fn needs_elevation(&self) -> bool {
        false
    }

    fn human_name(&self) -> &'static str {
        "unsupported"
    }
}
