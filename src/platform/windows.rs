use super::TrustStoreAdapter;
use anyhow::{anyhow, Result};
use std::path::Path;
use std::process::Command;

pub struct WindowsTrustStore;

impl WindowsTrustStore {
    pub const fn new() -> Self {
        Self
    }

    fn run_certutil(args: &[&str]) -> Result<bool> {
        let status = Command::new("certutil").args(args).status();
        match status {
            Ok(code) if code.success() => Ok(true),
            Ok(_) => Ok(false),
            Err(err) => Err(anyhow!(err)),
        }
    }
}

impl TrustStoreAdapter for WindowsTrustStore {
    fn install(&self, cert_path: &Path) -> Result<()> {
        let cert_path = cert_path
            .to_str()
            .ok_or_else(|| anyhow!("certificate path is not valid UTF-8"))?;
        let installed = Self::run_certutil(&["-addstore", "-user", "Root", cert_path])?;
        if installed {
            Ok(())
        } else {
            Err(anyhow!("certutil -addstore failed"))
        }
    }

    fn uninstall(&self, common_name: &str) -> Result<()> {
        let removed = Self::run_certutil(&["-delstore", "-user", "Root", common_name])?;
        if removed {
            Ok(())
        } else {
            Err(anyhow!("certutil -delstore failed"))
        }
    }

    fn is_trusted(&self, common_name: &str) -> Result<bool> {
        let query = format!("Root {common_name}");
        Self::run_certutil(&["-store", "-user", "Root", &query])
    }

    fn needs_elevation(&self) -> bool {
        false
    }

    fn human_name(&self) -> &'static str {
        "Windows Certificate Store"
    }
}
