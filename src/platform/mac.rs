use super::TrustStoreAdapter;
use anyhow::{anyhow, Result};
use std::path::Path;
use std::process::Command;

pub struct MacTrustStore;

impl MacTrustStore {
    pub const fn new() -> Self {
        Self
    }

    fn run_security(args: &[&str]) -> Result<bool> {
        let status = Command::new("security").args(args).status();
        match status {
            Ok(code) if code.success() => Ok(true),
            Ok(_) => Ok(false),
            Err(err) => Err(anyhow!(err)),
        }
    }
}

impl TrustStoreAdapter for MacTrustStore {
    fn install(&self, cert_path: &Path) -> Result<()> {
        let cert_path = cert_path
            .to_str()
            .ok_or_else(|| anyhow!("certificate path is not valid UTF-8"))?;
        let installed = Self::run_security(&[
            "add-trusted-cert",
            "-d",
            "-r",
            "trustRoot",
            "-k",
            "/Library/Keychains/System.keychain",
            cert_path,
        ])?;
        if installed {
            Ok(())
        } else {
            Err(anyhow!("security add-trusted-cert failed"))
        }
    }

    fn uninstall(&self, common_name: &str) -> Result<()> {
        let removed = Self::run_security(&[
            "delete-certificate",
            "-c",
            common_name,
            "/Library/Keychains/System.keychain",
        ])?;
        if removed {
            Ok(())
        } else {
            Err(anyhow!("security delete-certificate failed"))
        }
    }

    fn is_trusted(&self, common_name: &str) -> Result<bool> {
        Self::run_security(&[
            "find-certificate",
            "-c",
            common_name,
            "-a",
            "-Z",
            "/Library/Keychains/System.keychain",
        ])
    }

    fn needs_elevation(&self) -> bool {
        true
    }

    fn human_name(&self) -> &'static str {
        "macOS Keychain"
    }
}
