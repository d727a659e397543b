use super::TrustStoreAdapter;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;
use std::process::Command;

const ANCHOR_DIR: &str = "/usr/local/share/ca-certificates";

pub struct LinuxTrustStore;

impl LinuxTrustStore {
    pub const fn new() -> Self {
        Self
    }

    fn anchor_path(common_name: &str) -> std::path::PathBuf {
        let filename = common_name.replace(char::is_whitespace, "-");
        Path::new(ANCHOR_DIR).join(format!("{filename}.crt"))
    }
}

impl TrustStoreAdapter for LinuxTrustStore {
    fn install(&self, cert_path: &Path) -> Result<()> {
        let pem = fs::read_to_string(cert_path)
            .with_context(|| format!("reading {}", cert_path.display()))?;
        let anchor = Self::anchor_path("devproxy-local-ca");
        fs::create_dir_all(ANCHOR_DIR).context("creating CA anchor directory")?;
        fs::write(&anchor, pem).with_context(|| format!("writing {}", anchor.display()))?;

        let status = Command::new("update-ca-certificates")
            .status()
            .context("running update-ca-certificates")?;
        if status.success() {
            Ok(())
        } else {
            Err(anyhow!("update-ca-certificates exited with {status}"))
        }
    }

    fn uninstall(&self, common_name: &str) -> Result<()> {
        let anchor = Self::anchor_path(common_name);
        if anchor.exists() {
            fs::remove_file(&anchor).with_context(|| format!("removing {}", anchor.display()))?;
        }
        let status = Command::new("update-ca-certificates")
            .arg("--fresh")
            .status()
            .context("running update-ca-certificates --fresh")?;
        if status.success() {
            Ok(())
        } else {
            Err(anyhow!("update-ca-certificates --fresh exited with {status}"))
        }
    }

    fn is_trusted(&self, common_name: &str) -> Result<bool> {
        Ok(Self::anchor_path(common_name).exists())
    }

    fn needs_elevation(&self) -> bool {
        true
    }

    fn human_name(&self) -> &'static str {
        "update-ca-certificates"
    }
}
