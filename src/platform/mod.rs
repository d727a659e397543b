//! Platform-specific CA trust-store manipulation.
//!
//! Per design note in spec.md §9: OS trust operations diverge too much
//! (keychain vs. `update-ca-trust`/`trust anchor` vs. the Windows cert store)
//! for a unified abstraction beyond this small capability interface, selected
//! at startup by a `cfg(target_os)` tagged-variant backend.

use std::path::Path;

use anyhow::Result;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod mac;
#[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
mod noop;
#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "linux")]
use linux::LinuxTrustStore as PlatformImpl;
#[cfg(target_os = "macos")]
use mac::MacTrustStore as PlatformImpl;
#[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
use noop::NoopTrustStore as PlatformImpl;
#[cfg(target_os = "windows")]
use windows::WindowsTrustStore as PlatformImpl;

static ADAPTER: PlatformImpl = PlatformImpl::new();

/// Install/uninstall/inspect the local root CA in the OS trust store.
pub trait TrustStoreAdapter: Sync + Send {
    fn install(&self, cert_path: &Path) -> Result<()>;
    fn uninstall(&self, common_name: &str) -> Result<()>;
    fn is_trusted(&self, common_name: &str) -> Result<bool>;
    fn needs_elevation(&self) -> bool;
    fn human_name(&self) -> &'static str;
}

pub fn install(cert_path: &Path) -> Result<()> {
    ADAPTER.install(cert_path)
}

pub fn uninstall(common_name: &str) -> Result<()> {
    ADAPTER.uninstall(common_name)
}

pub fn is_trusted(common_name: &str) -> Result<bool> {
    ADAPTER.is_trusted(common_name)
}

pub fn needs_elevation() -> bool {
    ADAPTER.needs_elevation()
}

pub fn human_name() -> &'static str {
    ADAPTER.human_name()
}
