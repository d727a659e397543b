//! # devproxy
//!
//! Local-development reverse proxy: on-demand TLS for developer-chosen
//! hostnames via a local CA and SNI-driven leaf issuer, a concurrent
//! hostname-to-backend route registry, container backend discovery, and
//! the three network entrypoints (HTTP redirector, HTTPS reverse proxy,
//! generic SNI-routed TCP passthrough) that serve traffic through it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   events/labels   ┌───────────────┐
//! │ container     │ ────────────────▶│  synchronizer │
//! │ runtime watch │                   └───────┬───────┘
//! └──────────────┘                             │ add/remove
//!                                               ▼
//! ┌──────────────┐   SNI lookup      ┌───────────────┐     issue/cache
//! │ entrypoints   │ ◀────────────────│   registry    │     ┌───────────┐
//! │ http/https/tcp│                   └───────────────┘◀───│ pki issuer│
//! └──────┬───────┘                                          └─────┬─────┘
//!        │ certificate_for_sni                                    │
//!        └────────────────────────────────────────────────────────┘
//! ```

pub mod containers;
pub mod entrypoints;
pub mod error;
pub mod paths;
pub mod pki;
pub mod platform;
pub mod registry;
pub mod sni;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
