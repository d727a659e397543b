//! Data-plane entrypoints: the HTTP→HTTPS redirector, the HTTPS reverse
//! proxy, and the generic SNI-routed TCP entrypoint.

pub mod http_redirect;
pub mod https_proxy;
pub mod tcp_entrypoint;
