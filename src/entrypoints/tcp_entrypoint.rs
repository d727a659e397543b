//! Generic TLS-terminating TCP entrypoint: routes by SNI plus an entrypoint
//! tag, optionally rewriting the backend port, then relays bytes verbatim.
//!
//! Grounded on the teacher's CONNECT-tunnel bidirectional copy in
//! `proxy::server` (half-close propagation, "EOF / closed network
//! connection is not a fault" logging discipline) generalized to operate
//! after a TLS handshake rather than inside an HTTP CONNECT tunnel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::pki::CertificateIssuer;
use crate::registry::{Protocol, Registry};
use crate::sni::{extract_sni, ReplayConn};

const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

pub struct TcpEntrypointConfig {
    pub name: String,
    pub listen_addr: String,
    /// When set, overrides the route's backend port while keeping its host.
    pub target_port: Option<u16>,
}

pub async fn serve(
    config: TcpEntrypointConfig,
    listener: TcpListener,
    registry: Arc<Registry>,
    issuer: Arc<CertificateIssuer>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let config = Arc::new(config);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tokio::spawn(handle_connection(
                    stream,
                    peer,
                    config.clone(),
                    registry.clone(),
                    issuer.clone(),
                ));
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: Arc<TcpEntrypointConfig>,
    registry: Arc<Registry>,
    issuer: Arc<CertificateIssuer>,
) {
    let peek = match extract_sni(&mut stream).await {
        Ok(peek) => peek,
        Err((e, _)) => {
            tracing::debug!(entrypoint = %config.name, %peer, error = %e, "closing: invalid client hello");
            return;
        }
    };
    if peek.server_name.is_empty() {
        tracing::debug!(entrypoint = %config.name, %peer, "closing: no SNI presented");
        return;
    }

    let route = match registry.lookup(&peek.server_name) {
        Some(route)
            if route.protocol == Protocol::Tcp && route.entrypoint.as_deref() == Some(config.name.as_str()) =>
        {
            route
        }
        _ => {
            tracing::debug!(entrypoint = %config.name, %peer, host = %peek.server_name, "closing: no route tagged for this entrypoint");
            return;
        }
    };

    let backend_addr = effective_backend(&route.backend, config.target_port);

    let tls_config = match issuer.certificate_for_sni(&peek.server_name) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(entrypoint = %config.name, host = %peek.server_name, error = %e, "certificate issuance failed");
            return;
        }
    };
    let acceptor = TlsAcceptor::from(tls_config);
    let replay = ReplayConn::new(stream, peek.peeked_bytes);
    let tls_stream = match acceptor.accept(replay).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(entrypoint = %config.name, %peer, error = %e, "tls handshake failed");
            return;
        }
    };

    let backend = match tokio::time::timeout(BACKEND_DIAL_TIMEOUT, TcpStream::connect(&backend_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!(entrypoint = %config.name, backend = %backend_addr, error = %e, "backend dial failed");
            return;
        }
        Err(_) => {
            tracing::warn!(entrypoint = %config.name, backend = %backend_addr, "backend dial timed out");
            return;
        }
    };

    if let Err(e) = relay(tls_stream, backend).await {
        if !is_benign_close(&e) {
            tracing::warn!(entrypoint = %config.name, backend = %backend_addr, error = %e, "relay ended with error");
        }
    }
}

/// If `target_port` is set, keep the route's backend host and substitute the
/// port; otherwise use the backend verbatim.
fn effective_backend(backend: &str, target_port: Option<u16>) -> String {
    match target_port {
        Some(port) => {
            let host = backend.rsplit_once(':').map_or(backend, |(h, _)| h);
            format!("{host}:{port}")
        }
        None => backend.to_string(),
    }
}

async fn relay<C>(mut client: C, mut backend: TcpStream) -> std::io::Result<()>
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(&mut client);
    let (mut backend_rd, mut backend_wr) = backend.split();

    let client_to_backend = async {
        tokio::io::copy_buf(
            &mut tokio::io::BufReader::with_capacity(RELAY_BUFFER_SIZE, &mut client_rd),
            &mut backend_wr,
        )
        .await?;
        backend_wr.shutdown().await
    };
    let backend_to_client = async {
        tokio::io::copy_buf(
            &mut tokio::io::BufReader::with_capacity(RELAY_BUFFER_SIZE, &mut backend_rd),
            &mut client_wr,
        )
        .await?;
        client_wr.shutdown().await
    };

    tokio::try_join!(client_to_backend, backend_to_client)?;
    Ok(())
}

fn is_benign_close(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_port_override_replaces_backend_port() {
        assert_eq!(effective_backend("10.0.0.1:8080", Some(5432)), "10.0.0.1:5432");
    }

    #[test]
    fn no_override_uses_backend_verbatim() {
        assert_eq!(effective_backend("10.0.0.1:8080", None), "10.0.0.1:8080");
    }

    #[test]
    fn backend_without_port_still_gets_override_port_appended() {
        assert_eq!(effective_backend("10.0.0.1", Some(5432)), "10.0.0.1:5432");
    }
}
