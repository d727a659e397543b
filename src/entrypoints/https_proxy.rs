//! TLS-terminating HTTPS reverse proxy: host-header routing, header
//! rewriting, WebSocket upgrade passthrough, and backend error mapping.
//!
//! Grounded on the teacher's `proxy::server` per-connection task plus
//! `hyper_util::client::legacy` for backend dialing (the teacher's own
//! connection pooling lives in its CONNECT-tunnel engine; this carries the
//! same "reasonable keep-alive defaults" intent through hyper's pool knobs
//! instead of hand-rolled pooling).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::pki::CertificateIssuer;
use crate::registry::{Protocol, Registry};
use crate::sni::{extract_sni, ReplayConn};

const NON_UPGRADE_TIMEOUT: Duration = Duration::from_secs(60);
const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 100;

type BackendClient = Client<HttpConnector, Full<Bytes>>;

fn backend_client() -> BackendClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(BACKEND_DIAL_TIMEOUT));
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(connector)
}

pub async fn serve(
    listener: TcpListener,
    registry: Arc<Registry>,
    issuer: Arc<CertificateIssuer>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let client = backend_client();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tokio::spawn(handle_connection(
                    stream,
                    peer,
                    registry.clone(),
                    issuer.clone(),
                    client.clone(),
                ));
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    issuer: Arc<CertificateIssuer>,
    client: BackendClient,
) {
    if let Err(e) = accept_and_serve(stream, peer, registry, issuer, client).await {
        tracing::debug!(%peer, error = %e, "https proxy connection ended");
    }
}

async fn accept_and_serve(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    issuer: Arc<CertificateIssuer>,
    client: BackendClient,
) -> anyhow::Result<()> {
    let peek = extract_sni(&mut stream)
        .await
        .map_err(|(e, _)| anyhow::anyhow!("sni extraction failed: {e}"))?;
    let tls_config = issuer.certificate_for_sni(&peek.server_name)?;
    let acceptor = TlsAcceptor::from(tls_config);
    let replay = ReplayConn::new(stream, peek.peeked_bytes);
    let tls_stream = acceptor.accept(replay).await?;

    let _ = &issuer; // only needed to select the per-connection certificate above
    let io = TokioIo::new(tls_stream);
    let service = service_fn(move |req| proxy_request(req, registry.clone(), client.clone(), peer));

    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("serving https connection: {e}"))
}

async fn proxy_request(
    mut req: Request<Incoming>,
    registry: Arc<Registry>,
    client: BackendClient,
    peer: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let host_header = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let host = strip_port(&host_header).to_string();

    let route = match registry.lookup(&host) {
        Some(route) => route,
        None => {
            return Ok(text_response(
                StatusCode::NOT_FOUND,
                format!("no route configured for host: {host}"),
            ))
        }
    };
    if route.protocol != Protocol::Http {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            format!("route for {host} is not HTTP protocol"),
        ));
    }

    let client_ip = extract_client_ip(req.headers(), &peer);
    apply_forwarding_headers(req.headers_mut(), &host_header, &client_ip);

    if is_websocket_upgrade(req.headers()) {
        return Ok(proxy_websocket(req, &route.backend, client).await);
    }

    let outbound = match build_outbound_request(req, &route.backend).await {
        Ok(req) => req,
        Err(resp) => return Ok(resp),
    };

    match tokio::time::timeout(NON_UPGRADE_TIMEOUT, client.request(outbound)).await {
        Ok(Ok(resp)) => Ok(relay_response(resp).await),
        Ok(Err(e)) => {
            tracing::warn!(backend = %route.backend, error = %e, "backend request failed");
            Ok(text_response(StatusCode::BAD_GATEWAY, "bad gateway".to_string()))
        }
        Err(_) => Ok(text_response(StatusCode::BAD_GATEWAY, "bad gateway".to_string())),
    }
}

async fn build_outbound_request(
    req: Request<Incoming>,
    backend: &str,
) -> Result<Request<Full<Bytes>>, Response<Full<Bytes>>> {
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|_| text_response(StatusCode::BAD_GATEWAY, "failed to read request body".to_string()))?;

    let uri = rewrite_uri(&parts.uri, backend)
        .map_err(|_| text_response(StatusCode::BAD_GATEWAY, "bad gateway".to_string()))?;

    let mut builder = Request::builder().method(parts.method).uri(uri);
    *builder.headers_mut().unwrap() = parts.headers;
    builder
        .body(Full::new(body))
        .map_err(|_| text_response(StatusCode::BAD_GATEWAY, "bad gateway".to_string()))
}

fn rewrite_uri(original: &Uri, backend: &str) -> Result<Uri, http::uri::InvalidUri> {
    let path_and_query = original.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("http://{backend}{path_and_query}").parse()
}

async fn relay_response(resp: Response<Incoming>) -> Response<Full<Bytes>> {
    let (parts, body) = resp.into_parts();
    let bytes = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();
    Response::from_parts(parts, Full::new(bytes))
}

async fn proxy_websocket(
    mut req: Request<Incoming>,
    backend: &str,
    client: BackendClient,
) -> Response<Full<Bytes>> {
    let client_upgrade = hyper::upgrade::on(&mut req);

    let (parts, _) = req.into_parts();
    let uri = match rewrite_uri(&parts.uri, backend) {
        Ok(uri) => uri,
        Err(_) => return text_response(StatusCode::BAD_GATEWAY, "bad gateway".to_string()),
    };
    let mut builder = Request::builder().method(parts.method).uri(uri);
    *builder.headers_mut().unwrap() = parts.headers;
    let outbound = match builder.body(Full::new(Bytes::new())) {
        Ok(req) => req,
        Err(_) => return text_response(StatusCode::BAD_GATEWAY, "bad gateway".to_string()),
    };

    let mut backend_resp = match client.request(outbound).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(error = %e, "websocket backend dial failed");
            return text_response(StatusCode::BAD_GATEWAY, "bad gateway".to_string());
        }
    };

    if backend_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        return relay_response(backend_resp).await;
    }

    let backend_upgrade = hyper::upgrade::on(&mut backend_resp);
    let (resp_parts, _) = backend_resp.into_parts();
    let response_to_client = Response::from_parts(resp_parts, Full::new(Bytes::new()));

    tokio::spawn(async move {
        let (client_io, backend_io) = match tokio::try_join!(client_upgrade, backend_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "websocket upgrade handshake failed");
                return;
            }
        };
        let mut client_io = TokioIo::new(client_io);
        let mut backend_io = TokioIo::new(backend_io);
        if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
            tracing::debug!(error = %e, "websocket relay ended");
        }
    });

    response_to_client
}

fn is_websocket_upgrade(headers: &hyper::HeaderMap) -> bool {
    let upgrade_is_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_has_upgrade = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    upgrade_is_websocket && connection_has_upgrade
}

fn apply_forwarding_headers(headers: &mut hyper::HeaderMap, host_with_port: &str, client_ip: &str) {
    let existing_xff = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let new_xff = if existing_xff.is_empty() {
        client_ip.to_string()
    } else {
        format!("{existing_xff}, {client_ip}")
    };
    if let Ok(value) = HeaderValue::from_str(&new_xff) {
        headers.insert("x-forwarded-for", value);
    }

    headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
    if let Ok(value) = HeaderValue::from_str(host_with_port) {
        headers.insert("x-forwarded-host", value);
    }
    if let Ok(value) = HeaderValue::from_str(client_ip) {
        headers.insert("x-real-ip", value);
    }
}

fn extract_client_ip(headers: &hyper::HeaderMap, peer: &SocketAddr) -> String {
    let xff_leftmost = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty());
    if let Some(ip) = xff_leftmost {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.ip().to_string()
}

fn strip_port(host: &str) -> &str {
    if let Some(bracket_end) = host.find(']') {
        return &host[..=bracket_end];
    }
    host.rsplit_once(':').map_or(host, |(h, _)| h)
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .expect("static text response is always well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::HeaderMap;

    #[test]
    fn strips_port_from_host() {
        assert_eq!(strip_port("app.localhost:8443"), "app.localhost");
        assert_eq!(strip_port("app.localhost"), "app.localhost");
    }

    #[test]
    fn websocket_requires_both_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_websocket_upgrade(&headers));

        let mut missing_connection = HeaderMap::new();
        missing_connection.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_websocket_upgrade(&missing_connection));
    }

    #[test]
    fn client_ip_prefers_forwarded_for_then_real_ip_then_peer() {
        let peer: SocketAddr = "203.0.113.5:54321".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.1.1.1, 10.1.1.2"));
        assert_eq!(extract_client_ip(&headers, &peer), "10.1.1.1");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.2.2.2"));
        assert_eq!(extract_client_ip(&headers, &peer), "10.2.2.2");

        let headers = HeaderMap::new();
        assert_eq!(extract_client_ip(&headers, &peer), "203.0.113.5");
    }

    #[test]
    fn forwarded_for_is_appended_not_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.1.1.1"));
        apply_forwarding_headers(&mut headers, "app.localhost:443", "10.1.1.1");
        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "10.1.1.1, 10.1.1.1"
        );
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
    }
}
