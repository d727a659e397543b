//! Plain-HTTP listener that redirects every request to its `https://` form.
//!
//! Grounded on the teacher's `proxy::server` connection-accept loop
//! (`TcpListener::accept` + `hyper` per-connection task), swapping the
//! teacher's httparse-based manual HTTP/1 engine for `hyper::server::conn`
//! since this entrypoint never needs to inspect or capture bodies.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::LOCATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Serves the HTTP→HTTPS redirector on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    https_port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tokio::spawn(handle_connection(stream, peer, https_port));
            }
            _ = shutdown.cancelled() => {
                return Ok(());
            }
        }
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, peer: SocketAddr, https_port: u16) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| redirect(req, https_port));
    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .await
    {
        tracing::debug!(%peer, error = %e, "http redirector connection ended");
    }
}

async fn redirect(
    req: Request<Incoming>,
    https_port: u16,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Ok(build_redirect_response(req.method(), host, path_and_query, https_port))
}

fn build_redirect_response(
    method: &Method,
    host: &str,
    path_and_query: &str,
    https_port: u16,
) -> Response<Full<Bytes>> {
    let host = strip_port(host);

    let location = if https_port == 443 {
        format!("https://{host}{path_and_query}")
    } else {
        format!("https://{host}:{https_port}{path_and_query}")
    };

    let status = match *method {
        Method::GET | Method::HEAD => StatusCode::MOVED_PERMANENTLY,
        _ => StatusCode::PERMANENT_REDIRECT,
    };

    Response::builder()
        .status(status)
        .header(LOCATION, location)
        .body(Full::new(Bytes::new()))
        .expect("static redirect response is always well-formed")
}

fn strip_port(host: &str) -> &str {
    if let Some(bracket_end) = host.find(']') {
        // IPv6 literal, e.g. "[::1]:8080" — keep the bracketed form.
        return &host[..=bracket_end];
    }
    host.rsplit_once(':').map_or(host, |(h, _)| h)
}
