use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use devproxy::entrypoints::http_redirect;

fn local_addr(listener: &TcpListener) -> SocketAddr {
    listener.local_addr().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_request_is_redirected_to_https() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = local_addr(&listener);
    let shutdown = CancellationToken::new();

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move { http_redirect::serve(listener, 8443, server_shutdown).await });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /widgets HTTP/1.1\r\nHost: app.localhost\r\n\r\n")
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("response within timeout")
        .unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);

    assert!(response.starts_with("HTTP/1.1 301"), "unexpected response: {response}");
    assert!(response.contains("location: https://app.localhost:8443/widgets"));

    shutdown.cancel();
    let _ = server.await;
}
