use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use devproxy::containers::runtime::BollardRuntime;
use devproxy::containers::{synchronizer::Synchronizer, ContainerRuntime, Watcher};
use devproxy::entrypoints::{http_redirect, https_proxy, tcp_entrypoint};
use devproxy::paths::FilesystemPaths;
use devproxy::pki::{CertificateAuthority, CertificateIssuer};
use devproxy::registry::Registry;

/// Local-development reverse proxy: on-demand TLS + container-aware routing.
#[derive(Parser, Debug)]
#[command(name = "devproxy")]
struct Cli {
    /// Base directory for CA material, leaf cache, and route state.
    #[arg(long, value_name = "DIR", default_value = "./devproxy-data")]
    data_dir: PathBuf,

    /// Port for the HTTP-to-HTTPS redirector.
    #[arg(long, default_value_t = 80)]
    http_port: u16,

    /// Port for the HTTPS reverse proxy.
    #[arg(long, default_value_t = 443)]
    https_port: u16,

    /// Additional SNI-routed TCP entrypoint, `name:listen_addr[:target_port]`.
    /// Repeatable.
    #[arg(long = "tcp-entrypoint", value_name = "SPEC")]
    tcp_entrypoints: Vec<String>,

    /// Docker label prefix to watch.
    #[arg(long, default_value = "devproxy")]
    label_prefix: String,

    /// Preferred Docker network for resolving a container's IP, when it is
    /// attached to more than one.
    #[arg(long)]
    preferred_network: Option<String>,
}

struct ParsedTcpEntrypoint {
    name: String,
    listen_addr: String,
    target_port: Option<u16>,
}

fn parse_tcp_entrypoint(spec: &str) -> Result<ParsedTcpEntrypoint> {
    let mut parts = spec.splitn(3, ':');
    let name = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("tcp entrypoint {spec:?} is missing a name"))?
        .to_string();
    let host = parts
        .next()
        .ok_or_else(|| anyhow!("tcp entrypoint {spec:?} is missing a listen address"))?;
    let port = parts
        .next()
        .ok_or_else(|| anyhow!("tcp entrypoint {spec:?} is missing a listen port"))?;
    let listen_addr = format!("{host}:{port}");
    let target_port = match parts.next() {
        Some(p) => Some(
            p.parse::<u16>()
                .with_context(|| format!("invalid target port in {spec:?}"))?,
        ),
        None => None,
    };

    Ok(ParsedTcpEntrypoint {
        name,
        listen_addr,
        target_port,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let paths = FilesystemPaths::new(&cli.data_dir);

    let ca = CertificateAuthority::load_or_generate(paths.ca_dir())
        .context("loading or generating local root CA")?;
    let issuer = Arc::new(CertificateIssuer::new(Arc::new(ca), paths.leaf_dir().to_path_buf()));

    let registry = Arc::new(Registry::new());
    match Registry::load_state(paths.state_file()) {
        Ok(routes) => {
            let mut restored = 0usize;
            for route in routes {
                if registry.add(route).is_ok() {
                    restored += 1;
                }
            }
            info!(restored, "restored route state from disk");
        }
        Err(err) => {
            info!(error = %err, "no prior route state loaded, starting empty");
        }
    }

    {
        let registry = registry.clone();
        let state_file = paths.state_file().to_path_buf();
        registry.set_on_change(move || {
            if let Err(err) = registry.save_state(&state_file) {
                error!(%err, "failed to persist route state");
            }
        });
    }

    let shutdown = CancellationToken::new();

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        BollardRuntime::connect().context("connecting to container runtime")?,
    );
    let synchronizer = Arc::new(
        Synchronizer::new(
            registry.clone(),
            runtime.clone(),
            Some(issuer.clone()),
            cli.preferred_network.clone(),
        )
        .with_label_prefix(cli.label_prefix.clone()),
    );

    synchronizer
        .sync_existing()
        .await
        .context("performing initial container scan")?;

    let watcher = {
        let synchronizer = synchronizer.clone();
        let handler: devproxy::containers::watcher::EventHandler = Arc::new(move |event| {
            let synchronizer = synchronizer.clone();
            tokio::spawn(async move {
                synchronizer.handle_event(event).await;
            });
        });
        Watcher::new(runtime, cli.label_prefix.clone(), handler)
    };
    watcher.start().await.context("starting container watcher")?;

    let http_listener = TcpListener::bind(("0.0.0.0", cli.http_port))
        .await
        .with_context(|| format!("binding HTTP redirector on port {}", cli.http_port))?;
    let https_listener = TcpListener::bind(("0.0.0.0", cli.https_port))
        .await
        .with_context(|| format!("binding HTTPS proxy on port {}", cli.https_port))?;

    info!(http_port = cli.http_port, https_port = cli.https_port, "devproxy listening");

    let mut handles = Vec::new();

    {
        let shutdown = shutdown.clone();
        let https_port = cli.https_port;
        handles.push(tokio::spawn(async move {
            http_redirect::serve(http_listener, https_port, shutdown).await
        }));
    }

    {
        let registry = registry.clone();
        let issuer = issuer.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            https_proxy::serve(https_listener, registry, issuer, shutdown).await
        }));
    }

    for spec in &cli.tcp_entrypoints {
        let parsed = parse_tcp_entrypoint(spec)?;
        let listener = TcpListener::bind(&parsed.listen_addr)
            .await
            .with_context(|| format!("binding TCP entrypoint {} on {}", parsed.name, parsed.listen_addr))?;
        info!(name = %parsed.name, addr = %parsed.listen_addr, "TCP entrypoint listening");

        let config = tcp_entrypoint::TcpEntrypointConfig {
            name: parsed.name,
            listen_addr: parsed.listen_addr,
            target_port: parsed.target_port,
        };
        let registry = registry.clone();
        let issuer = issuer.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            tcp_entrypoint::serve(config, listener, registry, issuer, shutdown).await
        }));
    }

    shutdown_signal().await;
    info!("shutdown signal received");
    shutdown.cancel();
    watcher.stop().await;

    for handle in handles {
        let _ = handle.await;
    }

    if let Err(err) = registry.save_state(paths.state_file()) {
        error!(%err, "failed to persist route state on shutdown");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_tcp_entrypoint() {
        let parsed = parse_tcp_entrypoint("ssh:0.0.0.0:2222").unwrap();
        assert_eq!(parsed.name, "ssh");
        assert_eq!(parsed.listen_addr, "0.0.0.0:2222");
        assert_eq!(parsed.target_port, None);
    }

    #[test]
    fn parses_tcp_entrypoint_with_target_port_override() {
        let parsed = parse_tcp_entrypoint("postgres:0.0.0.0:5433:5432").unwrap();
        assert_eq!(parsed.name, "postgres");
        assert_eq!(parsed.listen_addr, "0.0.0.0:5433");
        assert_eq!(parsed.target_port, Some(5432));
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(parse_tcp_entrypoint("onlyname").is_err());
        assert!(parse_tcp_entrypoint("").is_err());
    }
}
