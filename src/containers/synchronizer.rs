//! Bridges watcher events to the registry and issuer: parses labels,
//! resolves container IPs, registers/removes routes, and pre-warms
//! certificates (§4.10).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::containers::labels::{self, LABEL_PREFIX};
use crate::containers::runtime::{ContainerEvent, ContainerEventType, ContainerRuntime};
use crate::pki::CertificateIssuer;
use crate::registry::{Protocol, Registry, Route};

pub struct Synchronizer {
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    issuer: Option<Arc<CertificateIssuer>>,
    preferred_network: Option<String>,
    label_prefix: String,
    container_hosts: Mutex<HashMap<String, Vec<String>>>,
}

impl Synchronizer {
    pub fn new(
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        issuer: Option<Arc<CertificateIssuer>>,
        preferred_network: Option<String>,
    ) -> Self {
        Self {
            registry,
            runtime,
            issuer,
            preferred_network,
            label_prefix: LABEL_PREFIX.to_string(),
            container_hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Override the default `devproxy` label prefix.
    pub fn with_label_prefix(mut self, label_prefix: impl Into<String>) -> Self {
        self.label_prefix = label_prefix.into();
        self
    }

    pub async fn handle_event(&self, event: ContainerEvent) {
        match event.event_type {
            ContainerEventType::Start => self.handle_start(event).await,
            ContainerEventType::Stop | ContainerEventType::Die => self.handle_stop(event),
        }
    }

    async fn handle_start(&self, event: ContainerEvent) {
        let services = match labels::parse(&event.labels, &self.label_prefix) {
            Ok(services) if !services.is_empty() => services,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(container_id = %event.container_id, error = %e, "invalid devproxy labels");
                return;
            }
        };

        let (inspected_name, networks) = match self.runtime.inspect(&event.container_id).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(container_id = %event.container_id, error = %e, "failed to inspect container");
                return;
            }
        };

        let ip = match self.resolve_ip(&networks) {
            Some(ip) => ip,
            None => {
                tracing::warn!(container_id = %event.container_id, "no network with an assigned IP");
                return;
            }
        };

        let display_name = if !event.container_name.is_empty() {
            event.container_name.clone()
        } else if !inspected_name.is_empty() {
            inspected_name
        } else {
            event.container_id.chars().take(12).collect()
        };

        let mut added_hosts = Vec::new();
        for service in services {
            let protocol = if service.entrypoint.is_some() {
                Protocol::Tcp
            } else {
                Protocol::Http
            };
            let backend = format!("{ip}:{}", service.port);

            for host in service.host.split(',') {
                let host = host.trim();
                if host.is_empty() {
                    continue;
                }

                let mut route = Route::new(host, &backend, protocol);
                route.entrypoint = service.entrypoint.clone();
                route.container_id = Some(event.container_id.clone());
                route.container_name = Some(display_name.clone());

                match self.registry.add(route) {
                    Ok(()) => added_hosts.push(host.to_string()),
                    Err(e) => {
                        tracing::warn!(container_id = %event.container_id, host = %host, error = %e, "failed to register route")
                    }
                }
            }
        }

        if let Some(issuer) = &self.issuer {
            for host in &added_hosts {
                if let Err(e) = issuer.certificate_for_sni(host) {
                    tracing::warn!(host = %host, error = %e, "failed to pre-warm certificate");
                }
            }
        }

        self.container_hosts
            .lock()
            .expect("container_hosts poisoned")
            .insert(event.container_id, added_hosts);
    }

    fn handle_stop(&self, event: ContainerEvent) {
        let hosts = self
            .container_hosts
            .lock()
            .expect("container_hosts poisoned")
            .remove(&event.container_id);

        match hosts {
            Some(hosts) => {
                for host in hosts {
                    if let Err(e) = self.registry.remove(&host) {
                        tracing::warn!(host = %host, error = %e, "route already absent on container stop");
                    }
                }
            }
            None => {
                self.registry.remove_by_container_id(&event.container_id);
            }
        }
    }

    fn resolve_ip(&self, networks: &crate::containers::runtime::ContainerNetworks) -> Option<String> {
        if let Some(preferred) = &self.preferred_network {
            if let Some(ip) = networks.ip_by_network.get(preferred) {
                if !ip.is_empty() {
                    return Some(ip.clone());
                }
            }
        }
        networks
            .ip_by_network
            .values()
            .find(|ip| !ip.is_empty())
            .cloned()
    }

    /// Reconcile the registry against every currently listed container;
    /// used at start-up as an alternative to relying solely on the watcher's
    /// own initial scan.
    pub async fn sync_existing(&self) -> anyhow::Result<()> {
        for container in self.runtime.list_enabled(&self.label_prefix).await? {
            self.handle_event(ContainerEvent {
                event_type: ContainerEventType::Start,
                container_id: container.id,
                container_name: container.name,
                labels: container.labels,
            })
            .await;
        }
        Ok(())
    }
}
