//! The narrow container-runtime contract the watcher and synchronizer
//! consume, plus the `bollard`-backed implementation against a real Docker
//! Engine socket.
//!
//! Kept as a trait (rather than calling `bollard::Docker` directly from the
//! watcher) so scenario tests can exercise the start/stop reconciliation
//! logic in §8 without a running daemon.

use std::collections::HashMap;
use std::pin::Pin;

use futures::stream::{Stream, StreamExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEventType {
    Start,
    Stop,
    Die,
}

#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub event_type: ContainerEventType,
    pub container_id: String,
    pub container_name: String,
    pub labels: HashMap<String, String>,
}

/// A running container as seen by the initial scan.
#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// A container's resolved network attachments, keyed by network name.
#[derive(Debug, Clone, Default)]
pub struct ContainerNetworks {
    pub ip_by_network: HashMap<String, String>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<ContainerEvent>> + Send>>;

#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Containers currently running with `<prefix>.enable=true`.
    async fn list_enabled(&self, label_prefix: &str) -> anyhow::Result<Vec<RunningContainer>>;

    /// A stream of `start`/`stop`/`die` events for containers carrying
    /// `<prefix>.enable=true`. Each call opens a fresh subscription; the
    /// watcher resubscribes on stream error.
    fn events(&self, label_prefix: &str) -> EventStream;

    /// Resolve a container's per-network IP addresses and display name.
    async fn inspect(&self, container_id: &str) -> anyhow::Result<(String, ContainerNetworks)>;
}

pub struct BollardRuntime {
    docker: bollard::Docker,
}

impl BollardRuntime {
    pub fn connect() -> anyhow::Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn list_enabled(&self, label_prefix: &str) -> anyhow::Result<Vec<RunningContainer>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{label_prefix}.enable=true")],
        );
        let options = bollard::query_parameters::ListContainersOptionsBuilder::default()
            .all(false)
            .filters(&filters)
            .build();

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .map(|c| RunningContainer {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    fn events(&self, label_prefix: &str) -> EventStream {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            vec!["start".to_string(), "stop".to_string(), "die".to_string()],
        );
        filters.insert(
            "label".to_string(),
            vec![format!("{label_prefix}.enable=true")],
        );
        let options = bollard::query_parameters::EventsOptionsBuilder::default()
            .filters(&filters)
            .build();

        let stream = self.docker.events(Some(options)).map(|item| {
            item.map_err(anyhow::Error::from).and_then(|event| {
                event_from_message(event).ok_or_else(|| anyhow::anyhow!("unrecognized event message"))
            })
        });
        Box::pin(stream)
    }

    async fn inspect(&self, container_id: &str) -> anyhow::Result<(String, ContainerNetworks)> {
        let details = self
            .docker
            .inspect_container(container_id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await?;

        let name = details
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();

        let mut ip_by_network = HashMap::new();
        if let Some(networks) = details
            .network_settings
            .and_then(|settings| settings.networks)
        {
            for (net_name, endpoint) in networks {
                if let Some(ip) = endpoint.and_then(|e| e.ip_address).filter(|ip| !ip.is_empty()) {
                    ip_by_network.insert(net_name, ip);
                }
            }
        }

        Ok((name, ContainerNetworks { ip_by_network }))
    }
}

fn event_from_message(message: bollard::models::EventMessage) -> Option<ContainerEvent> {
    use bollard::models::EventMessageTypeEnum;
    if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    let event_type = match message.action.as_deref() {
        Some("start") => ContainerEventType::Start,
        Some("stop") => ContainerEventType::Stop,
        Some("die") => ContainerEventType::Die,
        _ => return None,
    };
    let actor = message.actor?;
    let attributes = actor.attributes.unwrap_or_default();
    let container_name = attributes
        .get("name")
        .cloned()
        .unwrap_or_default();

    Some(ContainerEvent {
        event_type,
        container_id: actor.id.unwrap_or_default(),
        container_name,
        labels: attributes,
    })
}
