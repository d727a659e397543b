//! Translates container-label key/value sets into validated service
//! configurations (§4.8).

use std::collections::HashMap;

use crate::error::LabelError;

pub const LABEL_PREFIX: &str = "devproxy";

/// The parsed, validated result of reading the `devproxy.*` label set for a
/// single service (there may be multiple per container).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: Option<String>,
    /// Comma-separated hosts, preserved verbatim for downstream splitting.
    pub host: String,
    pub port: u16,
    pub entrypoint: Option<String>,
}

/// Parse a container's labels into zero or more service configurations.
/// Returns an empty vec if `<prefix>.enable != "true"`.
pub fn parse(labels: &HashMap<String, String>, prefix: &str) -> Result<Vec<ServiceConfig>, LabelError> {
    let enable_key = format!("{prefix}.enable");
    if labels.get(&enable_key).map(String::as_str) != Some("true") {
        return Ok(Vec::new());
    }

    let services_prefix = format!("{prefix}.services.");
    let multi_service = labels.keys().any(|k| k.starts_with(&services_prefix));

    if multi_service {
        parse_multi_service(labels, prefix, &services_prefix)
    } else {
        parse_single_service(labels, prefix).map(|c| vec![c])
    }
}

fn parse_single_service(labels: &HashMap<String, String>, prefix: &str) -> Result<ServiceConfig, LabelError> {
    let host = labels
        .get(&format!("{prefix}.host"))
        .cloned()
        .ok_or(LabelError::MissingHost)?;
    validate_host_list(&host)?;

    let port = parse_port(labels.get(&format!("{prefix}.port")).map(String::as_str))?;
    let entrypoint = labels
        .get(&format!("{prefix}.entrypoint"))
        .cloned()
        .filter(|s| !s.is_empty());

    Ok(ServiceConfig {
        name: None,
        host,
        port,
        entrypoint,
    })
}

fn parse_multi_service(
    labels: &HashMap<String, String>,
    _prefix: &str,
    services_prefix: &str,
) -> Result<Vec<ServiceConfig>, LabelError> {
    let mut names = std::collections::BTreeSet::new();
    for key in labels.keys() {
        if let Some(rest) = key.strip_prefix(services_prefix) {
            if let Some((name, _)) = rest.split_once('.') {
                names.insert(name.to_string());
            }
        }
    }

    let mut configs = Vec::new();
    for name in names {
        let host = labels
            .get(&format!("{services_prefix}{name}.host"))
            .cloned()
            .ok_or(LabelError::MissingHost)?;
        validate_host_list(&host)?;

        let port = parse_port(labels.get(&format!("{services_prefix}{name}.port")).map(String::as_str))?;
        let entrypoint = labels
            .get(&format!("{services_prefix}{name}.entrypoint"))
            .cloned()
            .filter(|s| !s.is_empty());

        configs.push(ServiceConfig {
            name: Some(name),
            host,
            port,
            entrypoint,
        });
    }
    Ok(configs)
}

fn validate_host_list(hosts: &str) -> Result<(), LabelError> {
    for token in hosts.split(',') {
        validate_host(token.trim())?;
    }
    Ok(())
}

fn validate_host(host: &str) -> Result<(), LabelError> {
    if host.is_empty() {
        return Err(LabelError::InvalidHost(host.to_string()));
    }
    if let Some(rest) = host.strip_prefix('*') {
        match rest.strip_prefix('.') {
            Some(suffix) if !suffix.is_empty() && !suffix.starts_with('.') => Ok(()),
            _ => Err(LabelError::InvalidHost(host.to_string())),
        }
    } else if host.starts_with('.') || host.ends_with('.') {
        Err(LabelError::InvalidHost(host.to_string()))
    } else {
        Ok(())
    }
}

fn parse_port(raw: Option<&str>) -> Result<u16, LabelError> {
    match raw {
        None => Ok(80),
        Some(s) => {
            let port: u32 = s.parse().map_err(|_| LabelError::InvalidPort(s.to_string()))?;
            if port == 0 || port > 65535 {
                Err(LabelError::InvalidPort(s.to_string()))
            } else {
                Ok(port as u16)
            }
        }
    }
}
