//! Concurrent hostname→backend route registry: exact and wildcard lookup,
//! change notification, and JSON state snapshotting.
//!
//! Grounded on the teacher's `proxy::breakpoints` broadcast/notify pattern for
//! "fire outside the lock" discipline, generalized from a single map to the
//! exact/wildcard split required by §4.3, with `saveState` modeled on the
//! teacher's `storage` module's atomic-enough write-then-permission pattern.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
}

/// A single hostname→backend mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Backend")]
    pub backend: String,
    #[serde(rename = "Protocol")]
    pub protocol: Protocol,
    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(rename = "ContainerID", skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(rename = "ContainerName", skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(rename = "CreatedAt", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(rename = "IsWildcard")]
    pub is_wildcard: bool,
    #[serde(rename = "Pattern", skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl Route {
    /// A new route for `host`/`backend`, with derived wildcard fields and
    /// `created_at` defaulted to now. Callers may override fields afterward.
    pub fn new(host: impl Into<String>, backend: impl Into<String>, protocol: Protocol) -> Self {
        let host = host.into();
        let (is_wildcard, pattern) = derive_wildcard(&host);
        Self {
            host,
            backend: backend.into(),
            protocol,
            entrypoint: None,
            container_id: None,
            container_name: None,
            created_at: OffsetDateTime::now_utc(),
            is_wildcard,
            pattern,
        }
    }
}

fn derive_wildcard(host: &str) -> (bool, Option<String>) {
    match host.strip_prefix("*.") {
        Some(rest) => (true, Some(rest.to_string())),
        None => (false, None),
    }
}

type ChangeCallback = dyn Fn() + Send + Sync;

struct Maps {
    exact: HashMap<String, Route>,
    wildcard: HashMap<String, Route>,
}

pub struct Registry {
    maps: RwLock<Maps>,
    on_change: RwLock<Option<Arc<ChangeCallback>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(Maps {
                exact: HashMap::new(),
                wildcard: HashMap::new(),
            }),
            on_change: RwLock::new(None),
        }
    }

    /// Install the change-notify callback. Invoked after every successful
    /// mutation, outside any internal lock.
    pub fn set_on_change<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_change.write().expect("on_change poisoned") = Some(Arc::new(callback));
    }

    fn fire_change(&self) {
        let callback = self.on_change.read().expect("on_change poisoned").clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn add(&self, mut route: Route) -> Result<(), RegistryError> {
        if route.host.is_empty() {
            return Err(RegistryError::InvalidHost(route.host));
        }
        if route.created_at == OffsetDateTime::UNIX_EPOCH {
            route.created_at = OffsetDateTime::now_utc();
        }

        {
            let mut maps = self.maps.write().expect("registry poisoned");
            if route.is_wildcard {
                let pattern = route
                    .pattern
                    .clone()
                    .ok_or_else(|| RegistryError::InvalidHost(route.host.clone()))?;
                if pattern.is_empty() || pattern.starts_with('.') {
                    return Err(RegistryError::InvalidHost(route.host.clone()));
                }
                if maps.wildcard.contains_key(&pattern) {
                    return Err(RegistryError::WildcardExists(pattern));
                }
                maps.wildcard.insert(pattern, route);
            } else {
                if maps.exact.contains_key(&route.host) {
                    return Err(RegistryError::Exists(route.host));
                }
                maps.exact.insert(route.host.clone(), route);
            }
        }
        self.fire_change();
        Ok(())
    }

    pub fn remove(&self, host: &str) -> Result<(), RegistryError> {
        let removed = {
            let mut maps = self.maps.write().expect("registry poisoned");
            match host.strip_prefix("*.") {
                Some(pattern) => maps.wildcard.remove(pattern).is_some(),
                None => maps.exact.remove(host).is_some(),
            }
        };
        if removed {
            self.fire_change();
            Ok(())
        } else {
            Err(RegistryError::NotFound(host.to_string()))
        }
    }

    pub fn remove_by_container_id(&self, container_id: &str) -> usize {
        let removed = {
            let mut maps = self.maps.write().expect("registry poisoned");
            let exact_before = maps.exact.len();
            maps.exact
                .retain(|_, r| r.container_id.as_deref() != Some(container_id));
            let exact_removed = exact_before - maps.exact.len();

            let wildcard_before = maps.wildcard.len();
            maps.wildcard
                .retain(|_, r| r.container_id.as_deref() != Some(container_id));
            let wildcard_removed = wildcard_before - maps.wildcard.len();

            exact_removed + wildcard_removed
        };
        if removed > 0 {
            self.fire_change();
        }
        removed
    }

    /// Exact match first, else the wildcard pattern with the longest suffix
    /// match, else `None`.
    pub fn lookup(&self, host: &str) -> Option<Route> {
        let maps = self.maps.read().expect("registry poisoned");
        if let Some(route) = maps.exact.get(host) {
            return Some(route.clone());
        }

        maps.wildcard
            .iter()
            .filter(|(pattern, _)| {
                host.len() > pattern.len() && host.ends_with(pattern.as_str()) && {
                    let prefix_len = host.len() - pattern.len();
                    host.as_bytes()[prefix_len - 1] == b'.'
                }
            })
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, route)| route.clone())
    }

    pub fn list(&self) -> Vec<Route> {
        let maps = self.maps.read().expect("registry poisoned");
        let mut routes: Vec<Route> = maps
            .exact
            .values()
            .chain(maps.wildcard.values())
            .cloned()
            .collect();
        routes.sort_by(|a, b| a.host.cmp(&b.host));
        routes
    }

    pub fn count(&self) -> usize {
        let maps = self.maps.read().expect("registry poisoned");
        maps.exact.len() + maps.wildcard.len()
    }

    pub fn get_by_entrypoint(&self, tag: &str) -> Vec<Route> {
        let maps = self.maps.read().expect("registry poisoned");
        maps.exact
            .values()
            .filter(|r| r.protocol == Protocol::Tcp && r.entrypoint.as_deref() == Some(tag))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        let had_routes = {
            let mut maps = self.maps.write().expect("registry poisoned");
            let had_routes = !maps.exact.is_empty() || !maps.wildcard.is_empty();
            maps.exact.clear();
            maps.wildcard.clear();
            had_routes
        };
        if had_routes {
            self.fire_change();
        }
    }

    pub fn save_state(&self, path: &Path) -> std::io::Result<()> {
        #[derive(Serialize)]
        struct Snapshot {
            routes: Vec<Route>,
        }

        let snapshot = Snapshot {
            routes: self.list(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
            set_dir_mode(parent, 0o755)?;
        }
        fs::write(path, json)?;
        set_file_mode(path, 0o644)?;
        Ok(())
    }

    /// Best-effort load of a previously saved snapshot; absence is not an
    /// error (readers of this file must tolerate it being missing).
    pub fn load_state(path: &Path) -> std::io::Result<Vec<Route>> {
        #[derive(Deserialize)]
        struct Snapshot {
            routes: Vec<Route>,
        }
        let data = fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&data)?;
        Ok(snapshot.routes)
    }
}

#[cfg(unix)]
fn set_dir_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn route(host: &str, backend: &str) -> Route {
        Route::new(host, backend, Protocol::Http)
    }

    #[test]
    fn exact_and_wildcard_coexist() {
        let registry = Registry::new();
        registry.add(route("app.localhost", "10.0.0.1:80")).unwrap();
        registry
            .add(route("*.app.localhost", "10.0.0.2:80"))
            .unwrap();

        assert_eq!(
            registry.lookup("app.localhost").unwrap().backend,
            "10.0.0.1:80"
        );
        assert_eq!(
            registry.lookup("web.app.localhost").unwrap().backend,
            "10.0.0.2:80"
        );
        assert!(registry.lookup("other.localhost").is_none());
    }

    #[test]
    fn most_specific_wildcard_wins() {
        let registry = Registry::new();
        registry
            .add(route("*.localhost", "10.0.0.1:80"))
            .unwrap();
        registry
            .add(route("*.app.localhost", "10.0.0.2:80"))
            .unwrap();

        assert_eq!(
            registry.lookup("x.app.localhost").unwrap().backend,
            "10.0.0.2:80"
        );
        assert_eq!(
            registry.lookup("x.other.localhost").unwrap().backend,
            "10.0.0.1:80"
        );
    }

    #[test]
    fn duplicate_exact_and_wildcard_are_rejected() {
        let registry = Registry::new();
        registry.add(route("a.localhost", "1:1")).unwrap();
        assert_eq!(
            registry.add(route("a.localhost", "2:2")),
            Err(RegistryError::Exists("a.localhost".to_string()))
        );

        registry.add(route("*.a.localhost", "1:1")).unwrap();
        assert_eq!(
            registry.add(route("*.a.localhost", "2:2")),
            Err(RegistryError::WildcardExists("a.localhost".to_string()))
        );
    }

    #[test]
    fn remove_missing_is_not_found() {
        let registry = Registry::new();
        assert_eq!(
            registry.remove("nope.localhost"),
            Err(RegistryError::NotFound("nope.localhost".to_string()))
        );
    }

    #[test]
    fn remove_by_container_id_fires_callback_once() {
        let registry = Registry::new();
        let mut a = route("a.localhost", "1:1");
        a.container_id = Some("c1".into());
        let mut b = route("b.localhost", "1:1");
        b.container_id = Some("c1".into());
        registry.add(a).unwrap();
        registry.add(b).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        registry.set_on_change(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let removed = registry.remove_by_container_id("c1");
        assert_eq!(removed, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn on_change_callback_can_call_lookup_without_deadlock() {
        let registry = Arc::new(Registry::new());
        let registry_for_callback = registry.clone();
        registry.set_on_change(move || {
            let _ = registry_for_callback.lookup("app.localhost");
        });

        registry.add(route("app.localhost", "10.0.0.1:80")).unwrap();
        assert!(registry.lookup("app.localhost").is_some());
    }

    #[test]
    fn save_state_round_trips_sorted_by_host() {
        let registry = Registry::new();
        registry.add(route("b.localhost", "1:1")).unwrap();
        registry.add(route("a.localhost", "2:2")).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("routes.json");
        registry.save_state(&path).unwrap();

        let loaded = Registry::load_state(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].host, "a.localhost");
        assert_eq!(loaded[1].host, "b.localhost");
    }

    #[test]
    fn load_state_missing_file_is_an_error_callers_can_tolerate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(Registry::load_state(&path).is_err());
    }

    #[test]
    fn get_by_entrypoint_filters_tcp_routes() {
        let registry = Registry::new();
        let mut pg = route("db.localhost", "10.0.0.1:5432");
        pg.protocol = Protocol::Tcp;
        pg.entrypoint = Some("postgres".to_string());
        registry.add(pg).unwrap();
        registry.add(route("web.localhost", "10.0.0.1:80")).unwrap();

        let tcp_routes = registry.get_by_entrypoint("postgres");
        assert_eq!(tcp_routes.len(), 1);
        assert_eq!(tcp_routes[0].host, "db.localhost");
    }
}
