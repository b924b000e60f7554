use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::config::ClusterConfig;
use crate::rbac::FetchContext;
use crate::store::{Filter, ObjectStore, UpsertOptions};
use crate::types::{Heartbeat, ServerView};

/// Cluster membership over server entities in the object store. Workers
/// register themselves, refresh their heartbeat, and expose a minimal
/// liveness document for external scanning; peers that stop refreshing
/// are marked unreachable.
pub struct ClusterMonitor {
    store: Arc<ObjectStore>,
    config: ClusterConfig,
    node_name: String,
}

impl ClusterMonitor {
    pub fn new(store: Arc<ObjectStore>, config: ClusterConfig, node_name: impl Into<String>) -> Self {
        Self {
            store,
            config,
            node_name: node_name.into(),
        }
    }

    /// The liveness document served to membership scanners.
    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            name: self.node_name.clone(),
            cluster_id: self.config.id.clone(),
            status: "healthy".to_string(),
        }
    }

    /// Register or refresh a server record.
    pub fn register(&self, name: &str, ip_address: &str) -> Result<ServerView> {
        let record = self.store.upsert(
            "server",
            server_fields(name, &[
                ("ip_address", json!(ip_address)),
                ("cluster_id", json!(self.config.id)),
                ("status", json!("healthy")),
                ("last_heartbeat", json!(Utc::now().to_rfc3339())),
            ]),
            &UpsertOptions::new(),
            &FetchContext::system(),
        )?;
        Ok(record.view()?)
    }

    /// Refresh the heartbeat timestamp of a known server.
    pub fn refresh(&self, name: &str) -> Result<()> {
        self.store.upsert(
            "server",
            server_fields(name, &[
                ("status", json!("healthy")),
                ("last_heartbeat", json!(Utc::now().to_rfc3339())),
            ]),
            &UpsertOptions::new(),
            &FetchContext::system(),
        )?;
        Ok(())
    }

    pub fn servers(&self) -> Result<Vec<ServerView>> {
        let records = self
            .store
            .fetch_all("server", &Filter::all(), &FetchContext::system())?;
        let mut servers = Vec::with_capacity(records.len());
        for record in records {
            servers.push(record.view()?);
        }
        Ok(servers)
    }

    /// Mark servers whose heartbeat lapsed as unreachable; returns their
    /// names.
    pub fn check_stale(&self) -> Result<Vec<String>> {
        let timeout = Duration::seconds(self.config.heartbeat_timeout_secs);
        let now = Utc::now();
        let mut stale = Vec::new();
        for server in self.servers()? {
            let lapsed = match server.last_heartbeat {
                Some(at) => now - at > timeout,
                None => true,
            };
            if lapsed && server.status != "unreachable" {
                self.store.upsert(
                    "server",
                    server_fields(&server.name, &[("status", json!("unreachable"))]),
                    &UpsertOptions::new(),
                    &FetchContext::system(),
                )?;
                tracing::warn!("server '{}' missed its heartbeat window", server.name);
                stale.push(server.name);
            }
        }
        Ok(stale)
    }
}

fn server_fields(name: &str, pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("name".into(), json!(name));
    for (key, value) in pairs {
        fields.insert(key.to_string(), value.clone());
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn monitor(dir: &TempDir) -> ClusterMonitor {
        let store = Arc::new(ObjectStore::open_at(&dir.path().join("store.redb")).unwrap());
        let config = ClusterConfig {
            id: "lab".into(),
            heartbeat_timeout_secs: 30,
        };
        ClusterMonitor::new(store, config, "worker-1")
    }

    #[test]
    fn heartbeat_document_carries_cluster_identity() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir);
        let heartbeat = monitor.heartbeat();
        assert_eq!(heartbeat.name, "worker-1");
        assert_eq!(heartbeat.cluster_id, "lab");
        assert_eq!(heartbeat.status, "healthy");
    }

    #[test]
    fn register_and_refresh_track_liveness() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir);

        let server = monitor.register("worker-2", "10.0.0.2").unwrap();
        assert_eq!(server.status, "healthy");
        assert!(server.last_heartbeat.is_some());

        monitor.refresh("worker-2").unwrap();
        let servers = monitor.servers().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].ip_address, "10.0.0.2");
    }

    #[test]
    fn lapsed_servers_are_marked_unreachable() {
        let dir = TempDir::new().unwrap();
        let monitor = monitor(&dir);
        monitor.register("worker-2", "10.0.0.2").unwrap();

        // Backdate the heartbeat past the timeout window.
        let stale_time = (Utc::now() - Duration::seconds(120)).to_rfc3339();
        monitor
            .store
            .upsert(
                "server",
                server_fields("worker-2", &[("last_heartbeat", json!(stale_time))]),
                &UpsertOptions::new(),
                &FetchContext::system(),
            )
            .unwrap();

        let stale = monitor.check_stale().unwrap();
        assert_eq!(stale, vec!["worker-2".to_string()]);
        let servers = monitor.servers().unwrap();
        assert_eq!(servers[0].status, "unreachable");

        // Idempotent: already-marked servers are not reported again.
        assert!(monitor.check_stale().unwrap().is_empty());
    }
}
