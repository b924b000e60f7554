use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::rbac::FetchContext;
use crate::store::{Filter, ObjectStore, UpsertOptions};
use crate::types::WorkflowView;

/// Outcome of a migration import. Per-row failures never abort the
/// batch; they downgrade the overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStatus {
    Success,
    Partial,
}

impl std::fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportStatus::Success => write!(f, "Import successful."),
            ImportStatus::Partial => write!(f, "Partial import (see logs)."),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Entity kinds to import, in bundle order. `workflow_edge` is always
    /// deferred to last regardless of its position: edges reference
    /// services by name and resolve only after all services exist.
    pub types: Vec<String>,
    pub empty_before: bool,
    pub skip_pool_update: bool,
}

/// Write one `<kind>.yaml` per entity kind: a list of serialized entities
/// in insertion order, relation fields encoded by referenced name.
pub fn migration_export(store: &ObjectStore, dir: &Path, types: &[&str]) -> Result<()> {
    fs::create_dir_all(dir).context("failed to create migration directory")?;
    for kind in types {
        let rows = store.export(kind)?;
        let rendered = serde_yaml::to_string(&rows)?;
        fs::write(dir.join(format!("{kind}.yaml")), rendered)
            .with_context(|| format!("failed to write {kind}.yaml"))?;
    }
    Ok(())
}

/// Load a migration bundle back through the store's upsert path.
///
/// Service rows carry their concrete subtype in the `type` discriminator.
/// Workflow membership (`services`, `start_service`) resolves after every
/// service exists; edges import last. Pool membership is recomputed at
/// the end unless skipped.
pub fn migration_import(
    store: &ObjectStore,
    dir: &Path,
    opts: &ImportOptions,
) -> Result<ImportStatus> {
    let ctx = FetchContext::system();
    let mut status = ImportStatus::Success;

    if opts.empty_before {
        for kind in &opts.types {
            for record in store.fetch_all(kind, &Filter::all(), &ctx)? {
                if let Err(err) = store.remove(kind, &Filter::by_id(record.id), true, &ctx) {
                    tracing::warn!("pre-import deletion of {kind} {} failed: {err}", record.id);
                }
            }
        }
    }

    let mut deferred_edges: Vec<Map<String, Value>> = Vec::new();
    let mut workflow_graphs: Vec<(String, Map<String, Value>)> = Vec::new();

    for kind in &opts.types {
        let path = dir.join(format!("{kind}.yaml"));
        if !path.exists() {
            continue;
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let rows: Vec<Map<String, Value>> =
            serde_yaml::from_str(&raw).with_context(|| format!("malformed {kind}.yaml"))?;

        if kind == "workflow_edge" {
            deferred_edges = rows;
            continue;
        }

        for mut row in rows {
            let concrete = if kind == "service" {
                match row.remove("type").as_ref().and_then(Value::as_str) {
                    Some(subtype) => subtype.to_string(),
                    None => "service".to_string(),
                }
            } else {
                kind.clone()
            };

            if concrete == "workflow" {
                // Node membership resolves once every service exists.
                let mut graph = Map::new();
                for key in ["services", "start_service"] {
                    if let Some(value) = row.remove(key) {
                        graph.insert(key.to_string(), value);
                    }
                }
                if let Some(name) = row.get("name").and_then(Value::as_str) {
                    workflow_graphs.push((name.to_string(), graph));
                }
            }

            let described = row
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("<unnamed>")
                .to_string();
            if let Err(err) = store.upsert(&concrete, row, &UpsertOptions::new(), &ctx) {
                tracing::warn!("{concrete} '{described}' could not be imported: {err}");
                status = ImportStatus::Partial;
            }
        }
    }

    for (name, mut graph) in workflow_graphs {
        graph.insert("name".into(), json!(name.clone()));
        if let Err(err) = store.upsert("workflow", graph, &UpsertOptions::new(), &ctx) {
            tracing::warn!("workflow '{name}' graph could not be resolved: {err}");
            status = ImportStatus::Partial;
        }
    }

    for edge in deferred_edges {
        let described = edge
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>")
            .to_string();
        if let Err(err) = store.upsert("workflow_edge", edge, &UpsertOptions::new(), &ctx) {
            tracing::warn!("workflow_edge '{described}' could not be imported: {err}");
            status = ImportStatus::Partial;
        }
    }

    if !opts.skip_pool_update {
        for pool in store.fetch_all("pool", &Filter::all(), &ctx)? {
            store.compute_pool(pool.id)?;
        }
    }

    tracing::info!("{status}");
    Ok(status)
}

/// Export one service as a portable bundle directory: `service.yaml` with
/// the service and, for workflows, every transitively owned sub-service;
/// `workflow_edge.yaml` with the deep edge set. Operational bindings
/// (`target_devices`, `target_pools`) are stripped.
pub fn export_service_bundle(store: &ObjectStore, service_id: u64, dir: &Path) -> Result<PathBuf> {
    let ctx = FetchContext::system();
    let root = store.fetch("service", &Filter::by_id(service_id), &ctx)?;

    let mut ordered = Vec::new();
    let mut workflow_ids = HashSet::new();
    let mut queue = vec![service_id];
    let mut seen = HashSet::new();
    while let Some(id) = queue.pop() {
        if !seen.insert(id) {
            continue;
        }
        let record = store.fetch("service", &Filter::by_id(id), &ctx)?;
        if record.kind == "workflow" {
            workflow_ids.insert(id);
            let workflow: WorkflowView = record.view()?;
            queue.extend(workflow.services);
        }
        ordered.push(record);
    }
    // Sub-services first so the bundle imports in dependency order.
    ordered.reverse();

    let bundle = dir.join(root.name());
    fs::create_dir_all(&bundle).context("failed to create bundle directory")?;

    let mut rows = Vec::new();
    for record in &ordered {
        let mut row = store.export_record(record)?;
        if let Some(map) = row.as_object_mut() {
            map.remove("target_devices");
            map.remove("target_pools");
        }
        rows.push(row);
    }
    fs::write(bundle.join("service.yaml"), serde_yaml::to_string(&rows)?)?;

    if root.kind == "workflow" {
        let mut edge_rows = Vec::new();
        for edge in store.fetch_all("workflow_edge", &Filter::all(), &ctx)? {
            let owner = edge.id_field("workflow");
            if owner.map(|id| workflow_ids.contains(&id)).unwrap_or(false) {
                edge_rows.push(store.export_record(&edge)?);
            }
        }
        fs::write(
            bundle.join("workflow_edge.yaml"),
            serde_yaml::to_string(&edge_rows)?,
        )?;
    }
    Ok(bundle)
}

/// Re-import a service bundle produced by `export_service_bundle`.
pub fn import_service_bundle(store: &ObjectStore, bundle: &Path) -> Result<ImportStatus> {
    migration_import(
        store,
        bundle,
        &ImportOptions {
            types: vec!["service".into(), "workflow_edge".into()],
            ..ImportOptions::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EdgeKind;
    use tempfile::TempDir;

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    fn open_store(dir: &TempDir, file: &str) -> ObjectStore {
        ObjectStore::open_at(&dir.path().join(file)).unwrap()
    }

    fn seed(store: &ObjectStore) {
        let ctx = FetchContext::system();
        store
            .upsert(
                "device",
                fields(&[("name", json!("core-1")), ("vendor", json!("juniper"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        store
            .upsert(
                "pool",
                fields(&[
                    ("name", json!("juniper-fleet")),
                    (
                        "predicate",
                        json!([{"field": "vendor", "op": "equals", "value": "juniper"}]),
                    ),
                ]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        let a = store
            .upsert(
                "service",
                fields(&[("name", json!("a")), ("target_devices", json!(["core-1"]))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        let b = store
            .upsert(
                "service",
                fields(&[("name", json!("b"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        let wf = store
            .upsert(
                "workflow",
                fields(&[
                    ("name", json!("w")),
                    ("services", json!([a.id, b.id])),
                    ("start_service", json!(a.id)),
                ]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        store
            .upsert(
                "workflow_edge",
                fields(&[
                    ("name", json!("a to b")),
                    ("source", json!(a.id)),
                    ("destination", json!(b.id)),
                    ("workflow", json!(wf.id)),
                    ("outcome", json!(EdgeKind::Success)),
                ]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
    }

    const ALL_TYPES: &[&str] = &["device", "pool", "service", "workflow_edge"];

    #[test]
    fn migration_round_trips_into_a_fresh_store() {
        let dir = TempDir::new().unwrap();
        let source = open_store(&dir, "source.redb");
        seed(&source);
        let bundle = dir.path().join("migrations");
        migration_export(&source, &bundle, ALL_TYPES).unwrap();

        let target = open_store(&dir, "target.redb");
        let status = migration_import(
            &target,
            &bundle,
            &ImportOptions {
                types: ALL_TYPES.iter().map(|s| s.to_string()).collect(),
                ..ImportOptions::default()
            },
        )
        .unwrap();
        assert_eq!(status, ImportStatus::Success);

        let ctx = FetchContext::system();
        let workflow: WorkflowView = target
            .fetch("workflow", &Filter::by_name("w"), &ctx)
            .unwrap()
            .view()
            .unwrap();
        let a = target.fetch("service", &Filter::by_name("a"), &ctx).unwrap();
        let b = target.fetch("service", &Filter::by_name("b"), &ctx).unwrap();
        assert_eq!(workflow.services.len(), 2);
        assert!(workflow.services.contains(&a.id));
        assert_eq!(workflow.start_service, Some(a.id));

        // Relations re-resolved by name against the new identities.
        let device = target
            .fetch("device", &Filter::by_name("core-1"), &ctx)
            .unwrap();
        assert_eq!(a.id_list("target_devices"), vec![device.id]);

        let edges = target
            .fetch_all("workflow_edge", &Filter::all(), &ctx)
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].id_field("source"), Some(a.id));
        assert_eq!(edges[0].id_field("destination"), Some(b.id));

        // Dynamic pools recomputed after import.
        let pool = target
            .fetch("pool", &Filter::by_name("juniper-fleet"), &ctx)
            .unwrap();
        assert_eq!(pool.id_list("devices"), vec![device.id]);
    }

    #[test]
    fn row_failures_leave_the_rest_of_the_batch_intact() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("migrations");
        fs::create_dir_all(&bundle).unwrap();
        let rows = vec![
            json!({"name": "first", "type": "service"}),
            json!({"name": "bad/name", "type": "service"}),
            json!({"name": "third", "type": "service"}),
        ];
        fs::write(
            bundle.join("service.yaml"),
            serde_yaml::to_string(&rows).unwrap(),
        )
        .unwrap();

        let store = open_store(&dir, "store.redb");
        let status = migration_import(
            &store,
            &bundle,
            &ImportOptions {
                types: vec!["service".into()],
                ..ImportOptions::default()
            },
        )
        .unwrap();
        assert_eq!(status, ImportStatus::Partial);
        assert_eq!(status.to_string(), "Partial import (see logs).");

        let ctx = FetchContext::system();
        assert!(store.fetch("service", &Filter::by_name("first"), &ctx).is_ok());
        assert!(store.fetch("service", &Filter::by_name("third"), &ctx).is_ok());
        assert!(store
            .fetch_optional("service", &Filter::by_name("bad/name"), &ctx)
            .unwrap()
            .is_none());
    }

    #[test]
    fn service_bundle_strips_operational_bindings() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, "store.redb");
        seed(&store);
        let ctx = FetchContext::system();
        let wf = store.fetch("workflow", &Filter::by_name("w"), &ctx).unwrap();

        let bundle = export_service_bundle(&store, wf.id, dir.path()).unwrap();
        assert!(bundle.join("service.yaml").exists());
        assert!(bundle.join("workflow_edge.yaml").exists());

        let rows: Vec<Value> =
            serde_yaml::from_str(&fs::read_to_string(bundle.join("service.yaml")).unwrap())
                .unwrap();
        // The workflow and its two sub-services, no target bindings.
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert!(row.get("target_devices").is_none());
            assert!(row.get("target_pools").is_none());
        }

        // The bundle imports into a fresh store.
        let target = open_store(&dir, "target.redb");
        let status = import_service_bundle(&target, &bundle).unwrap();
        assert_eq!(status, ImportStatus::Success);
        assert!(target
            .fetch("workflow", &Filter::by_name("w"), &ctx)
            .is_ok());
    }
}
