use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::schema::SchemaRegistry;
use crate::types::ObjectRecord;

const CHANGELOG_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("changelog");

/// Immutable audit entry for one field of one mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub actor: String,
    pub kind: String,
    pub name: String,
    pub field: String,
    pub old: Value,
    pub new: Value,
    pub time: DateTime<Utc>,
}

/// Observer invoked synchronously around every object store write.
/// Observers run after the commit and must never alter its outcome; the
/// store logs and swallows their failures.
pub trait ChangeObserver: Send + Sync {
    fn on_insert(&self, actor: &str, record: &ObjectRecord);
    fn on_update(&self, actor: &str, old: &ObjectRecord, new: &ObjectRecord);
    fn on_delete(&self, actor: &str, record: &ObjectRecord);
}

/// Field-level diff between two versions of a record. Secret fields are
/// skipped; unchanged fields produce nothing.
pub fn diff_fields(
    registry: &SchemaRegistry,
    old: &ObjectRecord,
    new: &ObjectRecord,
) -> Vec<(String, Value, Value)> {
    let mut changes = Vec::new();
    for (key, new_value) in &new.fields {
        if key == "id" || registry.is_secret(&new.kind, key) {
            continue;
        }
        let old_value = old.fields.get(key).cloned().unwrap_or(Value::Null);
        if old_value != *new_value {
            changes.push((key.clone(), old_value, new_value.clone()));
        }
    }
    changes
}

/// Append-only change log backed by a redb table. Keys are time-ordered
/// so iteration yields entries in write order.
pub struct ChangeLog {
    db: Arc<Database>,
    registry: Arc<SchemaRegistry>,
}

impl ChangeLog {
    pub fn new(db: Arc<Database>, registry: Arc<SchemaRegistry>) -> StoreResult<Self> {
        let txn = db.begin_write()?;
        txn.open_table(CHANGELOG_TABLE)?;
        txn.commit()?;
        Ok(Self { db, registry })
    }

    fn append(&self, record: &ChangeRecord) -> StoreResult<()> {
        let key = format!(
            "{}-{}",
            record.time.format("%Y%m%d%H%M%S%6f"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let value = serde_json::to_vec(record)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CHANGELOG_TABLE)?;
            table.insert(key.as_str(), value.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn record(&self, actor: &str, record: &ObjectRecord, field: &str, old: Value, new: Value) {
        let entry = ChangeRecord {
            actor: actor.to_string(),
            kind: record.kind.clone(),
            name: record.name().to_string(),
            field: field.to_string(),
            old,
            new,
            time: Utc::now(),
        };
        if let Err(err) = self.append(&entry) {
            tracing::warn!("change log append failed: {err}");
        }
    }

    pub fn entries(&self) -> StoreResult<Vec<ChangeRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHANGELOG_TABLE)?;
        let mut entries = Vec::new();
        for item in table.iter()? {
            let (_key, value) = item?;
            entries.push(serde_json::from_slice(value.value())?);
        }
        Ok(entries)
    }

    /// Retention purge: drop entries older than the cutoff.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let boundary = format!("{}", cutoff.format("%Y%m%d%H%M%S%6f"));
        let txn = self.db.begin_write()?;
        let purged;
        {
            let mut table = txn.open_table(CHANGELOG_TABLE)?;
            let stale: Vec<String> = table
                .range(..boundary.as_str())?
                .filter_map(|item| item.ok())
                .map(|(key, _)| key.value().to_string())
                .collect();
            purged = stale.len();
            for key in stale {
                table.remove(key.as_str())?;
            }
        }
        txn.commit()?;
        Ok(purged)
    }

    fn logged(&self, kind: &str) -> bool {
        self.registry
            .descriptor(kind)
            .map(|d| d.log_changes)
            .unwrap_or(true)
    }
}

impl ChangeObserver for ChangeLog {
    fn on_insert(&self, actor: &str, record: &ObjectRecord) {
        if !self.logged(&record.kind) {
            return;
        }
        tracing::info!("CREATION: {} '{}'", record.kind, record.name());
        self.record(
            actor,
            record,
            "created",
            Value::Null,
            Value::String(record.name().to_string()),
        );
    }

    fn on_update(&self, actor: &str, old: &ObjectRecord, new: &ObjectRecord) {
        if !self.logged(&new.kind) {
            return;
        }
        for (field, old_value, new_value) in diff_fields(&self.registry, old, new) {
            tracing::info!(
                "UPDATE: {} '{}': {} '{}' => '{}'",
                new.kind,
                new.name(),
                field,
                old_value,
                new_value
            );
            self.record(actor, new, &field, old_value, new_value);
        }
    }

    fn on_delete(&self, actor: &str, record: &ObjectRecord) {
        if !self.logged(&record.kind) {
            return;
        }
        tracing::info!("DELETION: {} '{}'", record.kind, record.name());
        self.record(
            actor,
            record,
            "deleted",
            Value::String(record.name().to_string()),
            Value::Null,
        );
    }
}
