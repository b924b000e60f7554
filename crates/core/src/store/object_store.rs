use redb::{Database, ReadableTable, TableDefinition};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::CoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::rbac::{AccessMode, AccessScope, FetchContext};
use crate::schema::{coerce_scalar, RelationSpec, SchemaRegistry};
use crate::secrets::{backend_from_config, CredentialBackend, SecretField};
use crate::store::observer::{ChangeLog, ChangeObserver};
use crate::types::{GroupView, ObjectRecord, PoolView, UserView};

const OBJECTS_TABLE: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("objects");
const NAMES_TABLE: TableDefinition<(&str, &str), u64> = TableDefinition::new("names");
const SEQUENCES_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Equality filter over a fetch. Point lookups go through the id or name
/// fast path; field filters scan the kind's key range.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub fields: Vec<(String, Value)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: u64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.push((key.into(), value));
        self
    }

    pub fn matches(&self, record: &ObjectRecord) -> bool {
        if let Some(id) = self.id {
            if record.id != id {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if record.name() != name {
                return false;
            }
        }
        self.fields
            .iter()
            .all(|(key, value)| record.fields.get(key) == Some(value))
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(id) = self.id {
            parts.push(format!("id={id}"));
        }
        if let Some(name) = &self.name {
            parts.push(format!("name='{name}'"));
        }
        for (key, value) in &self.fields {
            parts.push(format!("{key}={value}"));
        }
        if parts.is_empty() {
            parts.push("any".to_string());
        }
        parts.join(", ")
    }
}

/// Knobs for one upsert call.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertOptions {
    /// Reject the call instead of updating when an id/name match exists.
    pub must_be_new: bool,
    /// Re-evaluate every dynamic pool's predicate against the entity.
    pub update_pools: bool,
}

impl UpsertOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must_be_new(mut self) -> Self {
        self.must_be_new = true;
        self
    }

    pub fn update_pools(mut self) -> Self {
        self.update_pools = true;
        self
    }
}

/// Transactional persistent-object access layer. The single gate through
/// which every other component touches persisted state: naming and
/// uniqueness invariants, RBAC narrowing, retry-with-backoff on transient
/// failures, and synchronous change observation all live here.
pub struct ObjectStore {
    db: Arc<Database>,
    registry: Arc<SchemaRegistry>,
    secrets: Arc<dyn CredentialBackend>,
    observers: RwLock<Vec<Arc<dyn ChangeObserver>>>,
    changelog: Arc<ChangeLog>,
    retry: crate::config::RetrySettings,
}

impl ObjectStore {
    pub fn open(config: &CoreConfig) -> StoreResult<Self> {
        let backend =
            backend_from_config(&config.secrets).map_err(|err| StoreError::Backend(err.to_string()))?;
        Self::open_with_backend(config, backend)
    }

    pub fn open_with_backend(
        config: &CoreConfig,
        secrets: Arc<dyn CredentialBackend>,
    ) -> StoreResult<Self> {
        if let Some(parent) = config.database.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| StoreError::Backend(err.to_string()))?;
            }
        }
        let db = Arc::new(Database::create(&config.database.path)?);

        let txn = db.begin_write()?;
        {
            txn.open_table(OBJECTS_TABLE)?;
            txn.open_table(NAMES_TABLE)?;
            txn.open_table(SEQUENCES_TABLE)?;
        }
        txn.commit()?;

        let registry = Arc::new(SchemaRegistry::bootstrap());
        let changelog = Arc::new(ChangeLog::new(db.clone(), registry.clone())?);
        let store = Self {
            db,
            registry,
            secrets,
            observers: RwLock::new(vec![changelog.clone()]),
            changelog,
            retry: config.database.retry.clone(),
        };
        store.seed_admin()?;
        Ok(store)
    }

    /// Open a store at a path with defaults; test and tooling convenience.
    pub fn open_at(path: &Path) -> StoreResult<Self> {
        let mut config = CoreConfig::default();
        config.database.path = path.to_path_buf();
        Self::open(&config)
    }

    fn seed_admin(&self) -> StoreResult<()> {
        if self
            .fetch_optional("user", &Filter::by_name("admin"), &FetchContext::system())?
            .is_none()
        {
            let mut fields = Map::new();
            fields.insert("name".into(), json!("admin"));
            fields.insert("is_admin".into(), json!(true));
            self.upsert("user", fields, &UpsertOptions::new(), &FetchContext::system())?;
        }
        Ok(())
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.changelog
    }

    pub fn register_observer(&self, observer: Arc<dyn ChangeObserver>) {
        self.observers.write().unwrap().push(observer);
    }

    // --- retry discipline -------------------------------------------------

    fn with_retry<T>(
        &self,
        attempts: u32,
        mut op: impl FnMut() -> StoreResult<T>,
    ) -> StoreResult<T> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    tracing::warn!("store attempt {attempt} failed ({err}), retrying");
                    std::thread::sleep(Duration::from_millis(
                        self.retry.backoff_ms * u64::from(attempt),
                    ));
                }
                Err(err) => {
                    if err.is_transient() {
                        tracing::error!("store retries exhausted: {err}");
                    }
                    return Err(err);
                }
            }
        }
        unreachable!("retry loop returns on the final attempt")
    }

    fn with_read_retry<T>(&self, op: impl FnMut() -> StoreResult<T>) -> StoreResult<T> {
        self.with_retry(self.retry.fetch_attempts, op)
    }

    fn with_commit_retry<T>(&self, op: impl FnMut() -> StoreResult<T>) -> StoreResult<T> {
        self.with_retry(self.retry.commit_attempts, op)
    }

    // --- fetch ------------------------------------------------------------

    /// Point lookup: exactly one row, `NotFound` when nothing matches,
    /// `AccessDenied` when the only matches were excluded by the access
    /// filter.
    pub fn fetch(
        &self,
        kind: &str,
        filter: &Filter,
        ctx: &FetchContext,
    ) -> StoreResult<ObjectRecord> {
        match self.fetch_optional(kind, filter, ctx)? {
            Some(record) => Ok(record),
            None => Err(StoreError::NotFound {
                kind: kind.to_string(),
                criteria: filter.describe(),
            }),
        }
    }

    /// Point lookup with "allow none": `Ok(None)` on zero matches.
    pub fn fetch_optional(
        &self,
        kind: &str,
        filter: &Filter,
        ctx: &FetchContext,
    ) -> StoreResult<Option<ObjectRecord>> {
        let scope = self.access_scope(kind, ctx)?;
        let (mut matches, excluded) =
            self.with_read_retry(|| self.read_matches(kind, filter, &scope))?;
        if let Some(record) = matches.drain(..).next() {
            return Ok(Some(record));
        }
        if excluded {
            return Err(StoreError::AccessDenied {
                kind: kind.to_string(),
                user: ctx.actor().to_string(),
                mode: ctx.mode,
            });
        }
        Ok(None)
    }

    /// Listing lookup: every visible match, possibly empty.
    pub fn fetch_all(
        &self,
        kind: &str,
        filter: &Filter,
        ctx: &FetchContext,
    ) -> StoreResult<Vec<ObjectRecord>> {
        let scope = self.access_scope(kind, ctx)?;
        let (matches, _) = self.with_read_retry(|| self.read_matches(kind, filter, &scope))?;
        Ok(matches)
    }

    fn read_matches(
        &self,
        kind: &str,
        filter: &Filter,
        scope: &AccessScope,
    ) -> StoreResult<(Vec<ObjectRecord>, bool)> {
        let base = self.registry.storage_kind(kind)?;
        let txn = self.db.begin_read()?;
        let objects = txn.open_table(OBJECTS_TABLE)?;

        let mut matches = Vec::new();
        let mut excluded = false;
        let mut consider = |record: ObjectRecord| {
            if !self.registry.is_instance(&record.kind, kind) || !filter.matches(&record) {
                return;
            }
            if scope.permits(&record) {
                matches.push(record);
            } else {
                excluded = true;
            }
        };

        if let Some(id) = filter.id {
            if let Some(guard) = objects.get((base, id))? {
                consider(parse_record(guard.value())?);
            }
        } else if let Some(name) = &filter.name {
            let names = txn.open_table(NAMES_TABLE)?;
            if let Some(id_guard) = names.get((base, name.as_str()))? {
                let id = id_guard.value();
                if let Some(guard) = objects.get((base, id))? {
                    consider(parse_record(guard.value())?);
                }
            }
        } else {
            for item in objects.range((base, u64::MIN)..=(base, u64::MAX))? {
                let (_key, guard) = item?;
                consider(parse_record(guard.value())?);
            }
        }
        Ok((matches, excluded))
    }

    // --- access filter ----------------------------------------------------

    /// Narrowing for one identity and mode. Admins bypass filtering, as do
    /// internal (system) calls; identity lookups themselves are never
    /// filtered so the filter can always resolve the requesting user.
    fn access_scope(&self, kind: &str, ctx: &FetchContext) -> StoreResult<AccessScope> {
        let descriptor = self.registry.descriptor(kind)?;
        let Some(identity) = &ctx.identity else {
            return Ok(AccessScope::Unrestricted);
        };
        if kind == "user" || !descriptor.rbac_scoped {
            return Ok(AccessScope::Unrestricted);
        }

        let user: UserView = self
            .fetch("user", &Filter::by_name(identity), &FetchContext::system())?
            .view()?;
        if user.is_admin {
            return Ok(AccessScope::Unrestricted);
        }
        let Some(group_id) = user.group else {
            return Ok(AccessScope::Members(Default::default()));
        };
        let group: GroupView = self
            .fetch("group", &Filter::by_id(group_id), &FetchContext::system())?
            .view()?;
        let pools: Vec<PoolView> = self
            .fetch_all("pool", &Filter::all(), &FetchContext::system())?
            .iter()
            .map(ObjectRecord::view)
            .collect::<StoreResult<_>>()?;
        Ok(AccessScope::for_group(
            &group,
            &pools,
            ctx.mode,
            descriptor.base,
        ))
    }

    // --- upsert -----------------------------------------------------------

    /// Single mutation path for every entity. Validates names, locates an
    /// existing row by id or name, merges fields per the schema (relations
    /// coerced through fetch, booleans from falsy strings, unknown keys
    /// skipped, secrets diverted to the credential backend), and commits
    /// under the retry discipline. Integrity violations are surfaced
    /// immediately, never retried.
    pub fn upsert(
        &self,
        kind: &str,
        mut fields: Map<String, Value>,
        opts: &UpsertOptions,
        ctx: &FetchContext,
    ) -> StoreResult<ObjectRecord> {
        let descriptor = self.registry.descriptor(kind)?;

        for key in ["name", "scoped_name"] {
            if let Some(Value::String(name)) = fields.get(key) {
                if name
                    .chars()
                    .any(|c| matches!(c, '/' | '\\' | '\'' | '"'))
                {
                    return Err(StoreError::Validation(name.clone()));
                }
            }
        }

        let supplied_id = fields.remove("id").as_ref().and_then(Value::as_u64);
        let edit_ctx = ctx.clone().with_mode(AccessMode::Edit);
        let existing = if let Some(id) = supplied_id {
            Some(self.fetch(kind, &Filter::by_id(id), &edit_ctx)?)
        } else if let Some(name) = fields.get("name").and_then(Value::as_str) {
            self.fetch_optional(kind, &Filter::by_name(name), &edit_ctx)?
        } else {
            None
        };

        let (old, mut record) = match existing {
            Some(existing) if !opts.must_be_new => (Some(existing.clone()), existing),
            Some(existing) => {
                return Err(StoreError::Integrity(format!(
                    "{kind} '{}' already exists",
                    existing.name()
                )))
            }
            None => {
                let name = fields
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| StoreError::Validation("a name is required".into()))?
                    .to_string();
                let id = self.allocate_id(descriptor.base)?;
                let mut initial = Map::new();
                initial.insert("id".into(), json!(id));
                initial.insert("type".into(), json!(kind));
                initial.insert("name".into(), json!(name));
                (
                    None,
                    ObjectRecord {
                        id,
                        kind: kind.to_string(),
                        fields: initial,
                    },
                )
            }
        };

        // The name lands first so secret paths see the post-rename name.
        if let Some(name) = fields.remove("name") {
            record.fields.insert("name".into(), name);
        }
        let record_name = record.name().to_string();
        // Merge against the stored row's concrete subtype, which may be
        // narrower than the requested kind.
        let merge_kind = record.kind.clone();

        for (key, value) in fields {
            if key == "id" || key == "type" {
                continue;
            }
            if self.registry.is_secret(&merge_kind, &key) {
                if let Value::String(plaintext) = &value {
                    if !plaintext.is_empty() {
                        SecretField::new(&merge_kind, &record_name, &key)
                            .store(self.secrets.as_ref(), plaintext)
                            .map_err(|err| StoreError::Backend(err.to_string()))?;
                    }
                }
                record.fields.insert(key, Value::String(String::new()));
                continue;
            }
            if let Some(relation) = self.registry.relation(&merge_kind, &key) {
                let resolved = self.resolve_relation(&relation, value)?;
                record.fields.insert(key, resolved);
                continue;
            }
            if let Some(field_kind) = self.registry.field_kind(&merge_kind, &key) {
                record.fields.insert(key, coerce_scalar(field_kind, value)?);
                continue;
            }
            // Unknown field: skipped.
        }

        self.with_commit_retry(|| self.write_record(&record, old.as_ref()))?;
        self.notify_write(ctx.actor(), old.as_ref(), &record);

        if opts.update_pools && descriptor.pool_member {
            self.refresh_pool_membership(&record, ctx.actor())?;
        }
        Ok(record)
    }

    /// Relation-typed values arrive as ids or names (or lists thereof) and
    /// leave as ids.
    fn resolve_relation(&self, relation: &RelationSpec, value: Value) -> StoreResult<Value> {
        let resolve_one = |item: Value| -> StoreResult<Value> {
            match item {
                Value::Number(_) => Ok(item),
                Value::String(name) => {
                    let record = self.fetch(
                        relation.kind,
                        &Filter::by_name(&name),
                        &FetchContext::system(),
                    )?;
                    Ok(json!(record.id))
                }
                other => Err(StoreError::Validation(format!(
                    "cannot resolve {other} as a {} reference",
                    relation.kind
                ))),
            }
        };
        if relation.list {
            let items = match value {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => {
                    return Err(StoreError::Validation(format!(
                        "expected a list of {} references, got {other}",
                        relation.kind
                    )))
                }
            };
            let resolved: StoreResult<Vec<Value>> = items.into_iter().map(resolve_one).collect();
            Ok(Value::Array(resolved?))
        } else {
            match value {
                Value::Null => Ok(Value::Null),
                other => resolve_one(other),
            }
        }
    }

    fn allocate_id(&self, base: &str) -> StoreResult<u64> {
        self.with_commit_retry(|| {
            let txn = self.db.begin_write()?;
            let id;
            {
                let mut sequences = txn.open_table(SEQUENCES_TABLE)?;
                let last = sequences.get(base)?.map(|g| g.value()).unwrap_or(0);
                id = last + 1;
                sequences.insert(base, id)?;
            }
            txn.commit()?;
            Ok(id)
        })
    }

    /// One write transaction: uniqueness check against the name index,
    /// record body, and index maintenance commit together.
    fn write_record(&self, record: &ObjectRecord, old: Option<&ObjectRecord>) -> StoreResult<()> {
        let base = self.registry.storage_kind(&record.kind)?;
        let name = record.name().to_string();
        let payload = serde_json::to_vec(&record.fields)?;

        let txn = self.db.begin_write()?;
        {
            let mut names = txn.open_table(NAMES_TABLE)?;
            if let Some(holder) = names.get((base, name.as_str()))? {
                if holder.value() != record.id {
                    return Err(StoreError::Integrity(format!(
                        "{base} name '{name}' is already in use"
                    )));
                }
            }
            if let Some(old) = old {
                if old.name() != name {
                    names.remove((base, old.name()))?;
                }
            }
            names.insert((base, name.as_str()), record.id)?;

            let mut objects = txn.open_table(OBJECTS_TABLE)?;
            objects.insert((base, record.id), payload.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn notify_write(&self, actor: &str, old: Option<&ObjectRecord>, new: &ObjectRecord) {
        for observer in self.observers.read().unwrap().iter() {
            match old {
                Some(old) => observer.on_update(actor, old, new),
                None => observer.on_insert(actor, new),
            }
        }
    }

    fn notify_delete(&self, actor: &str, record: &ObjectRecord) {
        for observer in self.observers.read().unwrap().iter() {
            observer.on_delete(actor, record);
        }
    }

    // --- dynamic pools ----------------------------------------------------

    /// Re-evaluate every dynamic pool's predicate against one entity and
    /// adjust membership. Each pool adjustment is a read-modify-write under
    /// the commit retry discipline so concurrent recomputations of the same
    /// pool cannot lose updates.
    fn refresh_pool_membership(&self, record: &ObjectRecord, actor: &str) -> StoreResult<()> {
        let base = self.registry.storage_kind(&record.kind)?;
        let Some(member_field) = SchemaRegistry::pool_member_field(base) else {
            return Ok(());
        };
        let pools = self.fetch_all("pool", &Filter::all(), &FetchContext::system())?;
        for pool_record in pools {
            let pool: PoolView = pool_record.view()?;
            if pool.manual {
                continue;
            }
            let matched = pool.matches(&record.fields);
            self.adjust_pool_member(pool.id, member_field, record.id, matched, actor)?;
        }
        Ok(())
    }

    fn adjust_pool_member(
        &self,
        pool_id: u64,
        member_field: &str,
        entity_id: u64,
        matched: bool,
        actor: &str,
    ) -> StoreResult<()> {
        let outcome = self.with_commit_retry(|| {
            let fresh = self.fetch("pool", &Filter::by_id(pool_id), &FetchContext::system())?;
            let mut members = fresh.id_list(member_field);
            let has = members.contains(&entity_id);
            if matched == has {
                return Ok(None);
            }
            if matched {
                members.push(entity_id);
            } else {
                members.retain(|&member| member != entity_id);
            }
            let mut updated = fresh.clone();
            updated.fields.insert(member_field.to_string(), json!(members));
            self.write_record(&updated, Some(&fresh))?;
            Ok(Some((fresh, updated)))
        })?;
        if let Some((old, new)) = outcome {
            self.notify_write(actor, Some(&old), &new);
        }
        Ok(())
    }

    /// Full recompute of one pool against every candidate, as after a
    /// migration import.
    pub fn compute_pool(&self, pool_id: u64) -> StoreResult<()> {
        let pool: PoolView = self
            .fetch("pool", &Filter::by_id(pool_id), &FetchContext::system())?
            .view()?;
        if pool.manual {
            return Ok(());
        }
        for base in ["device", "service"] {
            let member_field = SchemaRegistry::pool_member_field(base)
                .expect("device and service are pool member kinds");
            let candidates = self.fetch_all(base, &Filter::all(), &FetchContext::system())?;
            for candidate in candidates {
                let matched = pool.matches(&candidate.fields);
                self.adjust_pool_member(pool.id, member_field, candidate.id, matched, "system")?;
            }
        }
        Ok(())
    }

    // --- remove -----------------------------------------------------------

    /// Load, run the kind's pre-delete hook, capture the serialized
    /// snapshot, then delete. `allow_none` turns a miss into `Ok(None)`.
    pub fn remove(
        &self,
        kind: &str,
        filter: &Filter,
        allow_none: bool,
        ctx: &FetchContext,
    ) -> StoreResult<Option<Value>> {
        let edit_ctx = ctx.clone().with_mode(AccessMode::Edit);
        let record = match self.fetch_optional(kind, filter, &edit_ctx)? {
            Some(record) => record,
            None if allow_none => return Ok(None),
            None => {
                return Err(StoreError::NotFound {
                    kind: kind.to_string(),
                    criteria: filter.describe(),
                })
            }
        };

        self.pre_delete(&record, ctx)?;
        let snapshot = self.serialize_record(&record)?;
        self.with_commit_retry(|| self.delete_record(&record))?;

        for field in self.registry.descriptor(&record.kind)?.secret_fields {
            let path = SecretField::new(&record.kind, record.name(), field);
            if let Err(err) = self.secrets.delete(path.path()) {
                tracing::warn!("failed to drop secret {}: {err}", path.path());
            }
        }
        self.notify_delete(ctx.actor(), &record);
        Ok(Some(snapshot))
    }

    /// Type-specific referential cleanup and guards, applied before the row
    /// disappears.
    fn pre_delete(&self, record: &ObjectRecord, ctx: &FetchContext) -> StoreResult<()> {
        let base = self.registry.storage_kind(&record.kind)?;
        match base {
            "service" => {
                // Edges referencing the service go with it.
                let edges = self.fetch_all("workflow_edge", &Filter::all(), &FetchContext::system())?;
                for edge in edges {
                    let touches = [edge.id_field("source"), edge.id_field("destination"), edge.id_field("workflow")]
                        .iter()
                        .any(|endpoint| *endpoint == Some(record.id));
                    if touches {
                        self.with_commit_retry(|| self.delete_record(&edge))?;
                        self.notify_delete(ctx.actor(), &edge);
                    }
                }
                self.drop_membership(record.id, "services")?;
            }
            "device" => {
                self.drop_membership(record.id, "devices")?;
            }
            "pool" => {
                let groups = self.fetch_all("group", &Filter::all(), &FetchContext::system())?;
                for group in groups {
                    if group.id_list("read_pools").contains(&record.id)
                        || group.id_list("edit_pools").contains(&record.id)
                    {
                        return Err(StoreError::Integrity(format!(
                            "pool '{}' is referenced by group '{}'",
                            record.name(),
                            group.name()
                        )));
                    }
                }
            }
            "group" => {
                let users = self.fetch_all("user", &Filter::all(), &FetchContext::system())?;
                for user in users {
                    if user.id_field("group") == Some(record.id) {
                        return Err(StoreError::Integrity(format!(
                            "group '{}' is referenced by user '{}'",
                            record.name(),
                            user.name()
                        )));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn drop_membership(&self, entity_id: u64, member_field: &str) -> StoreResult<()> {
        let pools = self.fetch_all("pool", &Filter::all(), &FetchContext::system())?;
        for pool in pools {
            if pool.id_list(member_field).contains(&entity_id) {
                self.adjust_pool_member(pool.id, member_field, entity_id, false, "system")?;
            }
        }
        Ok(())
    }

    fn delete_record(&self, record: &ObjectRecord) -> StoreResult<()> {
        let base = self.registry.storage_kind(&record.kind)?;
        let txn = self.db.begin_write()?;
        {
            let mut objects = txn.open_table(OBJECTS_TABLE)?;
            objects.remove((base, record.id))?;
            let mut names = txn.open_table(NAMES_TABLE)?;
            names.remove((base, record.name()))?;
        }
        txn.commit()?;
        Ok(())
    }

    // --- serialization ----------------------------------------------------

    /// Snapshot with relation fields encoded by referenced name; secrets
    /// are omitted.
    pub fn serialize_record(&self, record: &ObjectRecord) -> StoreResult<Value> {
        self.render_record(record, false)
    }

    /// Migration form: additionally omits non-migratable fields and null
    /// values.
    pub fn export_record(&self, record: &ObjectRecord) -> StoreResult<Value> {
        self.render_record(record, true)
    }

    fn render_record(&self, record: &ObjectRecord, export: bool) -> StoreResult<Value> {
        let relations = self.registry.relations_of(&record.kind);
        let no_migrate = self.registry.no_migrate_of(&record.kind);
        let mut out = Map::new();
        for (key, value) in &record.fields {
            if self.registry.is_secret(&record.kind, key) {
                continue;
            }
            if export && no_migrate.contains(&key.as_str()) {
                continue;
            }
            if export && value.is_null() {
                continue;
            }
            if let Some((_, relation)) = relations.iter().find(|(name, _)| *name == key.as_str()) {
                out.insert(key.clone(), self.relation_names(relation, value)?);
            } else {
                out.insert(key.clone(), value.clone());
            }
        }
        Ok(Value::Object(out))
    }

    fn relation_names(&self, relation: &RelationSpec, value: &Value) -> StoreResult<Value> {
        let name_of = |id: u64| -> StoreResult<Value> {
            let record = self.fetch(
                relation.kind,
                &Filter::by_id(id),
                &FetchContext::system(),
            )?;
            Ok(json!(record.name()))
        };
        match value {
            Value::Array(items) => {
                let names: StoreResult<Vec<Value>> = items
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(name_of)
                    .collect();
                Ok(Value::Array(names?))
            }
            Value::Number(n) => match n.as_u64() {
                Some(id) => name_of(id),
                None => Ok(Value::Null),
            },
            _ => Ok(Value::Null),
        }
    }

    /// Bulk export of one kind in migration form.
    pub fn export(&self, kind: &str) -> StoreResult<Vec<Value>> {
        let records = self.fetch_all(kind, &Filter::all(), &FetchContext::system())?;
        records
            .iter()
            .map(|record| self.export_record(record))
            .collect()
    }

    /// Copy an entity under a new name, everything but id and name carried
    /// over.
    pub fn duplicate(
        &self,
        kind: &str,
        id: u64,
        new_name: &str,
        ctx: &FetchContext,
    ) -> StoreResult<ObjectRecord> {
        let source = self.fetch(kind, &Filter::by_id(id), ctx)?;
        let mut fields = source.fields.clone();
        fields.remove("id");
        fields.insert("name".into(), json!(new_name));
        self.upsert(&source.kind, fields, &UpsertOptions::new().must_be_new(), ctx)
    }

    /// Read one secret back through the credential backend.
    pub fn secret(&self, kind: &str, name: &str, field: &str) -> StoreResult<Option<String>> {
        SecretField::new(kind, name, field)
            .resolve(self.secrets.as_ref())
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    /// Retention purge for result rows: runtime tokens are time-ordered, so
    /// a timestamp cutoff maps directly onto a token prefix comparison.
    pub fn purge_results_older_than(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> StoreResult<usize> {
        let boundary = format!("{}", cutoff.format("%Y%m%d%H%M%S%6f"));
        let results = self.fetch_all("result", &Filter::all(), &FetchContext::system())?;
        let mut purged = 0;
        for result in results {
            let stale = result
                .str_field("runtime")
                .map(|runtime| runtime < boundary.as_str())
                .unwrap_or(false);
            if stale {
                self.with_commit_retry(|| self.delete_record(&result))?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

fn parse_record(bytes: &[u8]) -> StoreResult<ObjectRecord> {
    let fields: Map<String, Value> = serde_json::from_slice(bytes)?;
    ObjectRecord::from_fields(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ObjectStore {
        ObjectStore::open_at(&dir.path().join("store.redb")).unwrap()
    }

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn upsert_then_fetch_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::system();

        store
            .upsert(
                "device",
                fields(&[
                    ("name", json!("edge-router-1")),
                    ("vendor", json!("juniper")),
                    ("model", json!("mx480")),
                ]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();

        let record = store
            .fetch("device", &Filter::by_name("edge-router-1"), &ctx)
            .unwrap();
        assert_eq!(record.str_field("vendor"), Some("juniper"));
        assert_eq!(record.str_field("model"), Some("mx480"));
        assert_eq!(record.kind, "device");
    }

    #[test]
    fn names_with_slashes_or_quotes_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::system();
        for bad in ["a/b", "a\\b", "a'b", "a\"b"] {
            let err = store
                .upsert(
                    "device",
                    fields(&[("name", json!(bad))]),
                    &UpsertOptions::new(),
                    &ctx,
                )
                .unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)), "{bad}");
        }
    }

    #[test]
    fn upsert_is_idempotent_on_identity() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::system();

        let first = store
            .upsert(
                "device",
                fields(&[("name", json!("core-1")), ("vendor", json!("cisco"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        store
            .upsert(
                "device",
                fields(&[("id", json!(first.id)), ("vendor", json!("arista"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();

        let all = store.fetch_all("device", &Filter::all(), &ctx).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].str_field("vendor"), Some("arista"));
    }

    #[test]
    fn upsert_by_name_updates_in_place() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::system();

        store
            .upsert(
                "device",
                fields(&[("name", json!("core-1")), ("vendor", json!("cisco"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        store
            .upsert(
                "device",
                fields(&[("name", json!("core-1")), ("vendor", json!("arista"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();

        let all = store.fetch_all("device", &Filter::all(), &ctx).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].str_field("vendor"), Some("arista"));
    }

    #[test]
    fn must_be_new_rejects_existing_name() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::system();

        store
            .upsert(
                "device",
                fields(&[("name", json!("core-1"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        let err = store
            .upsert(
                "device",
                fields(&[("name", json!("core-1"))]),
                &UpsertOptions::new().must_be_new(),
                &ctx,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[test]
    fn unknown_fields_are_skipped_and_booleans_coerced() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::system();

        let record = store
            .upsert(
                "user",
                fields(&[
                    ("name", json!("operator")),
                    ("is_admin", json!("false")),
                    ("no_such_field", json!("ignored")),
                ]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        assert_eq!(record.fields.get("is_admin"), Some(&json!(false)));
        assert!(!record.fields.contains_key("no_such_field"));
    }

    #[test]
    fn relations_resolve_names_to_ids() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::system();

        let device = store
            .upsert(
                "device",
                fields(&[("name", json!("core-1"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        let service = store
            .upsert(
                "service",
                fields(&[
                    ("name", json!("backup-config")),
                    ("target_devices", json!(["core-1"])),
                ]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        assert_eq!(service.id_list("target_devices"), vec![device.id]);
    }

    #[test]
    fn fetch_spans_the_service_subtype_family() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::system();

        store
            .upsert(
                "workflow",
                fields(&[("name", json!("provisioning"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();

        // Visible as a service, and as a workflow.
        assert!(store
            .fetch("service", &Filter::by_name("provisioning"), &ctx)
            .is_ok());
        assert!(store
            .fetch("workflow", &Filter::by_name("provisioning"), &ctx)
            .is_ok());

        // A plain service is not a workflow.
        store
            .upsert(
                "service",
                fields(&[("name", json!("ping"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        assert!(store
            .fetch("workflow", &Filter::by_name("ping"), &ctx)
            .is_err());
    }

    #[test]
    fn point_lookup_miss_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let err = store
            .fetch("device", &Filter::by_name("ghost"), &FetchContext::system())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(store
            .fetch_optional("device", &Filter::by_name("ghost"), &FetchContext::system())
            .unwrap()
            .is_none());
    }

    #[test]
    fn rbac_denies_without_visibility_and_admin_bypasses() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let system = FetchContext::system();

        store
            .upsert(
                "device",
                fields(&[("name", json!("core-1"))]),
                &UpsertOptions::new(),
                &system,
            )
            .unwrap();
        store
            .upsert(
                "group",
                fields(&[("name", json!("restricted"))]),
                &UpsertOptions::new(),
                &system,
            )
            .unwrap();
        store
            .upsert(
                "user",
                fields(&[("name", json!("operator")), ("group", json!("restricted"))]),
                &UpsertOptions::new(),
                &system,
            )
            .unwrap();

        let err = store
            .fetch(
                "device",
                &Filter::by_name("core-1"),
                &FetchContext::read("operator"),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::AccessDenied { .. }));

        // The seeded admin identity bypasses filtering entirely.
        assert!(store
            .fetch(
                "device",
                &Filter::by_name("core-1"),
                &FetchContext::read("admin"),
            )
            .is_ok());
    }

    #[test]
    fn rbac_grants_through_group_pools() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let system = FetchContext::system();

        let device = store
            .upsert(
                "device",
                fields(&[("name", json!("core-1"))]),
                &UpsertOptions::new(),
                &system,
            )
            .unwrap();
        store
            .upsert(
                "pool",
                fields(&[
                    ("name", json!("lab")),
                    ("manual", json!(true)),
                    ("devices", json!([device.id])),
                ]),
                &UpsertOptions::new(),
                &system,
            )
            .unwrap();
        store
            .upsert(
                "group",
                fields(&[("name", json!("operators")), ("read_pools", json!(["lab"]))]),
                &UpsertOptions::new(),
                &system,
            )
            .unwrap();
        store
            .upsert(
                "user",
                fields(&[("name", json!("operator")), ("group", json!("operators"))]),
                &UpsertOptions::new(),
                &system,
            )
            .unwrap();

        // Read granted through the pool, edit still denied.
        assert!(store
            .fetch(
                "device",
                &Filter::by_name("core-1"),
                &FetchContext::read("operator"),
            )
            .is_ok());
        let err = store
            .fetch(
                "device",
                &Filter::by_name("core-1"),
                &FetchContext::edit("operator"),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::AccessDenied { .. }));
    }

    #[test]
    fn dynamic_pool_membership_follows_candidate_state() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::system();

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

        // Create: matches, gains membership.
        let device = store
            .upsert(
                "device",
                fields(&[("name", json!("edge-1")), ("vendor", json!("juniper"))]),
                &UpsertOptions::new().update_pools(),
                &ctx,
            )
            .unwrap();
        let pool = store
            .fetch("pool", &Filter::by_name("juniper-fleet"), &ctx)
            .unwrap();
        assert_eq!(pool.id_list("devices"), vec![device.id]);

        // Update: predicate turns false, loses membership.
        store
            .upsert(
                "device",
                fields(&[("id", json!(device.id)), ("vendor", json!("cisco"))]),
                &UpsertOptions::new().update_pools(),
                &ctx,
            )
            .unwrap();
        let pool = store
            .fetch("pool", &Filter::by_name("juniper-fleet"), &ctx)
            .unwrap();
        assert!(pool.id_list("devices").is_empty());

        // Back in, then delete: membership is dropped with the record.
        store
            .upsert(
                "device",
                fields(&[("id", json!(device.id)), ("vendor", json!("juniper"))]),
                &UpsertOptions::new().update_pools(),
                &ctx,
            )
            .unwrap();
        store
            .remove("device", &Filter::by_id(device.id), false, &ctx)
            .unwrap();
        let pool = store
            .fetch("pool", &Filter::by_name("juniper-fleet"), &ctx)
            .unwrap();
        assert!(pool.id_list("devices").is_empty());
    }

    #[test]
    fn remove_returns_snapshot_and_honors_allow_none() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::system();

        store
            .upsert(
                "device",
                fields(&[("name", json!("core-1")), ("vendor", json!("cisco"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        let snapshot = store
            .remove("device", &Filter::by_name("core-1"), false, &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(snapshot["vendor"], json!("cisco"));

        assert!(store
            .remove("device", &Filter::by_name("core-1"), true, &ctx)
            .unwrap()
            .is_none());
        assert!(store
            .remove("device", &Filter::by_name("core-1"), false, &ctx)
            .is_err());
    }

    #[test]
    fn pool_referenced_by_group_cannot_be_deleted() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::system();

        store
            .upsert(
                "pool",
                fields(&[("name", json!("lab")), ("manual", json!(true))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        store
            .upsert(
                "group",
                fields(&[("name", json!("operators")), ("read_pools", json!(["lab"]))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();

        let err = store
            .remove("pool", &Filter::by_name("lab"), false, &ctx)
            .unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[test]
    fn secrets_are_diverted_and_never_fetched() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::system();

        store
            .upsert(
                "user",
                fields(&[("name", json!("operator")), ("password", json!("hunter2"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();

        let record = store
            .fetch("user", &Filter::by_name("operator"), &ctx)
            .unwrap();
        assert_eq!(record.str_field("password"), Some(""));
        assert_eq!(
            store.secret("user", "operator", "password").unwrap().unwrap(),
            "hunter2"
        );

        // Exports omit the secret field entirely.
        let exported = store.export("user").unwrap();
        for row in exported {
            assert!(row.get("password").is_none());
        }
    }

    #[test]
    fn export_encodes_relations_by_name_and_drops_ids() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::system();

        store
            .upsert(
                "device",
                fields(&[("name", json!("core-1"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        store
            .upsert(
                "service",
                fields(&[
                    ("name", json!("backup")),
                    ("target_devices", json!(["core-1"])),
                ]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();

        let exported = store.export("service").unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0]["target_devices"], json!(["core-1"]));
        assert!(exported[0].get("id").is_none());
    }

    #[test]
    fn duplicate_copies_everything_but_identity() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::system();

        let original = store
            .upsert(
                "service",
                fields(&[("name", json!("backup")), ("description", json!("nightly"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        let copy = store
            .duplicate("service", original.id, "backup-copy", &ctx)
            .unwrap();
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.str_field("description"), Some("nightly"));
        assert_eq!(copy.name(), "backup-copy");
    }

    #[test]
    fn racing_upserts_of_one_new_name_never_duplicate() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir));

        let handles: Vec<_> = (0..2)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.upsert(
                        "device",
                        fields(&[("name", json!("core-1")), ("vendor", json!(format!("v{worker}")))]),
                        &UpsertOptions::new(),
                        &FetchContext::system(),
                    )
                })
            })
            .collect();

        let mut integrity_failures = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(_) => {}
                Err(StoreError::Integrity(_)) => integrity_failures += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        // One caller created the row; the other either updated it in place
        // or observed the uniqueness failure. Never two rows.
        let all = store
            .fetch_all("device", &Filter::all(), &FetchContext::system())
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(integrity_failures <= 1);
    }

    #[test]
    fn mutations_are_change_logged() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let ctx = FetchContext::edit("admin");

        store
            .upsert(
                "device",
                fields(&[("name", json!("core-1")), ("vendor", json!("cisco"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();
        store
            .upsert(
                "device",
                fields(&[("name", json!("core-1")), ("vendor", json!("arista"))]),
                &UpsertOptions::new(),
                &ctx,
            )
            .unwrap();

        let entries = store.change_log().entries().unwrap();
        let update = entries
            .iter()
            .find(|entry| entry.field == "vendor")
            .expect("vendor change recorded");
        assert_eq!(update.old, json!("cisco"));
        assert_eq!(update.new, json!("arista"));
        assert_eq!(update.actor, "admin");
    }
}
