use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// Globally unique, time-ordered runtime token identifying one Run.
///
/// Lexicographic order matches chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Runtime(pub String);

impl Runtime {
    pub fn generate() -> Self {
        let stamp = Utc::now().format("%Y%m%d%H%M%S%6f");
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{stamp}-{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
    Partial,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Outcome label on a workflow edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Success,
    Failure,
    Always,
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EdgeKind::Success => "success",
            EdgeKind::Failure => "failure",
            EdgeKind::Always => "always",
        };
        write!(f, "{label}")
    }
}

/// One persisted entity: a stable identity, a concrete subtype
/// discriminator, and a JSON field map. `fields` always carries `id`,
/// `type` and `name` alongside the kind-specific properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: u64,
    pub kind: String,
    pub fields: Map<String, Value>,
}

impl ObjectRecord {
    pub fn from_fields(fields: Map<String, Value>) -> StoreResult<Self> {
        let id = fields
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| StoreError::Backend("record is missing an id".into()))?;
        let kind = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Backend(format!("record {id} is missing a type")))?
            .to_string();
        Ok(Self { id, kind, fields })
    }

    pub fn name(&self) -> &str {
        self.fields
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn bool_field(&self, key: &str) -> bool {
        self.fields
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn id_field(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    /// Relation list field as entity ids; absent or malformed entries are
    /// dropped.
    pub fn id_list(&self, key: &str) -> Vec<u64> {
        self.fields
            .get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default()
    }

    /// Deserialize the field map into a typed view.
    pub fn view<T: serde::de::DeserializeOwned>(&self) -> StoreResult<T> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|err| {
            StoreError::Corrupt {
                kind: self.kind.clone(),
                id: self.id,
                reason: err.to_string(),
            }
        })
    }
}

/// A network target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceView {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub operating_system: String,
}

/// Comparison operator of a pool field matcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOp {
    Equals,
    Contains,
}

/// One clause of a dynamic pool predicate; clauses are ANDed together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMatcher {
    pub field: String,
    pub op: MatchOp,
    pub value: String,
    #[serde(default)]
    pub invert: bool,
}

impl FieldMatcher {
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        let actual = match fields.get(&self.field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let hit = match self.op {
            MatchOp::Equals => actual == self.value,
            MatchOp::Contains => actual.contains(&self.value),
        };
        hit != self.invert
    }
}

/// Named group of targets, manually curated or predicate-driven
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolView {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub devices: Vec<u64>,
    #[serde(default)]
    pub services: Vec<u64>,
    #[serde(default)]
    pub predicate: Vec<FieldMatcher>,
}

impl PoolView {
    /// Evaluate the predicate against a candidate's latest field state.
    /// Manual pools never match dynamically; an empty predicate matches
    /// nothing.
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        !self.manual
            && !self.predicate.is_empty()
            && self.predicate.iter().all(|m| m.matches(fields))
    }

    pub fn members(&self, base_kind: &str) -> &[u64] {
        match base_kind {
            "device" => &self.devices,
            "service" => &self.services,
            _ => &[],
        }
    }
}

/// An executable unit; base case of the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceView {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target_devices: Vec<u64>,
    #[serde(default)]
    pub target_pools: Vec<u64>,
    #[serde(default)]
    pub payload: Value,
}

impl ServiceView {
    pub fn is_workflow(&self) -> bool {
        self.kind == "workflow"
    }

    /// Whether targets are inherited from the caller rather than bound on
    /// the service itself.
    pub fn inherits_targets(&self) -> bool {
        self.target_devices.is_empty() && self.target_pools.is_empty()
    }
}

/// Composite service: a directed graph of services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowView {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub services: Vec<u64>,
    #[serde(default)]
    pub start_service: Option<u64>,
}

/// Directed, outcome-labelled connection between two services of one
/// workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeView {
    pub id: u64,
    pub name: String,
    pub source: u64,
    pub destination: u64,
    pub workflow: u64,
    pub outcome: EdgeKind,
}

/// One execution instance of a service or workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunView {
    pub id: u64,
    pub name: String,
    pub service: u64,
    pub status: RunStatus,
    #[serde(default)]
    pub targets: Vec<u64>,
    #[serde(default)]
    pub parent_runtime: Option<String>,
    #[serde(default)]
    pub fault: Option<String>,
}

impl RunView {
    /// The run's name is its runtime token.
    pub fn runtime(&self) -> Runtime {
        Runtime(self.name.clone())
    }
}

/// Per-target, per-node outcome record belonging to a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultView {
    pub id: u64,
    pub name: String,
    pub runtime: String,
    pub service: u64,
    #[serde(default)]
    pub device: Option<u64>,
    pub success: bool,
    #[serde(default)]
    pub output: Value,
}

/// Requesting principal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserView {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub group: Option<u64>,
    #[serde(default)]
    pub is_admin: bool,
}

/// Visibility grant set for its member users
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupView {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub read_pools: Vec<u64>,
    #[serde(default)]
    pub edit_pools: Vec<u64>,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Worker process participating in the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerView {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Minimal liveness document exposed for cluster-membership scanning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub name: String,
    pub cluster_id: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn runtime_tokens_are_time_ordered() {
        let first = Runtime::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = Runtime::generate();
        assert!(first < second);
        assert_ne!(first, second);
    }

    #[test]
    fn record_round_trip_through_view() {
        let mut fields = Map::new();
        fields.insert("id".into(), json!(7));
        fields.insert("type".into(), json!("device"));
        fields.insert("name".into(), json!("edge-router-1"));
        fields.insert("vendor".into(), json!("juniper"));
        let record = ObjectRecord::from_fields(fields).unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.kind, "device");
        assert_eq!(record.name(), "edge-router-1");

        let view: DeviceView = record.view().unwrap();
        assert_eq!(view.vendor, "juniper");
        assert_eq!(view.model, "");
    }

    #[test]
    fn field_matcher_respects_invert() {
        let mut fields = Map::new();
        fields.insert("model".into(), json!("mx480"));

        let matcher = FieldMatcher {
            field: "model".into(),
            op: MatchOp::Contains,
            value: "mx".into(),
            invert: false,
        };
        assert!(matcher.matches(&fields));

        let inverted = FieldMatcher {
            invert: true,
            ..matcher
        };
        assert!(!inverted.matches(&fields));
    }

    #[test]
    fn manual_pool_never_matches() {
        let pool = PoolView {
            id: 1,
            name: "static".into(),
            manual: true,
            devices: vec![],
            services: vec![],
            predicate: vec![FieldMatcher {
                field: "vendor".into(),
                op: MatchOp::Equals,
                value: "cisco".into(),
                invert: false,
            }],
        };
        let mut fields = Map::new();
        fields.insert("vendor".into(), json!("cisco"));
        assert!(!pool.matches(&fields));
    }
}
