use serde_json::Value;
use std::collections::HashMap;

use crate::error::{StoreError, StoreResult};

/// Scalar field classification used for upsert coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Integer,
    Float,
    String,
    Json,
    List,
}

/// A relation field: the referenced kind and whether the field holds a
/// list of references or a single one.
#[derive(Debug, Clone, Copy)]
pub struct RelationSpec {
    pub kind: &'static str,
    pub list: bool,
}

/// Static description of one entity kind. Subtypes name their base kind
/// and inherit its fields and relations.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub kind: &'static str,
    pub base: &'static str,
    pub fields: &'static [(&'static str, FieldKind)],
    pub relations: &'static [(&'static str, RelationSpec)],
    pub no_migrate: &'static [&'static str],
    pub secret_fields: &'static [&'static str],
    /// Candidate for dynamic pool membership.
    pub pool_member: bool,
    /// Narrowed by the access filter for non-admin identities.
    pub rbac_scoped: bool,
    /// Mutations appear in the change log.
    pub log_changes: bool,
}

/// Schema registry constructed once at process start. No kind is
/// registered anywhere else; adding an entity type means adding a
/// descriptor here.
#[derive(Debug)]
pub struct SchemaRegistry {
    descriptors: HashMap<&'static str, TypeDescriptor>,
}

const COMMON_NO_MIGRATE: &[&str] = &["id"];

impl SchemaRegistry {
    pub fn bootstrap() -> Self {
        let mut descriptors = HashMap::new();
        for descriptor in [
            TypeDescriptor {
                kind: "device",
                base: "device",
                fields: &[
                    ("name", FieldKind::String),
                    ("vendor", FieldKind::String),
                    ("model", FieldKind::String),
                    ("ip_address", FieldKind::String),
                    ("operating_system", FieldKind::String),
                    ("password", FieldKind::String),
                ],
                relations: &[],
                no_migrate: COMMON_NO_MIGRATE,
                secret_fields: &["password"],
                pool_member: true,
                rbac_scoped: true,
                log_changes: true,
            },
            TypeDescriptor {
                kind: "pool",
                base: "pool",
                fields: &[
                    ("name", FieldKind::String),
                    ("description", FieldKind::String),
                    ("manual", FieldKind::Bool),
                    ("predicate", FieldKind::Json),
                ],
                relations: &[
                    ("devices", RelationSpec { kind: "device", list: true }),
                    ("services", RelationSpec { kind: "service", list: true }),
                ],
                no_migrate: COMMON_NO_MIGRATE,
                secret_fields: &[],
                pool_member: false,
                rbac_scoped: false,
                log_changes: true,
            },
            TypeDescriptor {
                kind: "service",
                base: "service",
                fields: &[
                    ("name", FieldKind::String),
                    ("scoped_name", FieldKind::String),
                    ("description", FieldKind::String),
                    ("payload", FieldKind::Json),
                ],
                relations: &[
                    ("target_devices", RelationSpec { kind: "device", list: true }),
                    ("target_pools", RelationSpec { kind: "pool", list: true }),
                ],
                no_migrate: COMMON_NO_MIGRATE,
                secret_fields: &[],
                pool_member: true,
                rbac_scoped: true,
                log_changes: true,
            },
            TypeDescriptor {
                kind: "workflow",
                base: "service",
                fields: &[],
                relations: &[
                    ("services", RelationSpec { kind: "service", list: true }),
                    ("start_service", RelationSpec { kind: "service", list: false }),
                ],
                no_migrate: COMMON_NO_MIGRATE,
                secret_fields: &[],
                pool_member: true,
                rbac_scoped: true,
                log_changes: true,
            },
            TypeDescriptor {
                kind: "workflow_edge",
                base: "workflow_edge",
                fields: &[
                    ("name", FieldKind::String),
                    ("outcome", FieldKind::String),
                ],
                relations: &[
                    ("source", RelationSpec { kind: "service", list: false }),
                    ("destination", RelationSpec { kind: "service", list: false }),
                    ("workflow", RelationSpec { kind: "workflow", list: false }),
                ],
                no_migrate: COMMON_NO_MIGRATE,
                secret_fields: &[],
                pool_member: false,
                rbac_scoped: false,
                log_changes: true,
            },
            TypeDescriptor {
                kind: "run",
                base: "run",
                fields: &[
                    ("name", FieldKind::String),
                    ("status", FieldKind::String),
                    ("parent_runtime", FieldKind::String),
                    ("fault", FieldKind::String),
                    ("targets", FieldKind::List),
                ],
                relations: &[("service", RelationSpec { kind: "service", list: false })],
                no_migrate: &["id", "name", "status", "parent_runtime", "fault", "targets"],
                secret_fields: &[],
                pool_member: false,
                rbac_scoped: false,
                log_changes: false,
            },
            TypeDescriptor {
                kind: "result",
                base: "result",
                fields: &[
                    ("name", FieldKind::String),
                    ("runtime", FieldKind::String),
                    ("success", FieldKind::Bool),
                    ("output", FieldKind::Json),
                ],
                relations: &[
                    ("service", RelationSpec { kind: "service", list: false }),
                    ("device", RelationSpec { kind: "device", list: false }),
                ],
                no_migrate: &["id", "name", "runtime", "success", "output"],
                secret_fields: &[],
                pool_member: false,
                rbac_scoped: false,
                log_changes: false,
            },
            TypeDescriptor {
                kind: "user",
                base: "user",
                fields: &[
                    ("name", FieldKind::String),
                    ("email", FieldKind::String),
                    ("is_admin", FieldKind::Bool),
                    ("password", FieldKind::String),
                ],
                relations: &[("group", RelationSpec { kind: "group", list: false })],
                no_migrate: COMMON_NO_MIGRATE,
                secret_fields: &["password"],
                pool_member: false,
                rbac_scoped: false,
                log_changes: true,
            },
            TypeDescriptor {
                kind: "group",
                base: "group",
                fields: &[
                    ("name", FieldKind::String),
                    ("description", FieldKind::String),
                    ("endpoints", FieldKind::List),
                ],
                relations: &[
                    ("read_pools", RelationSpec { kind: "pool", list: true }),
                    ("edit_pools", RelationSpec { kind: "pool", list: true }),
                ],
                no_migrate: COMMON_NO_MIGRATE,
                secret_fields: &[],
                pool_member: false,
                rbac_scoped: false,
                log_changes: true,
            },
            TypeDescriptor {
                kind: "server",
                base: "server",
                fields: &[
                    ("name", FieldKind::String),
                    ("ip_address", FieldKind::String),
                    ("cluster_id", FieldKind::String),
                    ("status", FieldKind::String),
                    ("last_heartbeat", FieldKind::String),
                ],
                relations: &[],
                no_migrate: &["id", "status", "last_heartbeat"],
                secret_fields: &[],
                pool_member: false,
                rbac_scoped: false,
                log_changes: false,
            },
        ] {
            descriptors.insert(descriptor.kind, descriptor);
        }
        Self { descriptors }
    }

    pub fn descriptor(&self, kind: &str) -> StoreResult<&TypeDescriptor> {
        self.descriptors
            .get(kind)
            .ok_or_else(|| StoreError::Backend(format!("unknown entity kind '{kind}'")))
    }

    /// The table a kind's records live in: its base kind. Name uniqueness
    /// spans the base kind, so a workflow and a plain service cannot share
    /// a name.
    pub fn storage_kind(&self, kind: &str) -> StoreResult<&'static str> {
        Ok(self.descriptor(kind)?.base)
    }

    /// Whether a stored record of `record_kind` satisfies a query for
    /// `requested`: the same kind, or `requested` is its base.
    pub fn is_instance(&self, record_kind: &str, requested: &str) -> bool {
        if record_kind == requested {
            return true;
        }
        self.descriptors
            .get(record_kind)
            .map(|d| d.base == requested && d.base != d.kind)
            .unwrap_or(false)
    }

    /// Scalar field lookup, walking the base chain for subtypes.
    pub fn field_kind(&self, kind: &str, field: &str) -> Option<FieldKind> {
        let descriptor = self.descriptors.get(kind)?;
        if let Some((_, fk)) = descriptor.fields.iter().find(|(name, _)| *name == field) {
            return Some(*fk);
        }
        if descriptor.base != descriptor.kind {
            return self.field_kind(descriptor.base, field);
        }
        None
    }

    /// Relation field lookup, walking the base chain for subtypes.
    pub fn relation(&self, kind: &str, field: &str) -> Option<RelationSpec> {
        let descriptor = self.descriptors.get(kind)?;
        if let Some((_, spec)) = descriptor.relations.iter().find(|(name, _)| *name == field) {
            return Some(*spec);
        }
        if descriptor.base != descriptor.kind {
            return self.relation(descriptor.base, field);
        }
        None
    }

    pub fn is_secret(&self, kind: &str, field: &str) -> bool {
        let Some(descriptor) = self.descriptors.get(kind) else {
            return false;
        };
        if descriptor.secret_fields.contains(&field) {
            return true;
        }
        descriptor.base != descriptor.kind && self.is_secret(descriptor.base, field)
    }

    /// All relation fields of a kind, base chain included.
    pub fn relations_of(&self, kind: &str) -> Vec<(&'static str, RelationSpec)> {
        let mut out = Vec::new();
        let mut current = kind;
        while let Some(descriptor) = self.descriptors.get(current) {
            out.extend(descriptor.relations.iter().copied());
            if descriptor.base == descriptor.kind {
                break;
            }
            current = descriptor.base;
        }
        out
    }

    /// Non-migratable fields of a kind, base chain included.
    pub fn no_migrate_of(&self, kind: &str) -> Vec<&'static str> {
        let mut out = Vec::new();
        let mut current = kind;
        while let Some(descriptor) = self.descriptors.get(current) {
            for field in descriptor.no_migrate {
                if !out.contains(field) {
                    out.push(*field);
                }
            }
            if descriptor.base == descriptor.kind {
                break;
            }
            current = descriptor.base;
        }
        out
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.descriptors.keys().copied()
    }

    /// Pool membership field holding candidates of `base_kind`.
    pub fn pool_member_field(base_kind: &str) -> Option<&'static str> {
        match base_kind {
            "device" => Some("devices"),
            "service" => Some("services"),
            _ => None,
        }
    }
}

/// Coerce a scalar value into the declared field kind. Boolean fields
/// accept falsy-string forms; numeric fields accept numeric strings.
pub fn coerce_scalar(kind: FieldKind, value: Value) -> StoreResult<Value> {
    match kind {
        FieldKind::Bool => Ok(Value::Bool(match value {
            Value::Bool(b) => b,
            Value::Null => false,
            Value::String(s) => s != "false",
            _ => true,
        })),
        FieldKind::Integer => match value {
            Value::Number(_) | Value::Null => Ok(value),
            Value::String(s) => s
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| StoreError::Validation(format!("'{s}' is not an integer"))),
            other => Err(StoreError::Validation(format!(
                "expected an integer, got {other}"
            ))),
        },
        FieldKind::Float => match value {
            Value::Number(_) | Value::Null => Ok(value),
            Value::String(s) => s
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| StoreError::Validation(format!("'{s}' is not a number"))),
            other => Err(StoreError::Validation(format!(
                "expected a number, got {other}"
            ))),
        },
        FieldKind::String => Ok(match value {
            Value::String(_) | Value::Null => value,
            other => Value::String(other.to_string()),
        }),
        FieldKind::Json | FieldKind::List => Ok(value),
    }
}
