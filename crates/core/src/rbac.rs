use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::types::{GroupView, ObjectRecord, PoolView};

/// Operation mode an access check is performed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Edit,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::Read => write!(f, "read"),
            AccessMode::Edit => write!(f, "edit"),
        }
    }
}

/// Identity attached to a store call. `system()` is the internal,
/// unfiltered caller (engine, scheduler, migration); named contexts are
/// narrowed by the access filter unless the user is an admin.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub identity: Option<String>,
    pub mode: AccessMode,
}

impl FetchContext {
    pub fn system() -> Self {
        Self {
            identity: None,
            mode: AccessMode::Read,
        }
    }

    pub fn read(user: impl Into<String>) -> Self {
        Self {
            identity: Some(user.into()),
            mode: AccessMode::Read,
        }
    }

    pub fn edit(user: impl Into<String>) -> Self {
        Self {
            identity: Some(user.into()),
            mode: AccessMode::Edit,
        }
    }

    pub fn with_mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    /// Actor name recorded on change records.
    pub fn actor(&self) -> &str {
        self.identity.as_deref().unwrap_or("system")
    }
}

/// Result of narrowing a query for one identity and mode. The scope is
/// computed once per query and applied during the scan, so pagination and
/// counts stay correct (a pushed-down filter, not a post-filter).
#[derive(Debug, Clone)]
pub enum AccessScope {
    Unrestricted,
    /// Visible entity ids for the queried base kind: the union of the
    /// members of the group's pools for the mode.
    Members(HashSet<u64>),
}

impl AccessScope {
    /// Build the scope for `base_kind` from the group's pools for `mode`.
    pub fn for_group(group: &GroupView, pools: &[PoolView], mode: AccessMode, base_kind: &str) -> Self {
        let granted: HashSet<u64> = match mode {
            AccessMode::Read => group.read_pools.iter().copied().collect(),
            AccessMode::Edit => group.edit_pools.iter().copied().collect(),
        };
        let members = pools
            .iter()
            .filter(|pool| granted.contains(&pool.id))
            .flat_map(|pool| pool.members(base_kind).iter().copied())
            .collect();
        AccessScope::Members(members)
    }

    pub fn permits(&self, record: &ObjectRecord) -> bool {
        match self {
            AccessScope::Unrestricted => true,
            AccessScope::Members(ids) => ids.contains(&record.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn record(id: u64) -> ObjectRecord {
        let mut fields = Map::new();
        fields.insert("id".into(), json!(id));
        fields.insert("type".into(), json!("device"));
        fields.insert("name".into(), json!(format!("device-{id}")));
        ObjectRecord::from_fields(fields).unwrap()
    }

    fn pool(id: u64, devices: Vec<u64>) -> PoolView {
        PoolView {
            id,
            name: format!("pool-{id}"),
            manual: true,
            devices,
            services: vec![],
            predicate: vec![],
        }
    }

    #[test]
    fn scope_is_the_union_of_granted_pool_members() {
        let group = GroupView {
            id: 1,
            name: "operators".into(),
            read_pools: vec![10, 11],
            edit_pools: vec![10],
            endpoints: vec![],
        };
        let pools = vec![pool(10, vec![1, 2]), pool(11, vec![3]), pool(12, vec![4])];

        let read = AccessScope::for_group(&group, &pools, AccessMode::Read, "device");
        assert!(read.permits(&record(1)));
        assert!(read.permits(&record(3)));
        assert!(!read.permits(&record(4)));

        let edit = AccessScope::for_group(&group, &pools, AccessMode::Edit, "device");
        assert!(edit.permits(&record(2)));
        assert!(!edit.permits(&record(3)));
    }

    #[test]
    fn empty_grant_set_permits_nothing() {
        let group = GroupView {
            id: 1,
            name: "restricted".into(),
            read_pools: vec![],
            edit_pools: vec![],
            endpoints: vec![],
        };
        let scope = AccessScope::for_group(&group, &[pool(10, vec![1])], AccessMode::Read, "device");
        assert!(!scope.permits(&record(1)));
    }
}
