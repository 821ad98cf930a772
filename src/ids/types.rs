use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// Container elements whose ids legitimately repeat across shards.
pub const IGNORABLE_ELEMENTS: [&str; 13] = [
    "ResourceFrame",
    "SiteFrame",
    "CompositeFrame",
    "TimetableFrame",
    "ServiceFrame",
    "ServiceCalendarFrame",
    "VehicleScheduleFrame",
    "Block",
    "RoutePoint",
    "PointProjection",
    "ScheduledStopPoint",
    "PassengerStopAssignment",
    "NoticeAssignment",
];

pub fn is_ignorable(element_name: &str) -> bool {
    IGNORABLE_ELEMENTS.contains(&element_name)
}

/// An id or reference occurrence in a shard.
///
/// Identity is `(id, version)` only: the same id at two locations is one value,
/// the same id with two versions is two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdVersion {
    pub id: String,
    pub version: Option<String>,
    pub element_name: String,
    /// Ancestors from the document root down to the direct parent.
    pub parent_element_names: Vec<String>,
    pub shard_name: String,
    pub line: u64,
    pub column: u64,
}

impl IdVersion {
    pub fn new(id: &str, version: Option<&str>, element_name: &str) -> Self {
        Self {
            id: id.to_string(),
            version: version.map(str::to_string),
            element_name: element_name.to_string(),
            parent_element_names: Vec::new(),
            shard_name: String::new(),
            line: 0,
            column: 0,
        }
    }

    pub fn with_parents(mut self, parents: &[&str]) -> Self {
        self.parent_element_names = parents.iter().map(|name| name.to_string()).collect();
        self
    }

    pub fn in_shard(mut self, shard_name: &str, line: u64, column: u64) -> Self {
        self.shard_name = shard_name.to_string();
        self.line = line;
        self.column = column;
        self
    }

    pub fn has_parent(&self, element_name: &str) -> bool {
        self.parent_element_names
            .iter()
            .any(|parent| parent == element_name)
    }
}

impl PartialEq for IdVersion {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.version == other.version
    }
}

impl Eq for IdVersion {}

impl Hash for IdVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.version.hash(state);
    }
}

/// Definitions and references found in one shard.
#[derive(Debug, Clone, Default)]
pub struct ShardIds {
    pub local_ids: HashSet<IdVersion>,
    /// In document order; the same reference may appear many times.
    pub local_refs: Vec<IdVersion>,
}

impl ShardIds {
    /// Bare ids of every definition, versions ignored.
    pub fn bare_ids(&self) -> HashSet<String> {
        self.local_ids.iter().map(|id| id.id.clone()).collect()
    }
}
