use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rule codes raised by the pipeline itself rather than by a business validator.
pub mod rules {
    pub const DUPLICATE_ID: &str = "NETEX_ID_1";
    pub const UNRESOLVED_REFERENCE: &str = "NETEX_ID_5";
    pub const SYSTEM_ERROR: &str = "SYSTEM_ERROR";
    pub const DATASET_NOT_FOUND: &str = "DATASET_NOT_FOUND";
    pub const MALFORMED_XML: &str = "NETEX_SCHEMA";
    pub const MISSING_VERSION: &str = "NETEX_VERSION_1";
    pub const MISSING_SHARD_REPORT: &str = "MISSING_SHARD_REPORT";
    pub const EMPTY_DATASET: &str = "DATASET_EMPTY";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub file_name: Option<String>,
    pub line_number: Option<u64>,
    pub column_number: Option<u64>,
    pub element_id: Option<String>,
}

impl Location {
    pub fn in_file(file_name: &str) -> Self {
        Self {
            file_name: Some(file_name.to_string()),
            ..Self::default()
        }
    }

    pub fn at(file_name: &str, line: u64, column: u64, element_id: &str) -> Self {
        Self {
            file_name: Some(file_name.to_string()),
            line_number: Some(line),
            column_number: Some(column),
            element_id: Some(element_id.to_string()),
        }
    }
}

/// One reported validation outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub message: String,
    pub rule_code: String,
    pub severity: Severity,
    #[serde(default)]
    pub location: Location,
}

impl Finding {
    pub fn new(rule_code: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            rule_code: rule_code.to_string(),
            severity,
            location: Location::default(),
        }
    }

    pub fn error(rule_code: &str, message: impl Into<String>) -> Self {
        Self::new(rule_code, Severity::Error, message)
    }

    pub fn warning(rule_code: &str, message: impl Into<String>) -> Self {
        Self::new(rule_code, Severity::Warning, message)
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = location;
        self
    }
}

/// Findings for one shard, or for a whole dataset once merged.
///
/// `entries_per_rule` counts every finding ever raised per rule code, including
/// the ones later dropped by truncation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub codespace: String,
    pub run_id: String,
    pub creation_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: Vec<Finding>,
    #[serde(default)]
    pub entries_per_rule: BTreeMap<String, u64>,
}

impl ValidationReport {
    /// A report stamped with the current time.
    pub fn new(codespace: &str, run_id: &str) -> Self {
        Self {
            creation_date: Some(Utc::now()),
            ..Self::empty(codespace, run_id)
        }
    }

    /// A report without a creation date, used as the seed of a merge.
    pub fn empty(codespace: &str, run_id: &str) -> Self {
        Self {
            codespace: codespace.to_string(),
            run_id: run_id.to_string(),
            creation_date: None,
            entries: Vec::new(),
            entries_per_rule: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, finding: Finding) {
        *self
            .entries_per_rule
            .entry(finding.rule_code.clone())
            .or_insert(0) += 1;
        self.entries.push(finding);
    }

    pub fn add_all(&mut self, findings: impl IntoIterator<Item = Finding>) {
        for finding in findings {
            self.add(finding);
        }
    }

    pub fn has_error(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.severity == Severity::Error)
    }

    pub fn count_for(&self, rule_code: &str) -> u64 {
        self.entries_per_rule.get(rule_code).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
