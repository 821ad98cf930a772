//! Pluggable Validators
//!
//! Business rules live behind two capabilities: [`ShardValidator`] (one shard in,
//! findings out) and [`DatasetValidator`] (the merged dataset in, findings out).
//! Profiles name the validators they run; names are resolved against a
//! [`ValidatorRegistry`] when the pipeline is built, so a typo in a profile fails
//! at startup instead of on the first submission.

use crate::config::ProfileSettings;
use crate::dispatch::types::ValidationRun;
use crate::ids::types::{ShardIds, is_ignorable};
use crate::report::types::{Finding, Location, ValidationReport, rules};

use anyhow::Result;
use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// What a shard validator gets to look at.
pub struct ShardContext<'a> {
    pub run: &'a ValidationRun,
    pub shard_name: &'a str,
    pub content: &'a [u8],
    /// Empty during the schema stage.
    pub ids: &'a ShardIds,
    pub common: bool,
}

#[async_trait]
pub trait ShardValidator: Send + Sync {
    fn name(&self) -> &str;

    /// An `Err` is contained by the caller and reported as a `SYSTEM_ERROR` finding.
    async fn validate(&self, shard: &ShardContext<'_>) -> Result<Vec<Finding>>;
}

pub struct DatasetContext<'a> {
    pub run: &'a ValidationRun,
    /// Every shard the archive was split into.
    pub expected_shards: &'a [String],
    /// Shards whose report made it into the merged report.
    pub reported_shards: &'a [String],
    /// The reports barrier completed on its timeout.
    pub timed_out: bool,
    pub report: &'a ValidationReport,
}

#[async_trait]
pub trait DatasetValidator: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, dataset: &DatasetContext<'_>) -> Result<Vec<Finding>>;
}

/// Checks that the shard parses as XML with exactly one root element.
pub struct WellFormedXml;

#[async_trait]
impl ShardValidator for WellFormedXml {
    fn name(&self) -> &str {
        "well-formed-xml"
    }

    async fn validate(&self, shard: &ShardContext<'_>) -> Result<Vec<Finding>> {
        Ok(check_well_formed(shard.shard_name, shard.content)
            .into_iter()
            .collect())
    }
}

fn check_well_formed(shard_name: &str, content: &[u8]) -> Option<Finding> {
    let mut reader = Reader::from_reader(content);
    let mut depth = 0usize;
    let mut roots = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => {
                if depth == 0 {
                    roots += 1;
                }
                depth += 1;
            }
            Ok(Event::Empty(_)) => {
                if depth == 0 {
                    roots += 1;
                }
            }
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                let offset = reader.error_position() as usize;
                return Some(malformed(shard_name, Some(offset), content, e.to_string()));
            }
        }
    }

    if depth > 0 {
        return Some(malformed(
            shard_name,
            None,
            content,
            format!("unexpected end of document, {} elements left open", depth),
        ));
    }
    if roots != 1 {
        return Some(malformed(
            shard_name,
            None,
            content,
            format!("expected exactly one root element, found {}", roots),
        ));
    }
    None
}

fn malformed(shard_name: &str, offset: Option<usize>, content: &[u8], reason: String) -> Finding {
    let mut location = Location::in_file(shard_name);
    if let Some(offset) = offset {
        let before = &content[..offset.min(content.len())];
        let line = before.iter().filter(|byte| **byte == b'\n').count();
        let line_start = before
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map(|index| index + 1)
            .unwrap_or(0);
        location.line_number = Some(line as u64 + 1);
        location.column_number = Some((before.len() - line_start) as u64 + 1);
    }

    Finding::error(
        rules::MALFORMED_XML,
        format!("{} is not well-formed XML: {}", shard_name, reason),
    )
    .at(location)
}

/// Warns about definitions that do not declare a version.
pub struct VersionedDefinitions;

#[async_trait]
impl ShardValidator for VersionedDefinitions {
    fn name(&self) -> &str {
        "versioned-definitions"
    }

    async fn validate(&self, shard: &ShardContext<'_>) -> Result<Vec<Finding>> {
        let mut unversioned: Vec<_> = shard
            .ids
            .local_ids
            .iter()
            .filter(|id| id.version.is_none() && !is_ignorable(&id.element_name))
            .collect();
        unversioned.sort_by_key(|id| (id.line, id.column));

        Ok(unversioned
            .into_iter()
            .map(|id| {
                Finding::warning(
                    rules::MISSING_VERSION,
                    format!("{} {} has no version", id.element_name, id.id),
                )
                .at(Location::at(shard.shard_name, id.line, id.column, &id.id))
            })
            .collect())
    }
}

/// Reports every shard that never delivered a report, typically after the
/// reports barrier timed out.
pub struct MissingShardReports;

#[async_trait]
impl DatasetValidator for MissingShardReports {
    fn name(&self) -> &str {
        "missing-shard-reports"
    }

    async fn validate(&self, dataset: &DatasetContext<'_>) -> Result<Vec<Finding>> {
        let reported: BTreeSet<&str> = dataset
            .reported_shards
            .iter()
            .map(String::as_str)
            .collect();

        Ok(dataset
            .expected_shards
            .iter()
            .filter(|shard| !reported.contains(shard.as_str()))
            .map(|shard| {
                let reason = if dataset.timed_out {
                    "validation timed out"
                } else {
                    "report missing"
                };
                Finding::error(
                    rules::MISSING_SHARD_REPORT,
                    format!("{} was not validated ({})", shard, reason),
                )
                .at(Location::in_file(shard))
            })
            .collect())
    }
}

/// Name to implementation lookup for every validator a profile may use.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    shard: HashMap<String, Arc<dyn ShardValidator>>,
    dataset: HashMap<String, Arc<dyn DatasetValidator>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self::new()
            .with_shard_validator(Arc::new(WellFormedXml))
            .with_shard_validator(Arc::new(VersionedDefinitions))
            .with_dataset_validator(Arc::new(MissingShardReports))
    }

    pub fn with_shard_validator(mut self, validator: Arc<dyn ShardValidator>) -> Self {
        self.shard.insert(validator.name().to_string(), validator);
        self
    }

    pub fn with_dataset_validator(mut self, validator: Arc<dyn DatasetValidator>) -> Self {
        self.dataset.insert(validator.name().to_string(), validator);
        self
    }

    pub fn shard_validators(&self, names: &[String]) -> Result<Vec<Arc<dyn ShardValidator>>> {
        names
            .iter()
            .map(|name| {
                self.shard
                    .get(name)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("Unknown shard validator: {}", name))
            })
            .collect()
    }

    pub fn dataset_validators(&self, names: &[String]) -> Result<Vec<Arc<dyn DatasetValidator>>> {
        names
            .iter()
            .map(|name| {
                self.dataset
                    .get(name)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("Unknown dataset validator: {}", name))
            })
            .collect()
    }

    /// Fails when the profile names a validator this registry does not know.
    pub fn check_profile(&self, profile: &ProfileSettings) -> Result<()> {
        self.shard_validators(&profile.schema_validators)?;
        self.shard_validators(&profile.rule_validators)?;
        self.dataset_validators(&profile.dataset_validators)?;
        Ok(())
    }
}
