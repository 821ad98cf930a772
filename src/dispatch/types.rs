use crate::error::{JobError, JobResult};
use crate::queue::types::{Envelope, Topic};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const HEADER_JOB_TYPE: &str = "jobType";
pub const HEADER_RUN_ID: &str = "runId";
pub const HEADER_REFERENTIAL: &str = "referential";
pub const HEADER_PROFILE: &str = "validationProfile";
pub const HEADER_SHARD_NAME: &str = "shardName";
pub const HEADER_TOTAL_SHARDS: &str = "totalShards";
pub const HEADER_STATUS: &str = "status";
pub const HEADER_TIMED_OUT: &str = "timedOut";

/// Every kind of work the pipeline schedules. Serialized as the `jobType` header.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum JobType {
    /// A dataset was accepted. Publishes `started` once, then `split`.
    Submit,
    /// Extract the archive into shards and fan out.
    Split,
    /// Schema-stage validation of one shard.
    ValidateSchema,
    /// Schema barrier completed: abort on schema errors or fan out shard validation.
    ScheduleValidation,
    /// Full validation of one shard.
    ValidateShard,
    /// Common-files barrier completed: fan out line files.
    ScheduleLineFiles,
    /// Barrier signal: one shard finished schema validation.
    AggregateSchema,
    /// Barrier signal: one common shard finished validation.
    AggregateCommonFiles,
    /// Barrier signal: one shard report is available.
    AggregateReports,
    /// Reports barrier completed: merge reports and run dataset-level validators.
    ValidateDataset,
    /// Persist the final report, publish the terminal status, purge run state.
    CompleteValidation,
    /// Reload the stop place / quay whitelist.
    RefreshStopPlaceCache,
}

impl JobType {
    pub const ALL: [JobType; 12] = [
        JobType::Submit,
        JobType::Split,
        JobType::ValidateSchema,
        JobType::ScheduleValidation,
        JobType::ValidateShard,
        JobType::ScheduleLineFiles,
        JobType::AggregateSchema,
        JobType::AggregateCommonFiles,
        JobType::AggregateReports,
        JobType::ValidateDataset,
        JobType::CompleteValidation,
        JobType::RefreshStopPlaceCache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Submit => "submit",
            JobType::Split => "split",
            JobType::ValidateSchema => "validateSchema",
            JobType::ScheduleValidation => "scheduleValidation",
            JobType::ValidateShard => "validateShard",
            JobType::ScheduleLineFiles => "scheduleLineFiles",
            JobType::AggregateSchema => "aggregateSchema",
            JobType::AggregateCommonFiles => "aggregateCommonFiles",
            JobType::AggregateReports => "aggregateReports",
            JobType::ValidateDataset => "validateDataset",
            JobType::CompleteValidation => "completeValidation",
            JobType::RefreshStopPlaceCache => "refreshStopPlaceCache",
        }
    }

    /// The topic a job of this type is published to.
    pub fn topic(&self) -> Topic {
        match self {
            JobType::Submit => Topic::DatasetSubmitted,
            JobType::Split => Topic::SplitJob,
            JobType::AggregateSchema => Topic::AggregateSchemaValidation,
            JobType::AggregateCommonFiles => Topic::AggregateCommonFiles,
            JobType::AggregateReports => Topic::AggregateReports,
            JobType::ValidateSchema
            | JobType::ScheduleValidation
            | JobType::ValidateShard
            | JobType::ScheduleLineFiles
            | JobType::ValidateDataset
            | JobType::CompleteValidation
            | JobType::RefreshStopPlaceCache => Topic::ValidateShardJob,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .iter()
            .copied()
            .find(|job_type| job_type.as_str() == value)
            .ok_or_else(|| format!("Unknown job type: {}", value))
    }
}

/// Identity of one validation run: one submitted dataset for one tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ValidationRun {
    pub run_id: String,
    pub referential: String,
    pub profile: String,
}

impl ValidationRun {
    pub fn new(referential: &str, profile: &str) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            referential: referential.to_string(),
            profile: profile.to_string(),
        }
    }
}

impl fmt::Display for ValidationRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.referential, self.run_id)
    }
}

/// A unit of work as handlers see it: the run, the job type, the optional shard
/// coordinates and a JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardJob {
    pub job_type: JobType,
    pub run: ValidationRun,
    pub shard_name: Option<String>,
    pub total_shards: Option<usize>,
    pub timed_out: bool,
    pub body: serde_json::Value,
}

impl ShardJob {
    pub fn new(job_type: JobType, run: &ValidationRun) -> Self {
        Self {
            job_type,
            run: run.clone(),
            shard_name: None,
            total_shards: None,
            timed_out: false,
            body: serde_json::Value::Null,
        }
    }

    pub fn with_shard(mut self, shard_name: &str) -> Self {
        self.shard_name = Some(shard_name.to_string());
        self
    }

    pub fn with_total_shards(mut self, total_shards: usize) -> Self {
        self.total_shards = Some(total_shards);
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_timed_out(mut self, timed_out: bool) -> Self {
        self.timed_out = timed_out;
        self
    }

    /// Parses the headers of a delivered envelope. Missing or malformed required
    /// metadata is fatal: redelivering the same envelope can never fix it.
    pub fn from_envelope(envelope: &Envelope) -> JobResult<Self> {
        let job_type = required_header(envelope, HEADER_JOB_TYPE)?
            .parse::<JobType>()
            .map_err(JobError::Fatal)?;

        let run = ValidationRun {
            run_id: required_header(envelope, HEADER_RUN_ID)?.to_string(),
            referential: required_header(envelope, HEADER_REFERENTIAL)?.to_string(),
            profile: required_header(envelope, HEADER_PROFILE)?.to_string(),
        };

        let total_shards = match envelope.header(HEADER_TOTAL_SHARDS) {
            Some(value) => Some(value.parse::<usize>().map_err(|_| {
                JobError::fatal(format!("Invalid {} header: {}", HEADER_TOTAL_SHARDS, value))
            })?),
            None => None,
        };

        Ok(Self {
            job_type,
            run,
            shard_name: envelope.header(HEADER_SHARD_NAME).map(str::to_string),
            total_shards,
            timed_out: envelope.header(HEADER_TIMED_OUT) == Some("true"),
            body: envelope.body.clone(),
        })
    }

    pub fn to_envelope(&self) -> Envelope {
        let mut envelope = Envelope::new()
            .with_header(HEADER_JOB_TYPE, self.job_type.as_str())
            .with_header(HEADER_RUN_ID, self.run.run_id.as_str())
            .with_header(HEADER_REFERENTIAL, self.run.referential.as_str())
            .with_header(HEADER_PROFILE, self.run.profile.as_str())
            .with_body(self.body.clone());

        if let Some(shard_name) = &self.shard_name {
            envelope = envelope.with_header(HEADER_SHARD_NAME, shard_name.as_str());
        }
        if let Some(total_shards) = self.total_shards {
            envelope = envelope.with_header(HEADER_TOTAL_SHARDS, total_shards.to_string());
        }
        if self.timed_out {
            envelope = envelope.with_header(HEADER_TIMED_OUT, "true");
        }
        envelope
    }

    pub fn require_shard(&self) -> JobResult<&str> {
        self.shard_name.as_deref().ok_or_else(|| {
            JobError::fatal(format!(
                "{} job for run {} is missing {}",
                self.job_type, self.run, HEADER_SHARD_NAME
            ))
        })
    }

    pub fn require_total_shards(&self) -> JobResult<usize> {
        self.total_shards.ok_or_else(|| {
            JobError::fatal(format!(
                "{} job for run {} is missing {}",
                self.job_type, self.run, HEADER_TOTAL_SHARDS
            ))
        })
    }
}

fn required_header<'a>(envelope: &'a Envelope, name: &str) -> JobResult<&'a str> {
    envelope
        .header(name)
        .ok_or_else(|| JobError::fatal(format!("Missing required header {}", name)))
}
