use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

static PARTITION_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?:^|/)year=(-?\d+)/month=(\d{1,2})(?:/|$)").ok());

/// Catalog dataset identifier in `owner/name` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatasetSlug {
    owner: String,
    name: String,
}

impl DatasetSlug {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DatasetSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for DatasetSlug {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (owner, name) = trimmed
            .split_once('/')
            .ok_or_else(|| PipelineError::InvalidSlug(value.to_string()))?;
        let is_part = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        };
        if !is_part(owner) || !is_part(name) {
            return Err(PipelineError::InvalidSlug(value.to_string()));
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl TryFrom<String> for DatasetSlug {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DatasetSlug> for String {
    fn from(value: DatasetSlug) -> Self {
        value.to_string()
    }
}

/// `(year, month)` key of one refined dataset partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
}

impl PartitionKey {
    pub fn new(year: i32, month: u32) -> Result<Self, PipelineError> {
        if !(1..=12).contains(&month) {
            return Err(PipelineError::Schema(format!(
                "partition month out of range: {month}"
            )));
        }
        Ok(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Hive-style key prefix, `year=<Y>/month=<M>`.
    pub fn path_segment(&self) -> String {
        format!("year={}/month={}", self.year, self.month)
    }

    /// Parses a key such as `refined_data/year=2024/month=5/part-00000.parquet`.
    pub fn from_object_key(key: &str) -> Option<Self> {
        let captures = PARTITION_PATTERN.as_ref()?.captures(key)?;
        let year = captures.get(1)?.as_str().parse().ok()?;
        let month = captures.get(2)?.as_str().parse().ok()?;
        Self::new(year, month).ok()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path_segment())
    }
}

/// Which date decides the partition a refined row lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionStrategy {
    /// Logical date of the refinement run.
    #[default]
    Ingestion,
    /// The sale's own `saledate` column.
    SaleDate,
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionStrategy::Ingestion => write!(f, "ingestion"),
            PartitionStrategy::SaleDate => write!(f, "sale-date"),
        }
    }
}

impl FromStr for PartitionStrategy {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ingestion" => Ok(PartitionStrategy::Ingestion),
            "sale-date" | "sale_date" | "saledate" => Ok(PartitionStrategy::SaleDate),
            _ => Err(PipelineError::InvalidStrategy(value.to_string())),
        }
    }
}

/// A `bucket` + `key` pair, printable as `s3://bucket/key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn join(&self, segment: &str) -> Self {
        let key = if self.key.is_empty() {
            segment.trim_start_matches('/').to_string()
        } else {
            format!(
                "{}/{}",
                self.key.trim_end_matches('/'),
                segment.trim_start_matches('/')
            )
        };
        Self::new(self.bucket.clone(), key)
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

impl FromStr for ObjectLocation {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let rest = value
            .trim()
            .strip_prefix("s3://")
            .ok_or_else(|| PipelineError::InvalidLocation(value.to_string()))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(PipelineError::InvalidLocation(value.to_string()));
        }
        Ok(Self::new(bucket, key))
    }
}
