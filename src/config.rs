use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::{DatasetSlug, PartitionStrategy};
use crate::error::PipelineError;

pub const DEFAULT_CONFIG_FILE: &str = "vsp.json";
pub const DEFAULT_DATASET: &str = "syedanwarafridi/vehicle-sales-data";
pub const DEFAULT_BUCKET: &str = "konrad-ds-project-data";
pub const DEFAULT_REGION: &str = "eu-central-1";
pub const ALERT_SUBJECT: &str = "PIPELINE ERROR ALERT";

/// On-disk shape of `vsp.json`. Every field is optional.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub raw: Option<RawSection>,
    #[serde(default)]
    pub refined: Option<RefinedSection>,
    #[serde(default)]
    pub aws: Option<AwsSection>,
    #[serde(default)]
    pub athena: Option<AthenaSection>,
    #[serde(default)]
    pub alerts: Option<AlertSection>,
    #[serde(default)]
    pub reports_dir: Option<String>,
    #[serde(default)]
    pub kaggle_config_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RawSection {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub date_partitioned: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RefinedSection {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub partition_strategy: Option<PartitionStrategy>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AwsSection {
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AthenaSection {
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub view: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub output_location: Option<String>,
    #[serde(default)]
    pub workgroup: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AlertSection {
    #[serde(default)]
    pub topic_arn: Option<String>,
    #[serde(default)]
    pub notify_on_failure: Option<bool>,
}

/// Where objects live: real S3, or a directory tree standing in for buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    S3,
    Local(Utf8PathBuf),
}

impl FromStr for StoreBackend {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("s3") {
            return Ok(StoreBackend::S3);
        }
        match trimmed.strip_prefix("local:") {
            Some(root) if !root.is_empty() => Ok(StoreBackend::Local(Utf8PathBuf::from(root))),
            _ => Err(PipelineError::ConfigValue {
                name: "store".to_string(),
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct StaticAwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for StaticAwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticAwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AwsSettings {
    pub region: String,
    pub profile: Option<String>,
    pub endpoint_url: Option<String>,
    pub static_credentials: Option<StaticAwsCredentials>,
}

#[derive(Debug, Clone)]
pub struct AthenaSettings {
    pub database: String,
    pub view: String,
    pub table: String,
    pub output_location: Option<String>,
    pub workgroup: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub topic_arn: Option<String>,
    pub notify_on_failure: bool,
}

/// Fully resolved process configuration, built once at start-up.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub dataset: DatasetSlug,
    pub data_dir: Utf8PathBuf,
    pub store: StoreBackend,
    pub bucket: String,
    pub raw_prefix: String,
    pub raw_file_name: String,
    pub date_partitioned_raw_key: bool,
    pub refined_prefix: String,
    pub partition_strategy: PartitionStrategy,
    pub aws: AwsSettings,
    pub athena: AthenaSettings,
    pub alerts: AlertSettings,
    pub reports_dir: Utf8PathBuf,
    pub kaggle_config_dir: Option<Utf8PathBuf>,
}

impl ResolvedConfig {
    /// Object key of the raw CSV for an ingestion date.
    pub fn raw_key(&self, ingestion_date: NaiveDate) -> String {
        let prefix = self.raw_prefix.trim_end_matches('/');
        if self.date_partitioned_raw_key {
            format!(
                "{prefix}/{}/{}",
                ingestion_date.format("%Y-%m-%d"),
                self.raw_file_name
            )
        } else {
            format!("{prefix}/{}", self.raw_file_name)
        }
    }

    /// Scratch location for query results, `s3://<bucket>/athena-results/` unless set.
    pub fn athena_output_location(&self) -> String {
        self.athena
            .output_location
            .clone()
            .unwrap_or_else(|| format!("s3://{}/athena-results/", self.bucket))
    }

    pub fn local_raw_path(&self) -> Utf8PathBuf {
        self.data_dir.join(&self.raw_file_name)
    }
}

/// CLI-level overrides, the last link of the configuration chain.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub dataset: Option<String>,
    pub data_dir: Option<String>,
    pub store: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub partition_strategy: Option<PartitionStrategy>,
    pub date_partitioned_raw_key: Option<bool>,
    pub topic_arn: Option<String>,
    pub reports_dir: Option<String>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults < config file < process environment.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PipelineError> {
        let config = Self::load_file(path)?;
        Self::resolve_with_env(config, std::env::vars())
    }

    pub fn load_file(path: Option<&str>) -> Result<Config, PipelineError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if !config_path.exists() {
            if path.is_some() {
                return Err(PipelineError::MissingConfig(config_path));
            }
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| PipelineError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| PipelineError::ConfigParse(err.to_string()))
    }

    pub fn resolve_with_env<I>(config: Config, vars: I) -> Result<ResolvedConfig, PipelineError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut resolved = Self::resolve_config(config)?;
        let mut vars = vars.into_iter().collect::<Vec<_>>();
        // VSP_* names take precedence over the generic ones they alias.
        vars.sort_by_key(|(name, _)| name.starts_with("VSP_"));
        for (name, value) in vars {
            Self::apply_env_var(&mut resolved, &name, &value)?;
        }
        Ok(resolved)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, PipelineError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let dataset = config
            .dataset
            .as_deref()
            .unwrap_or(DEFAULT_DATASET)
            .parse()?;
        let store = config
            .store
            .as_deref()
            .map(|value| value.parse::<StoreBackend>())
            .transpose()?
            .unwrap_or(StoreBackend::S3);
        let bucket = config.bucket.unwrap_or_else(|| DEFAULT_BUCKET.to_string());

        let raw = config.raw.unwrap_or_default();
        let refined = config.refined.unwrap_or_default();
        let aws = config.aws.unwrap_or_default();
        let athena = config.athena.unwrap_or_default();
        let alerts = config.alerts.unwrap_or_default();

        let static_credentials = match (aws.access_key_id, aws.secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => Some(StaticAwsCredentials {
                access_key_id,
                secret_access_key,
                session_token: aws.session_token,
            }),
            (None, None) => None,
            _ => {
                return Err(PipelineError::ConfigValue {
                    name: "aws".to_string(),
                    value: "access_key_id and secret_access_key must be set together".to_string(),
                });
            }
        };

        Ok(ResolvedConfig {
            schema_version,
            dataset,
            data_dir: Utf8PathBuf::from(config.data_dir.unwrap_or_else(|| "./data".to_string())),
            store,
            raw_prefix: raw.prefix.unwrap_or_else(|| "raw_data".to_string()),
            raw_file_name: raw.file_name.unwrap_or_else(|| "car_prices.csv".to_string()),
            date_partitioned_raw_key: raw.date_partitioned.unwrap_or(false),
            refined_prefix: refined.prefix.unwrap_or_else(|| "refined_data".to_string()),
            partition_strategy: refined.partition_strategy.unwrap_or_default(),
            aws: AwsSettings {
                region: aws.region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
                profile: aws.profile,
                endpoint_url: aws.endpoint_url,
                static_credentials,
            },
            athena: AthenaSettings {
                database: athena.database.unwrap_or_else(|| "default".to_string()),
                view: athena
                    .view
                    .unwrap_or_else(|| "v_vehicle_sales_clean".to_string()),
                table: athena
                    .table
                    .unwrap_or_else(|| "vehicle_sales_parquet".to_string()),
                output_location: athena.output_location,
                workgroup: athena.workgroup,
            },
            alerts: AlertSettings {
                topic_arn: alerts.topic_arn,
                notify_on_failure: alerts.notify_on_failure.unwrap_or(true),
            },
            reports_dir: Utf8PathBuf::from(
                config
                    .reports_dir
                    .unwrap_or_else(|| "reports".to_string()),
            ),
            kaggle_config_dir: config.kaggle_config_dir.map(Utf8PathBuf::from),
            bucket,
        })
    }

    fn apply_env_var(
        resolved: &mut ResolvedConfig,
        name: &str,
        value: &str,
    ) -> Result<(), PipelineError> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(());
        }
        match name {
            "VSP_DATASET" => resolved.dataset = value.parse()?,
            "VSP_DATA_DIR" => resolved.data_dir = Utf8PathBuf::from(value),
            "VSP_STORE" => resolved.store = value.parse()?,
            "VSP_BUCKET" | "BUCKET_NAME" => resolved.bucket = value.to_string(),
            "VSP_REGION" => resolved.aws.region = value.to_string(),
            "VSP_AWS_PROFILE" => resolved.aws.profile = Some(value.to_string()),
            "VSP_ENDPOINT_URL" => resolved.aws.endpoint_url = Some(value.to_string()),
            "VSP_PARTITION_STRATEGY" => resolved.partition_strategy = value.parse()?,
            "VSP_DATE_PARTITIONED_RAW_KEY" => {
                resolved.date_partitioned_raw_key = parse_bool(name, value)?
            }
            "VSP_ATHENA_DATABASE" => resolved.athena.database = value.to_string(),
            "VSP_ATHENA_OUTPUT" => resolved.athena.output_location = Some(value.to_string()),
            "VSP_ATHENA_WORKGROUP" => resolved.athena.workgroup = Some(value.to_string()),
            "VSP_SNS_TOPIC_ARN" | "SNS_TOPIC_ARN" => {
                resolved.alerts.topic_arn = Some(value.to_string())
            }
            "VSP_NOTIFY_ON_FAILURE" => {
                resolved.alerts.notify_on_failure = parse_bool(name, value)?
            }
            "VSP_REPORTS_DIR" => resolved.reports_dir = Utf8PathBuf::from(value),
            "KAGGLE_CONFIG_DIR" => resolved.kaggle_config_dir = Some(Utf8PathBuf::from(value)),
            _ => {}
        }
        Ok(())
    }

    pub fn apply_overrides(
        resolved: &mut ResolvedConfig,
        overrides: ConfigOverrides,
    ) -> Result<(), PipelineError> {
        if let Some(dataset) = overrides.dataset {
            resolved.dataset = dataset.parse()?;
        }
        if let Some(data_dir) = overrides.data_dir {
            resolved.data_dir = Utf8PathBuf::from(data_dir);
        }
        if let Some(store) = overrides.store {
            resolved.store = store.parse()?;
        }
        if let Some(bucket) = overrides.bucket {
            resolved.bucket = bucket;
        }
        if let Some(region) = overrides.region {
            resolved.aws.region = region;
        }
        if let Some(strategy) = overrides.partition_strategy {
            resolved.partition_strategy = strategy;
        }
        if let Some(flag) = overrides.date_partitioned_raw_key {
            resolved.date_partitioned_raw_key = flag;
        }
        if let Some(topic_arn) = overrides.topic_arn {
            resolved.alerts.topic_arn = Some(topic_arn);
        }
        if let Some(reports_dir) = overrides.reports_dir {
            resolved.reports_dir = Utf8PathBuf::from(reports_dir);
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, PipelineError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PipelineError::ConfigValue {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hardcoded_pipeline() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.dataset.to_string(), DEFAULT_DATASET);
        assert_eq!(resolved.bucket, DEFAULT_BUCKET);
        assert_eq!(resolved.store, StoreBackend::S3);
        assert_eq!(
            resolved.athena_output_location(),
            "s3://konrad-ds-project-data/athena-results/"
        );
        assert_eq!(resolved.local_raw_path(), Utf8PathBuf::from("./data/car_prices.csv"));
    }

    #[test]
    fn raw_key_layouts() {
        let mut resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 5, 7).unwrap();
        assert_eq!(resolved.raw_key(date), "raw_data/car_prices.csv");
        resolved.date_partitioned_raw_key = true;
        assert_eq!(resolved.raw_key(date), "raw_data/2024-05-07/car_prices.csv");
    }

    #[test]
    fn parse_store_backend() {
        assert_eq!("s3".parse::<StoreBackend>().unwrap(), StoreBackend::S3);
        assert_eq!(
            "local:/tmp/lake".parse::<StoreBackend>().unwrap(),
            StoreBackend::Local(Utf8PathBuf::from("/tmp/lake"))
        );
        assert!("gcs".parse::<StoreBackend>().is_err());
    }
}
