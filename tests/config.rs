use std::fs;

use assert_matches::assert_matches;
use chrono::NaiveDate;
use vehicle_sales_pipeline::config::{
    Config, ConfigLoader, ConfigOverrides, DEFAULT_BUCKET, DEFAULT_DATASET, StoreBackend,
};
use vehicle_sales_pipeline::domain::PartitionStrategy;
use vehicle_sales_pipeline::error::PipelineError;

fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

#[test]
fn defaults_without_file() {
    let resolved = ConfigLoader::resolve_with_env(Config::default(), Vec::new()).unwrap();
    assert_eq!(resolved.dataset.to_string(), DEFAULT_DATASET);
    assert_eq!(resolved.bucket, DEFAULT_BUCKET);
    assert_eq!(resolved.store, StoreBackend::S3);
    assert_eq!(resolved.partition_strategy, PartitionStrategy::Ingestion);
    assert_eq!(resolved.raw_prefix, "raw_data");
    assert_eq!(resolved.refined_prefix, "refined_data");
    assert_eq!(resolved.athena.view, "v_vehicle_sales_clean");
    assert!(resolved.alerts.notify_on_failure);
}

#[test]
fn file_values_are_loaded() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("vsp.json");
    fs::write(
        &path,
        r#"{
  "schema_version": 1,
  "bucket": "sales-archive",
  "raw": { "prefix": "incoming", "date_partitioned": true },
  "refined": { "partition_strategy": "sale-date" },
  "athena": { "database": "vehicles", "workgroup": "analytics" }
}"#,
    )
    .unwrap();

    let config = ConfigLoader::load_file(path.to_str()).unwrap();
    let resolved = ConfigLoader::resolve_with_env(config, Vec::new()).unwrap();

    assert_eq!(resolved.bucket, "sales-archive");
    assert_eq!(resolved.partition_strategy, PartitionStrategy::SaleDate);
    assert_eq!(resolved.athena.database, "vehicles");
    assert_eq!(resolved.athena.workgroup.as_deref(), Some("analytics"));
    assert_eq!(
        resolved.raw_key(NaiveDate::from_ymd_opt(2024, 5, 14).unwrap()),
        "incoming/2024-05-14/car_prices.csv"
    );
    assert_eq!(
        resolved.athena_output_location(),
        "s3://sales-archive/athena-results/"
    );
}

#[test]
fn explicit_missing_file_is_an_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::load_file(path.to_str()),
        Err(PipelineError::MissingConfig(_))
    );
}

#[test]
fn malformed_file_is_a_parse_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("vsp.json");
    fs::write(&path, "{ bucket: ").unwrap();
    assert_matches!(
        ConfigLoader::load_file(path.to_str()),
        Err(PipelineError::ConfigParse(_))
    );
}

#[test]
fn prefixed_env_wins_over_generic_name() {
    let resolved = ConfigLoader::resolve_with_env(
        Config::default(),
        vars(&[("VSP_BUCKET", "primary"), ("BUCKET_NAME", "legacy")]),
    )
    .unwrap();
    assert_eq!(resolved.bucket, "primary");

    let resolved =
        ConfigLoader::resolve_with_env(Config::default(), vars(&[("BUCKET_NAME", "legacy")]))
            .unwrap();
    assert_eq!(resolved.bucket, "legacy");
}

#[test]
fn env_overrides_file() {
    let config = Config {
        bucket: Some("from-file".to_string()),
        ..Config::default()
    };
    let resolved = ConfigLoader::resolve_with_env(
        config,
        vars(&[
            ("VSP_BUCKET", "from-env"),
            ("VSP_STORE", "local:/tmp/vsp-store"),
            ("VSP_PARTITION_STRATEGY", "sale-date"),
            ("VSP_NOTIFY_ON_FAILURE", "off"),
            ("SNS_TOPIC_ARN", "arn:aws:sns:eu-central-1:123456789012:alerts"),
        ]),
    )
    .unwrap();
    assert_eq!(resolved.bucket, "from-env");
    assert_eq!(resolved.store, StoreBackend::Local("/tmp/vsp-store".into()));
    assert_eq!(resolved.partition_strategy, PartitionStrategy::SaleDate);
    assert!(!resolved.alerts.notify_on_failure);
    assert_eq!(
        resolved.alerts.topic_arn.as_deref(),
        Some("arn:aws:sns:eu-central-1:123456789012:alerts")
    );
}

#[test]
fn invalid_env_value_is_rejected() {
    assert_matches!(
        ConfigLoader::resolve_with_env(
            Config::default(),
            vars(&[("VSP_NOTIFY_ON_FAILURE", "sometimes")])
        ),
        Err(PipelineError::ConfigValue { .. })
    );
    assert_matches!(
        ConfigLoader::resolve_with_env(
            Config::default(),
            vars(&[("VSP_PARTITION_STRATEGY", "weekly")])
        ),
        Err(PipelineError::InvalidStrategy(_))
    );
}

#[test]
fn overrides_apply_last() {
    let mut resolved = ConfigLoader::resolve_with_env(
        Config::default(),
        vars(&[("VSP_BUCKET", "from-env")]),
    )
    .unwrap();
    ConfigLoader::apply_overrides(
        &mut resolved,
        ConfigOverrides {
            bucket: Some("from-cli".to_string()),
            date_partitioned_raw_key: Some(true),
            ..ConfigOverrides::default()
        },
    )
    .unwrap();
    assert_eq!(resolved.bucket, "from-cli");
    assert!(resolved.date_partitioned_raw_key);
}

#[test]
fn half_static_credentials_are_rejected() {
    let config: Config =
        serde_json::from_str(r#"{ "aws": { "access_key_id": "AKIAEXAMPLE" } }"#).unwrap();
    assert_matches!(
        ConfigLoader::resolve_config(config),
        Err(PipelineError::ConfigValue { .. })
    );
}
