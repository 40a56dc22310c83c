//! Raw CSV → partitioned Parquet refinement.
//!
//! One run reads a raw sales file from the object store, normalizes its
//! column names, assigns every row to a `(year, month)` partition and
//! replaces each touched partition as a unit. Partitions the run does not
//! touch are left alone.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::ALERT_SUBJECT;
use crate::domain::{ObjectLocation, PartitionKey, PartitionStrategy};
use crate::error::PipelineError;
use crate::notify::Notifier;
use crate::object_store::ObjectStore;
use crate::table::{ColumnType, Table, Value};

/// Single data file written per partition; a stable name keeps re-runs idempotent.
pub const PARTITION_FILE_NAME: &str = "part-00000.parquet";
pub const SALE_DATE_COLUMN: &str = "saledate";

/// Canonical refined name for a raw column: the exact `year`/`trim` renames
/// apply first, then the name is lower-cased.
pub fn normalize_column_name(name: &str) -> String {
    let renamed = match name.trim() {
        "year" => "release_year",
        "trim" => "car_trim",
        other => other,
    };
    renamed.to_lowercase()
}

pub fn normalize_columns(table: &mut Table) -> Result<(), PipelineError> {
    let normalized = table
        .columns()
        .iter()
        .map(|name| normalize_column_name(name))
        .collect::<Vec<_>>();
    let mut seen = HashSet::new();
    for name in &normalized {
        if !seen.insert(name.as_str()) {
            return Err(PipelineError::Schema(format!(
                "duplicate column `{name}` after normalization"
            )));
        }
    }
    table.set_columns(normalized)
}

/// Reads the leading date of a sale timestamp.
///
/// Accepts the catalog's `Tue Dec 16 2014 12:30:00 GMT-0800 (PST)` form as
/// well as ISO `2014-12-16`.
pub fn parse_sale_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let head = trimmed.split_whitespace().take(4).collect::<Vec<_>>().join(" ");
    NaiveDate::parse_from_str(&head, "%a %b %d %Y")
        .ok()
        .or_else(|| {
            trimmed
                .get(..10)
                .and_then(|iso| NaiveDate::parse_from_str(iso, "%Y-%m-%d").ok())
        })
}

/// Splits rows into partitions according to `strategy`.
pub fn assign_partitions(
    table: Table,
    strategy: PartitionStrategy,
    run_date: NaiveDate,
) -> Result<BTreeMap<PartitionKey, Table>, PipelineError> {
    let mut partitions = BTreeMap::new();
    match strategy {
        PartitionStrategy::Ingestion => {
            partitions.insert(PartitionKey::from_date(run_date), table);
        }
        PartitionStrategy::SaleDate => {
            let index = table.require_column(SALE_DATE_COLUMN)?;
            let (columns, rows) = table.into_parts();
            let mut unparsed = 0usize;
            let mut grouped: BTreeMap<PartitionKey, Vec<Vec<Value>>> = BTreeMap::new();
            for row in rows {
                let key = match &row[index] {
                    Value::Text(text) => parse_sale_date(text).map(PartitionKey::from_date),
                    _ => None,
                };
                match key {
                    Some(key) => grouped.entry(key).or_default().push(row),
                    None => unparsed += 1,
                }
            }
            if unparsed > 0 {
                warn!(rows = unparsed, "dropping rows without a parsable sale date");
            }
            for (key, rows) in grouped {
                partitions.insert(key, Table::from_rows(columns.clone(), rows)?);
            }
        }
    }
    Ok(partitions)
}

/// Arrow schema with one inferred type per column.
pub fn infer_schema(table: &Table) -> SchemaRef {
    let fields = table
        .columns()
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let data_type = match ColumnType::infer_values(table.column_values(index)) {
                ColumnType::Int64 => DataType::Int64,
                ColumnType::Float64 => DataType::Float64,
                ColumnType::Utf8 => DataType::Utf8,
            };
            Field::new(name, data_type, true)
        })
        .collect::<Vec<_>>();
    Arc::new(Schema::new(fields))
}

pub fn to_record_batch(table: &Table, schema: SchemaRef) -> Result<RecordBatch, PipelineError> {
    let columns = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(index, field)| -> Result<ArrayRef, PipelineError> {
            let values = table.column_values(index);
            let array: ArrayRef = match field.data_type() {
                DataType::Int64 => Arc::new(values.map(Value::as_i64).collect::<Int64Array>()),
                DataType::Float64 => {
                    Arc::new(values.map(Value::as_f64).collect::<Float64Array>())
                }
                DataType::Utf8 => Arc::new(
                    values
                        .map(|value| match value {
                            Value::Null => None,
                            Value::Text(text) => Some(text.clone()),
                            other => Some(other.to_string()),
                        })
                        .collect::<StringArray>(),
                ),
                other => {
                    return Err(PipelineError::Schema(format!(
                        "unsupported column type {other}"
                    )));
                }
            };
            Ok(array)
        })
        .collect::<Result<Vec<_>, _>>()?;
    RecordBatch::try_new(schema, columns).map_err(|err| PipelineError::Schema(err.to_string()))
}

pub fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>, PipelineError> {
    let properties = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(properties))
        .map_err(|err| PipelineError::WriteFailed(format!("parquet writer: {err}")))?;
    writer
        .write(batch)
        .map_err(|err| PipelineError::WriteFailed(format!("parquet encode: {err}")))?;
    writer
        .close()
        .map_err(|err| PipelineError::WriteFailed(format!("parquet finish: {err}")))?;
    Ok(buffer)
}

#[derive(Debug, Clone)]
pub struct RefineRequest {
    pub source: ObjectLocation,
    /// Dataset root, e.g. `s3://bucket/refined_data`.
    pub destination: ObjectLocation,
    /// Logical date of the run; decides the partition under the ingestion strategy.
    pub run_date: NaiveDate,
    pub strategy: PartitionStrategy,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionWrite {
    pub partition: PartitionKey,
    pub location: String,
    pub rows: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefineReport {
    pub source: String,
    pub columns: Vec<String>,
    pub rows_read: usize,
    pub rows_skipped: usize,
    pub partitions: Vec<PartitionWrite>,
    /// Partitions already under the destination that this run left in place.
    pub retained: Vec<PartitionKey>,
}

/// Runs refinement and raises an alert before returning any failure.
pub struct RefinementJob<S: ObjectStore, N: Notifier> {
    store: S,
    notifier: N,
}

impl<S: ObjectStore, N: Notifier> RefinementJob<S, N> {
    pub fn new(store: S, notifier: N) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn run(&self, request: &RefineRequest) -> Result<RefineReport, PipelineError> {
        match self.refine(request) {
            Ok(report) => Ok(report),
            Err(err) => {
                error!(source = %request.source, error = %err, "refinement failed");
                let message = format!("Refinement failed: {err}");
                if let Err(alert_err) = self.notifier.publish(ALERT_SUBJECT, &message) {
                    warn!(error = %alert_err, "failed to publish refinement alert");
                }
                Err(err)
            }
        }
    }

    fn refine(&self, request: &RefineRequest) -> Result<RefineReport, PipelineError> {
        info!(source = %request.source, "reading raw CSV");
        let raw = self.store.get_bytes(&request.source)?;
        let (mut table, stats) = Table::from_csv_reader(raw.as_slice())?;
        if stats.skipped_rows > 0 {
            warn!(rows = stats.skipped_rows, "skipped records with extra fields");
        }
        if table.is_empty() {
            return Err(PipelineError::EmptyResult(format!(
                "{} has no data rows",
                request.source
            )));
        }

        normalize_columns(&mut table)?;
        let columns = table.columns().to_vec();
        let schema = infer_schema(&table);
        let partitions = assign_partitions(table, request.strategy, request.run_date)?;
        if partitions.is_empty() {
            return Err(PipelineError::EmptyResult(
                "no rows could be assigned to a partition".to_string(),
            ));
        }

        let mut writes = Vec::with_capacity(partitions.len());
        for (key, partition) in partitions {
            let batch = to_record_batch(&partition, schema.clone())?;
            let content = encode_parquet(&batch)?;
            let prefix = request.destination.join(&key.path_segment());
            let bytes = content.len();
            info!(
                partition = %key,
                rows = partition.len(),
                object = %prefix,
                "overwriting partition"
            );
            self.store
                .replace_prefix(
                    &prefix.bucket,
                    &prefix.key,
                    vec![(PARTITION_FILE_NAME.to_string(), content)],
                )
                .map_err(into_write_failure)?;
            writes.push(PartitionWrite {
                partition: key,
                location: prefix.join(PARTITION_FILE_NAME).to_string(),
                rows: partition.len(),
                bytes,
            });
        }

        let retained = self.retained_partitions(&request.destination, &writes);
        Ok(RefineReport {
            source: request.source.to_string(),
            columns,
            rows_read: stats.rows,
            rows_skipped: stats.skipped_rows,
            partitions: writes,
            retained,
        })
    }

    fn retained_partitions(
        &self,
        destination: &ObjectLocation,
        writes: &[PartitionWrite],
    ) -> Vec<PartitionKey> {
        let written = writes
            .iter()
            .map(|write| write.partition)
            .collect::<BTreeSet<_>>();
        let keys = match self.store.list(&destination.bucket, &destination.key) {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "could not list existing partitions");
                return Vec::new();
            }
        };
        let retained = keys
            .iter()
            .filter_map(|key| PartitionKey::from_object_key(key))
            .filter(|key| !written.contains(key))
            .collect::<BTreeSet<_>>();
        if !retained.is_empty() {
            debug!(partitions = retained.len(), "other partitions left in place");
        }
        retained.into_iter().collect()
    }
}

fn into_write_failure(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::WriteFailed(_) | PipelineError::CredentialsMissing(_) => err,
        other => PipelineError::WriteFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn text(value: &str) -> Value {
        Value::Text(value.to_string())
    }

    #[test]
    fn column_names_are_normalized() {
        assert_eq!(normalize_column_name("year"), "release_year");
        assert_eq!(normalize_column_name("trim"), "car_trim");
        assert_eq!(normalize_column_name("sellingPrice"), "sellingprice");
    }

    #[test]
    fn renames_match_exact_names_only() {
        assert_eq!(normalize_column_name("Year"), "year");
        assert_eq!(normalize_column_name("Trim"), "trim");

        let mut table = Table::new(vec!["year".to_string(), "Year".to_string()]);
        normalize_columns(&mut table).unwrap();
        assert_eq!(table.columns(), ["release_year", "year"]);
    }

    #[test]
    fn normalization_rejects_collisions() {
        let mut table = Table::new(vec!["Make".to_string(), "make".to_string()]);
        assert_matches!(normalize_columns(&mut table), Err(PipelineError::Schema(_)));
    }

    #[test]
    fn sale_dates_parse() {
        assert_eq!(
            parse_sale_date("Tue Dec 16 2014 12:30:00 GMT-0800 (PST)"),
            NaiveDate::from_ymd_opt(2014, 12, 16)
        );
        assert_eq!(
            parse_sale_date("2015-01-07T00:00:00"),
            NaiveDate::from_ymd_opt(2015, 1, 7)
        );
        assert_eq!(parse_sale_date("unknown"), None);
    }

    #[test]
    fn sale_date_strategy_groups_rows() {
        let table = Table::from_rows(
            vec!["make".to_string(), "saledate".to_string()],
            vec![
                vec![text("Kia"), text("Tue Dec 16 2014 12:30:00 GMT-0800 (PST)")],
                vec![text("BMW"), text("Thu Jan 15 2015 04:30:00 GMT-0800 (PST)")],
                vec![text("Ford"), Value::Null],
            ],
        )
        .unwrap();
        let run_date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let partitions = assign_partitions(table, PartitionStrategy::SaleDate, run_date).unwrap();
        let keys = partitions.keys().copied().collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![
                PartitionKey::new(2014, 12).unwrap(),
                PartitionKey::new(2015, 1).unwrap()
            ]
        );
    }

    #[test]
    fn ingestion_strategy_uses_run_date() {
        let table = Table::from_rows(vec!["make".to_string()], vec![vec![text("Kia")]]).unwrap();
        let run_date = NaiveDate::from_ymd_opt(2024, 5, 20).unwrap();
        let partitions = assign_partitions(table, PartitionStrategy::Ingestion, run_date).unwrap();
        assert!(partitions.contains_key(&PartitionKey::new(2024, 5).unwrap()));
    }

    #[test]
    fn schema_inference_types_columns() {
        let table = Table::from_rows(
            vec![
                "release_year".to_string(),
                "condition".to_string(),
                "make".to_string(),
            ],
            vec![
                vec![text("2015"), text("4.5"), text("Kia")],
                vec![text("2014"), Value::Null, text("BMW")],
            ],
        )
        .unwrap();
        let schema = infer_schema(&table);
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(1).data_type(), &DataType::Float64);
        assert_eq!(schema.field(2).data_type(), &DataType::Utf8);

        let batch = to_record_batch(&table, schema).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.column(1).null_count(), 1);
    }
}
