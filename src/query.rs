use std::sync::Arc;
use std::time::Duration;

use aws_sdk_athena::types::{QueryExecutionContext, QueryExecutionState, ResultConfiguration};
use tracing::{debug, info};

use crate::cloud::CloudContext;
use crate::config::AthenaSettings;
use crate::error::PipelineError;
use crate::table::{ColumnType, Table, Value};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub sql: String,
    pub database: String,
    /// Scratch location the engine writes result files to.
    pub output_location: String,
    pub workgroup: Option<String>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>, settings: &AthenaSettings, output_location: &str) -> Self {
        Self {
            sql: sql.into(),
            database: settings.database.clone(),
            output_location: output_location.to_string(),
            workgroup: settings.workgroup.clone(),
        }
    }
}

/// Managed SQL engine over the refined dataset.
pub trait QueryEngine {
    fn execute(&self, request: &QueryRequest) -> Result<Table, PipelineError>;
}

impl<T: QueryEngine + ?Sized> QueryEngine for &T {
    fn execute(&self, request: &QueryRequest) -> Result<Table, PipelineError> {
        (**self).execute(request)
    }
}

impl<T: QueryEngine + ?Sized> QueryEngine for Box<T> {
    fn execute(&self, request: &QueryRequest) -> Result<Table, PipelineError> {
        (**self).execute(request)
    }
}

/// Quotes `value` as a SQL string literal.
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Query used by the analysis report.
pub fn analysis_sql(view: &str) -> String {
    format!("SELECT * FROM {view} WHERE sale_price IS NOT NULL")
}

/// Runs queries and treats an empty result as an error.
pub struct QueryAdapter<E: QueryEngine> {
    engine: E,
}

impl<E: QueryEngine> QueryAdapter<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn fetch(&self, request: &QueryRequest) -> Result<Table, PipelineError> {
        info!(database = %request.database, "running query");
        debug!(sql = %request.sql);
        let table = self.engine.execute(request)?;
        info!(rows = table.len(), columns = table.columns().len(), "query finished");
        table.require_rows(&format!("query returned no rows: {}", request.sql))
    }
}

pub struct AthenaQueryEngine {
    cloud: Arc<CloudContext>,
    client: aws_sdk_athena::Client,
}

impl AthenaQueryEngine {
    pub fn new(cloud: Arc<CloudContext>) -> Self {
        let client = cloud.athena_client();
        Self { cloud, client }
    }

    async fn start(&self, request: &QueryRequest) -> Result<String, PipelineError> {
        let output = self
            .client
            .start_query_execution()
            .query_string(&request.sql)
            .query_execution_context(
                QueryExecutionContext::builder()
                    .database(&request.database)
                    .build(),
            )
            .result_configuration(
                ResultConfiguration::builder()
                    .output_location(&request.output_location)
                    .build(),
            )
            .set_work_group(request.workgroup.clone())
            .send()
            .await
            .map_err(|err| PipelineError::QueryFailed {
                state: "SUBMIT".to_string(),
                reason: err.into_service_error().to_string(),
            })?;
        output
            .query_execution_id()
            .map(str::to_string)
            .ok_or_else(|| PipelineError::QueryFailed {
                state: "SUBMIT".to_string(),
                reason: "no execution id returned".to_string(),
            })
    }

    async fn wait(&self, execution_id: &str) -> Result<(), PipelineError> {
        loop {
            let output = self
                .client
                .get_query_execution()
                .query_execution_id(execution_id)
                .send()
                .await
                .map_err(|err| PipelineError::QueryFailed {
                    state: "UNKNOWN".to_string(),
                    reason: err.into_service_error().to_string(),
                })?;
            let status = output.query_execution().and_then(|execution| execution.status());
            let state = status.and_then(|status| status.state());
            match state {
                Some(QueryExecutionState::Succeeded) => return Ok(()),
                Some(QueryExecutionState::Failed) | Some(QueryExecutionState::Cancelled) => {
                    let reason = status
                        .and_then(|status| status.state_change_reason())
                        .unwrap_or("no reason given")
                        .to_string();
                    return Err(PipelineError::QueryFailed {
                        state: state.map(|state| state.as_str().to_string()).unwrap_or_default(),
                        reason,
                    });
                }
                other => {
                    debug!(execution_id, state = ?other, "query pending");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn collect(&self, execution_id: &str) -> Result<Table, PipelineError> {
        let mut table: Option<Table> = None;
        let mut column_types = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .client
                .get_query_results()
                .query_execution_id(execution_id)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|err| PipelineError::QueryFailed {
                    state: "SUCCEEDED".to_string(),
                    reason: err.into_service_error().to_string(),
                })?;
            let Some(result_set) = output.result_set() else {
                break;
            };
            let mut rows = result_set.rows().iter();
            if table.is_none() {
                let info = result_set
                    .result_set_metadata()
                    .map(|metadata| metadata.column_info())
                    .unwrap_or_default();
                column_types = info
                    .iter()
                    .map(|column| ColumnType::from_sql_type(column.r#type()))
                    .collect();
                table = Some(Table::new(
                    info.iter().map(|column| column.name().to_string()).collect(),
                ));
                // First row of the first page repeats the header.
                rows.next();
            }
            if let Some(table) = table.as_mut() {
                for row in rows {
                    let values = column_types
                        .iter()
                        .enumerate()
                        .map(|(index, column_type)| {
                            row.data()
                                .get(index)
                                .and_then(|datum| datum.var_char_value())
                                .map(|raw| Value::parse_as(raw, *column_type))
                                .unwrap_or(Value::Null)
                        })
                        .collect();
                    table.push_row(values)?;
                }
            }
            next_token = output.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(table.unwrap_or_else(|| Table::new(Vec::new())))
    }
}

impl QueryEngine for AthenaQueryEngine {
    fn execute(&self, request: &QueryRequest) -> Result<Table, PipelineError> {
        self.cloud.block_on(async {
            let execution_id = self.start(request).await?;
            debug!(execution_id = %execution_id, "query submitted");
            self.wait(&execution_id).await?;
            self.collect(&execution_id).await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use assert_matches::assert_matches;

    use super::*;

    struct FixedEngine {
        table: Table,
        seen: RefCell<Vec<String>>,
    }

    impl QueryEngine for FixedEngine {
        fn execute(&self, request: &QueryRequest) -> Result<Table, PipelineError> {
            self.seen.borrow_mut().push(request.sql.clone());
            Ok(self.table.clone())
        }
    }

    fn request(sql: &str) -> QueryRequest {
        QueryRequest {
            sql: sql.to_string(),
            database: "default".to_string(),
            output_location: "s3://bucket/athena-results/".to_string(),
            workgroup: None,
        }
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(sql_literal("Land Rover"), "'Land Rover'");
        assert_eq!(sql_literal("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn analysis_query_filters_missing_prices() {
        assert_eq!(
            analysis_sql("v_vehicle_sales_clean"),
            "SELECT * FROM v_vehicle_sales_clean WHERE sale_price IS NOT NULL"
        );
    }

    #[test]
    fn empty_result_is_rejected() {
        let adapter = QueryAdapter::new(FixedEngine {
            table: Table::new(vec!["make".to_string()]),
            seen: RefCell::new(Vec::new()),
        });
        assert_matches!(
            adapter.fetch(&request("SELECT make FROM t")),
            Err(PipelineError::EmptyResult(_))
        );
        assert_eq!(adapter.engine().seen.borrow().len(), 1);
    }

    #[test]
    fn rows_pass_through() {
        let table = Table::from_rows(
            vec!["make".to_string()],
            vec![vec![Value::Text("Kia".to_string())]],
        )
        .unwrap();
        let adapter = QueryAdapter::new(FixedEngine {
            table,
            seen: RefCell::new(Vec::new()),
        });
        let result = adapter.fetch(&request("SELECT make FROM t")).unwrap();
        assert_eq!(result.len(), 1);
    }
}
