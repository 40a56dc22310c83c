//! Data side of the interactive dashboard.
//!
//! Two strategies feed the same [`DashboardView`]: `cloud-heavy` pushes every
//! widget's aggregation down to the query engine, `smart-buffer` pulls one
//! pool of rows per brand and aggregates locally while the year changes.
//! Both remember each SQL text they have already run.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::query::{QueryEngine, QueryRequest, sql_literal};
use crate::report::{
    self, BrandMetrics, ConditionPrice, Deal, MAKE, ODOMETER, RELEASE_YEAR, SELLING_PRICE,
    StateSummary,
};
use crate::table::{Table, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DashboardMode {
    CloudHeavy,
    #[default]
    SmartBuffer,
}

impl fmt::Display for DashboardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DashboardMode::CloudHeavy => write!(f, "cloud-heavy"),
            DashboardMode::SmartBuffer => write!(f, "smart-buffer"),
        }
    }
}

impl FromStr for DashboardMode {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cloud-heavy" | "cloud_heavy" => Ok(DashboardMode::CloudHeavy),
            "smart-buffer" | "smart_buffer" => Ok(DashboardMode::SmartBuffer),
            other => Err(PipelineError::ConfigValue {
                name: "dashboard mode".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Memoizes query results by SQL text for the lifetime of a session.
pub struct QueryCache<E: QueryEngine> {
    engine: E,
    template: QueryRequest,
    results: HashMap<String, Table>,
    executed: usize,
}

impl<E: QueryEngine> QueryCache<E> {
    /// `template` carries database, output location and workgroup; its SQL is replaced per call.
    pub fn new(engine: E, template: QueryRequest) -> Self {
        Self {
            engine,
            template,
            results: HashMap::new(),
            executed: 0,
        }
    }

    /// Number of queries actually sent to the engine.
    pub fn executed(&self) -> usize {
        self.executed
    }

    pub fn run(&mut self, sql: &str) -> Result<&Table, PipelineError> {
        if !self.results.contains_key(sql) {
            let request = QueryRequest {
                sql: sql.to_string(),
                ..self.template.clone()
            };
            debug!(sql, "cache miss");
            let table = self.engine.execute(&request)?;
            self.executed += 1;
            self.results.insert(sql.to_string(), table);
        }
        self.results
            .get(sql)
            .ok_or_else(|| PipelineError::Runtime("query cache lost an entry".to_string()))
    }
}

/// Everything the dashboard draws for one `(make, year)` selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardView {
    pub make: String,
    pub year: i64,
    pub metrics: BrandMetrics,
    pub price_by_condition: Vec<ConditionPrice>,
    /// `(odometer, selling price)` points.
    pub price_vs_mileage: Vec<(f64, f64)>,
    pub states: Vec<StateSummary>,
    /// Only computed by the smart-buffer strategy.
    pub deals: Option<Vec<Deal>>,
}

pub struct DashboardData<E: QueryEngine> {
    cache: QueryCache<E>,
    table: String,
    mode: DashboardMode,
}

impl<E: QueryEngine> DashboardData<E> {
    pub fn new(cache: QueryCache<E>, table: impl Into<String>, mode: DashboardMode) -> Self {
        Self {
            cache,
            table: table.into(),
            mode,
        }
    }

    pub fn mode(&self) -> DashboardMode {
        self.mode
    }

    pub fn queries_executed(&self) -> usize {
        self.cache.executed()
    }

    pub fn makes(&mut self) -> Result<Vec<String>, PipelineError> {
        let sql = format!("SELECT DISTINCT make FROM {} ORDER BY make", self.table);
        let table = self.cache.run(&sql)?;
        let index = table.require_column(MAKE)?;
        let makes = table
            .column_values(index)
            .filter_map(Value::as_text)
            .map(str::to_string)
            .collect::<Vec<_>>();
        if makes.is_empty() {
            return Err(PipelineError::EmptyResult(format!("no makes in {}", self.table)));
        }
        Ok(makes)
    }

    /// Release years available for `make`, newest first.
    pub fn years(&mut self, make: &str) -> Result<Vec<i64>, PipelineError> {
        let years = match self.mode {
            DashboardMode::CloudHeavy => {
                let sql = format!(
                    "SELECT DISTINCT release_year FROM {} WHERE make = {} \
                     ORDER BY release_year DESC",
                    self.table,
                    sql_literal(make)
                );
                distinct_years(self.cache.run(&sql)?)?
            }
            DashboardMode::SmartBuffer => distinct_years(self.brand_pool(make)?)?,
        };
        if years.is_empty() {
            return Err(PipelineError::EmptyResult(format!("no release years for {make}")));
        }
        Ok(years)
    }

    pub fn view(&mut self, make: &str, year: i64) -> Result<DashboardView, PipelineError> {
        info!(make, year, mode = %self.mode, "loading dashboard selection");
        match self.mode {
            DashboardMode::CloudHeavy => self.cloud_view(make, year),
            DashboardMode::SmartBuffer => self.buffered_view(make, year),
        }
    }

    fn selection(&self, make: &str, year: i64) -> String {
        format!(
            "FROM {} WHERE make = {} AND release_year = {year}",
            self.table,
            sql_literal(make)
        )
    }

    fn brand_pool(&mut self, make: &str) -> Result<&Table, PipelineError> {
        let sql = format!(
            "SELECT release_year, sellingprice, odometer, condition, state, model \
             FROM {} WHERE make = {}",
            self.table,
            sql_literal(make)
        );
        self.cache.run(&sql)
    }

    fn cloud_view(&mut self, make: &str, year: i64) -> Result<DashboardView, PipelineError> {
        let selection = self.selection(make, year);

        let metrics_sql = format!(
            "SELECT count(*) as total_offers, avg(sellingprice) as avg_price, \
             avg(odometer) as avg_mileage {selection}"
        );
        let metrics = metrics_from_row(self.cache.run(&metrics_sql)?)?;

        let charts_sql = format!("SELECT condition, sellingprice, odometer, model {selection}");
        let charts = self.cache.run(&charts_sql)?;
        let price_by_condition = report::price_by_condition(charts)?;
        let price_vs_mileage = scatter_points(charts)?;

        let states_sql = format!(
            "SELECT state, count(*) as count, avg(sellingprice) as avg_price {selection} \
             GROUP BY state ORDER BY count DESC"
        );
        let states = states_from_rows(self.cache.run(&states_sql)?)?;

        Ok(DashboardView {
            make: make.to_string(),
            year,
            metrics,
            price_by_condition,
            price_vs_mileage,
            states,
            deals: None,
        })
    }

    fn buffered_view(&mut self, make: &str, year: i64) -> Result<DashboardView, PipelineError> {
        let pool = self.brand_pool(make)?;
        let year_index = pool.require_column(RELEASE_YEAR)?;
        let selected = pool.filter(|row| row[year_index].as_i64() == Some(year));
        Ok(DashboardView {
            make: make.to_string(),
            year,
            metrics: report::brand_metrics(&selected)?,
            price_by_condition: report::price_by_condition(&selected)?,
            price_vs_mileage: scatter_points(&selected)?,
            states: report::state_breakdown(&selected)?,
            deals: Some(report::top_deals(&selected, report::TOP_DEALS)?),
        })
    }
}

fn distinct_years(table: &Table) -> Result<Vec<i64>, PipelineError> {
    let index = table.require_column(RELEASE_YEAR)?;
    let mut years = table
        .column_values(index)
        .filter_map(Value::as_i64)
        .collect::<Vec<_>>();
    years.sort_unstable_by(|a, b| b.cmp(a));
    years.dedup();
    Ok(years)
}

fn scatter_points(table: &Table) -> Result<Vec<(f64, f64)>, PipelineError> {
    let mileage = table.require_column(ODOMETER)?;
    let price = table.require_column(SELLING_PRICE)?;
    Ok(table
        .rows()
        .iter()
        .filter_map(|row| Some((row[mileage].as_f64()?, row[price].as_f64()?)))
        .collect())
}

fn metrics_from_row(table: &Table) -> Result<BrandMetrics, PipelineError> {
    let offers = table.require_column("total_offers")?;
    let price = table.require_column("avg_price")?;
    let mileage = table.require_column("avg_mileage")?;
    Ok(table
        .rows()
        .first()
        .map(|row| BrandMetrics {
            total_offers: row[offers].as_i64().unwrap_or(0).max(0) as usize,
            avg_price: row[price].as_f64(),
            avg_mileage: row[mileage].as_f64(),
        })
        .unwrap_or_default())
}

fn states_from_rows(table: &Table) -> Result<Vec<StateSummary>, PipelineError> {
    let state = table.require_column(report::STATE)?;
    let count = table.require_column("count")?;
    let price = table.require_column("avg_price")?;
    Ok(table
        .rows()
        .iter()
        .filter_map(|row| {
            Some(StateSummary {
                state: row[state].as_text()?.to_string(),
                count: row[count].as_i64().unwrap_or(0).max(0) as usize,
                avg_price: row[price].as_f64(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use assert_matches::assert_matches;

    use super::*;

    struct ScriptedEngine {
        calls: RefCell<Vec<String>>,
    }

    impl ScriptedEngine {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn text(value: &str) -> Value {
        Value::Text(value.to_string())
    }

    fn sale(
        year: i64,
        price: f64,
        mileage: f64,
        condition: f64,
        state: &str,
        model: &str,
    ) -> Vec<Value> {
        vec![
            Value::Int(year),
            Value::Float(price),
            Value::Float(mileage),
            Value::Float(condition),
            text(state),
            text(model),
        ]
    }

    impl QueryEngine for ScriptedEngine {
        fn execute(&self, request: &QueryRequest) -> Result<Table, PipelineError> {
            self.calls.borrow_mut().push(request.sql.clone());
            let sql = request.sql.as_str();
            let table = if sql.starts_with("SELECT DISTINCT make") {
                Table::from_rows(columns(&["make"]), vec![vec![text("Kia")], vec![text("BMW")]])
            } else if sql.starts_with("SELECT DISTINCT release_year") {
                Table::from_rows(
                    columns(&["release_year"]),
                    vec![vec![Value::Int(2015)], vec![Value::Int(2014)]],
                )
            } else if sql.starts_with("SELECT count(*) as total_offers") {
                Table::from_rows(
                    columns(&["total_offers", "avg_price", "avg_mileage"]),
                    vec![vec![Value::Int(2), Value::Float(15000.0), Value::Float(20000.0)]],
                )
            } else if sql.starts_with("SELECT condition") {
                Table::from_rows(
                    columns(&["condition", "sellingprice", "odometer", "model"]),
                    vec![
                        vec![
                            Value::Float(4.0),
                            Value::Float(20000.0),
                            Value::Float(10000.0),
                            text("Sorento"),
                        ],
                        vec![
                            Value::Float(2.0),
                            Value::Float(10000.0),
                            Value::Float(30000.0),
                            text("Rio"),
                        ],
                    ],
                )
            } else if sql.starts_with("SELECT state") {
                Table::from_rows(
                    columns(&["state", "count", "avg_price"]),
                    vec![vec![text("ca"), Value::Int(2), Value::Float(15000.0)]],
                )
            } else {
                Table::from_rows(
                    columns(&[
                        "release_year",
                        "sellingprice",
                        "odometer",
                        "condition",
                        "state",
                        "model",
                    ]),
                    vec![
                        sale(2015, 20000.0, 10000.0, 4.0, "ca", "Sorento"),
                        sale(2015, 400.0, 90000.0, 1.0, "fl", "Rio"),
                        sale(2014, 9000.0, 50000.0, 3.0, "ca", "Optima"),
                    ],
                )
            };
            table
        }
    }

    fn data(mode: DashboardMode) -> DashboardData<ScriptedEngine> {
        let template = QueryRequest {
            sql: String::new(),
            database: "default".to_string(),
            output_location: "s3://bucket/athena-results/".to_string(),
            workgroup: None,
        };
        DashboardData::new(
            QueryCache::new(ScriptedEngine::new(), template),
            "vehicle_sales_parquet",
            mode,
        )
    }

    #[test]
    fn smart_buffer_queries_once_per_brand() {
        let mut dashboard = data(DashboardMode::SmartBuffer);
        assert_eq!(dashboard.makes().unwrap(), vec!["Kia", "BMW"]);
        assert_eq!(dashboard.years("Kia").unwrap(), vec![2015, 2014]);
        let newer = dashboard.view("Kia", 2015).unwrap();
        let older = dashboard.view("Kia", 2014).unwrap();
        assert_eq!(dashboard.queries_executed(), 2);

        assert_eq!(newer.metrics.total_offers, 2);
        assert_eq!(newer.deals.as_ref().map(Vec::len), Some(1));
        assert_eq!(older.metrics.avg_price, Some(9000.0));
    }

    #[test]
    fn cloud_heavy_queries_per_widget_and_memoizes() {
        let mut dashboard = data(DashboardMode::CloudHeavy);
        let view = dashboard.view("Kia", 2015).unwrap();
        assert_eq!(dashboard.queries_executed(), 3);
        assert_eq!(view.metrics.avg_price, Some(15000.0));
        assert_eq!(view.price_by_condition.len(), 2);
        assert_eq!(view.states[0].count, 2);
        assert!(view.deals.is_none());

        dashboard.view("Kia", 2015).unwrap();
        assert_eq!(dashboard.queries_executed(), 3);
    }

    #[test]
    fn filter_values_are_escaped() {
        let mut dashboard = data(DashboardMode::CloudHeavy);
        dashboard.years("Land O'Rover").unwrap();
        let calls = dashboard.cache.engine.calls.borrow();
        assert!(calls[0].contains("make = 'Land O''Rover'"));
    }

    #[test]
    fn mode_parses() {
        assert_eq!("cloud-heavy".parse::<DashboardMode>().unwrap(), DashboardMode::CloudHeavy);
        assert_matches!(
            "hybrid".parse::<DashboardMode>(),
            Err(PipelineError::ConfigValue { .. })
        );
    }
}
