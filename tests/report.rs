use std::path::{Path, PathBuf};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use vehicle_sales_pipeline::app::{Pipeline, ProgressEvent, ProgressSink};
use vehicle_sales_pipeline::catalog::CatalogClient;
use vehicle_sales_pipeline::config::{Config, ConfigLoader};
use vehicle_sales_pipeline::domain::DatasetSlug;
use vehicle_sales_pipeline::error::PipelineError;
use vehicle_sales_pipeline::notify::LogNotifier;
use vehicle_sales_pipeline::object_store::LocalObjectStore;
use vehicle_sales_pipeline::query::{QueryAdapter, QueryEngine, QueryRequest, analysis_sql};
use vehicle_sales_pipeline::report::{
    AnalysisReport, MAKE, MARKET_VALUE, SALE_PRICE, TOP_OVERPRICED, top_overpriced_makes,
    with_price_diff,
};
use vehicle_sales_pipeline::table::{Table, Value};

struct FixedEngine(Table);

impl QueryEngine for FixedEngine {
    fn execute(&self, _request: &QueryRequest) -> Result<Table, PipelineError> {
        Ok(self.0.clone())
    }
}

struct NoCatalog;

impl CatalogClient for NoCatalog {
    fn download(
        &self,
        _slug: &DatasetSlug,
        _destination: &Path,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        Err(PipelineError::SourceUnavailable("offline".to_string()))
    }
}

struct Silent;

impl ProgressSink for Silent {
    fn event(&self, _event: ProgressEvent) {}
}

fn sales_table() -> Table {
    let row = |make: &str, sale: f64, market: f64| {
        vec![
            Value::Text(make.to_string()),
            Value::Float(sale),
            Value::Float(market),
        ]
    };
    Table::from_rows(
        vec![
            MAKE.to_string(),
            SALE_PRICE.to_string(),
            MARKET_VALUE.to_string(),
        ],
        vec![
            row("Honda", 20000.0, 18000.0),
            row("Honda", 30000.0, 18000.0),
            row("Ford", 10000.0, 18000.0),
        ],
    )
    .unwrap()
}

fn empty_table() -> Table {
    Table::new(vec![
        MAKE.to_string(),
        SALE_PRICE.to_string(),
        MARKET_VALUE.to_string(),
    ])
}

fn request() -> QueryRequest {
    QueryRequest {
        sql: analysis_sql("v_vehicle_sales_clean"),
        database: "default".to_string(),
        output_location: "s3://sales/athena-results/".to_string(),
        workgroup: None,
    }
}

#[test]
fn overpriced_ranking_uses_mean_difference_per_make() {
    let enriched = with_price_diff(&sales_table()).unwrap();

    let ranked = top_overpriced_makes(&enriched, TOP_OVERPRICED).unwrap();

    assert_eq!(ranked.len(), 2);
    assert_eq!(ranked[0].make, "Honda");
    assert_eq!(ranked[0].value, 7000.0);
    assert_eq!(ranked[1].make, "Ford");
    assert_eq!(ranked[1].value, -8000.0);
}

#[test]
fn empty_query_surfaces_as_empty_result() {
    let adapter = QueryAdapter::new(FixedEngine(empty_table()));

    assert_matches!(adapter.fetch(&request()), Err(PipelineError::EmptyResult(_)));
}

#[test]
fn empty_table_does_not_crash_aggregation() {
    assert_matches!(
        AnalysisReport::build(&empty_table()),
        Err(PipelineError::EmptyResult(_))
    );
}

#[test]
fn analyze_builds_report_and_chart() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let mut config = ConfigLoader::resolve_config(Config::default()).unwrap();
    config.reports_dir = root.join("reports");
    let pipeline = Pipeline::new(
        config,
        NoCatalog,
        LocalObjectStore::new(root.join("store")),
        LogNotifier,
    );

    let report = pipeline
        .analyze(FixedEngine(sales_table()), &Silent)
        .unwrap();

    assert_eq!(report.rows, 3);
    assert_eq!(report.top_makes[0].make, "Honda");
    assert_eq!(report.top_makes[0].value, 25000.0);
    let chart = report.chart_path.as_deref().unwrap();
    assert!(Path::new(chart).exists());
    assert!(report.to_string().contains("OVERPRICED MAKES"));
}

#[test]
fn analyze_with_no_rows_is_empty_result() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let mut config = ConfigLoader::resolve_config(Config::default()).unwrap();
    config.reports_dir = root.join("reports");
    let pipeline = Pipeline::new(
        config,
        NoCatalog,
        LocalObjectStore::new(root.join("store")),
        LogNotifier,
    );

    assert_matches!(
        pipeline.analyze(FixedEngine(empty_table()), &Silent),
        Err(PipelineError::EmptyResult(_))
    );
    assert!(!root.join("reports").exists());
}
