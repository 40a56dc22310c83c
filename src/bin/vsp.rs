use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vehicle_sales_pipeline::app::{Pipeline, ProgressSink, RunResult};
use vehicle_sales_pipeline::catalog::{CatalogClient, KaggleHttpClient};
use vehicle_sales_pipeline::cloud::CloudContext;
use vehicle_sales_pipeline::config::{ConfigLoader, ConfigOverrides, ResolvedConfig, StoreBackend};
use vehicle_sales_pipeline::credentials::KaggleCredentials;
use vehicle_sales_pipeline::dashboard::{DashboardData, DashboardMode, DashboardView, QueryCache};
use vehicle_sales_pipeline::domain::{DatasetSlug, ObjectLocation, PartitionStrategy};
use vehicle_sales_pipeline::error::PipelineError;
use vehicle_sales_pipeline::notify::{LogNotifier, Notifier, SnsNotifier};
use vehicle_sales_pipeline::object_store::{
    LocalObjectStore, ObjectStore, S3ObjectStore, UnavailableStore,
};
use vehicle_sales_pipeline::output::{ConsoleOutput, JsonOutput, OutputMode};
use vehicle_sales_pipeline::query::{AthenaQueryEngine, QueryRequest};
use vehicle_sales_pipeline::refine::{RefineReport, RefineRequest, RefinementJob};
use vehicle_sales_pipeline::tui::{Tui, thousands};

#[derive(Parser)]
#[command(name = "vsp")]
#[command(about = "Vehicle sales pipeline: Kaggle download, S3 upload, \
                  Parquet refinement, Athena analysis")]
#[command(version, author)]
struct Cli {
    /// Path to a JSON config file (defaults to ./vsp.json when present).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print results as JSON instead of console text.
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    overrides: OverrideArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Default)]
struct OverrideArgs {
    #[arg(long, global = true)]
    dataset: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<String>,

    /// `s3` or `local:<dir>`.
    #[arg(long, global = true)]
    store: Option<String>,

    #[arg(long, global = true)]
    bucket: Option<String>,

    #[arg(long, global = true)]
    region: Option<String>,

    #[arg(long, global = true)]
    partition_strategy: Option<PartitionStrategy>,

    /// Store raw files under `raw_data/<YYYY-MM-DD>/`.
    #[arg(long, global = true)]
    date_partitioned_raw_key: bool,

    #[arg(long, global = true)]
    topic_arn: Option<String>,

    #[arg(long, global = true)]
    reports_dir: Option<String>,
}

impl From<OverrideArgs> for ConfigOverrides {
    fn from(args: OverrideArgs) -> Self {
        ConfigOverrides {
            dataset: args.dataset,
            data_dir: args.data_dir,
            store: args.store,
            bucket: args.bucket,
            region: args.region,
            partition_strategy: args.partition_strategy,
            date_partitioned_raw_key: args.date_partitioned_raw_key.then_some(true),
            topic_arn: args.topic_arn,
            reports_dir: args.reports_dir,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download, upload, refine and analyze (default)")]
    Run(RunArgs),
    #[command(about = "Download and extract the dataset into the data directory")]
    Download,
    #[command(about = "Upload a local CSV to the raw key")]
    Upload(UploadArgs),
    #[command(about = "Scheduled ingest: download to a scratch dir and upload the CSV")]
    Ingest(DateArgs),
    #[command(about = "Refine the raw CSV into partitioned Parquet")]
    Refine(RefineArgs),
    #[command(about = "Query the cleaned view, print statistics and render the chart")]
    Analyze,
    #[command(about = "Interactive brand/year dashboard")]
    Dashboard(DashboardArgs),
}

#[derive(Args, Clone, Default)]
struct DateArgs {
    /// Logical run date, YYYY-MM-DD (defaults to today).
    #[arg(long)]
    date: Option<NaiveDate>,
}

impl DateArgs {
    fn resolve(&self) -> NaiveDate {
        self.date.unwrap_or_else(|| Local::now().date_naive())
    }
}

#[derive(Args, Clone, Default)]
struct RunArgs {
    #[command(flatten)]
    date: DateArgs,

    #[arg(long)]
    skip_analysis: bool,
}

#[derive(Args, Clone)]
struct UploadArgs {
    /// Local file (defaults to <data_dir>/car_prices.csv).
    file: Option<PathBuf>,

    #[command(flatten)]
    date: DateArgs,
}

#[derive(Args, Clone)]
struct RefineArgs {
    #[command(flatten)]
    date: DateArgs,

    /// Raw CSV location (`s3://bucket/key`); defaults to the configured raw key.
    #[arg(long)]
    source: Option<String>,
}

#[derive(Args, Clone)]
struct DashboardArgs {
    #[arg(long, value_enum, default_value_t = DashboardMode::SmartBuffer)]
    mode: DashboardMode,

    /// Print one selection instead of opening the terminal UI.
    #[arg(long, requires = "year")]
    make: Option<String>,

    #[arg(long, requires = "make")]
    year: Option<i64>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(pipeline) = report.downcast_ref::<PipelineError>() {
            return ExitCode::from(map_exit_code(pipeline));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error {
        PipelineError::SourceUnavailable(_)
        | PipelineError::EmptyResult(_)
        | PipelineError::MissingConfig(_) => 2,
        PipelineError::WriteFailed(_)
        | PipelineError::CatalogHttp(_)
        | PipelineError::CatalogStatus { .. }
        | PipelineError::QueryFailed { .. }
        | PipelineError::Notification(_) => 3,
        PipelineError::CredentialsMissing(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Console
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    ConfigLoader::apply_overrides(&mut config, cli.overrides.into())?;
    info!(store = ?config.store, bucket = %config.bucket, "configuration resolved");

    let mut services = Services::new(config);
    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run_everything(&mut services, args, output_mode),
        Commands::Download => run_download(&mut services, output_mode),
        Commands::Upload(args) => run_upload(&mut services, args, output_mode),
        Commands::Ingest(args) => run_ingest(&mut services, args, output_mode),
        Commands::Refine(args) => run_refine(&mut services, args, output_mode),
        Commands::Analyze => run_analyze(&mut services, output_mode),
        Commands::Dashboard(args) => run_dashboard(&mut services, args, output_mode),
    }
}

type CliPipeline = Pipeline<Box<dyn CatalogClient>, Box<dyn ObjectStore>, Box<dyn Notifier>>;

/// Builds clients lazily so offline commands never touch AWS.
struct Services {
    config: ResolvedConfig,
    cloud: Option<Arc<CloudContext>>,
}

impl Services {
    fn new(config: ResolvedConfig) -> Self {
        Self {
            config,
            cloud: None,
        }
    }

    fn cloud(&mut self) -> Result<Arc<CloudContext>, PipelineError> {
        if let Some(cloud) = &self.cloud {
            return Ok(cloud.clone());
        }
        let cloud = CloudContext::new(&self.config.aws)?;
        self.cloud = Some(cloud.clone());
        Ok(cloud)
    }

    /// Missing AWS credentials yield a store whose calls fail, so the
    /// download step still runs and the upload step reports the failure.
    fn store(&mut self) -> Result<Box<dyn ObjectStore>, PipelineError> {
        if let StoreBackend::Local(root) = &self.config.store {
            return Ok(Box::new(LocalObjectStore::new(root.clone())));
        }
        match self.cloud() {
            Ok(cloud) => Ok(Box::new(S3ObjectStore::new(cloud))),
            Err(PipelineError::CredentialsMissing(reason)) => {
                warn!(%reason, "AWS credentials missing; object store calls will fail");
                Ok(Box::new(UnavailableStore::new(reason)))
            }
            Err(err) => Err(err),
        }
    }

    fn notifier(&mut self) -> Result<Box<dyn Notifier>, PipelineError> {
        let Some(topic_arn) = self.config.alerts.topic_arn.clone() else {
            return Ok(Box::new(LogNotifier));
        };
        match self.cloud() {
            Ok(cloud) => Ok(Box::new(SnsNotifier::new(cloud, topic_arn))),
            Err(PipelineError::CredentialsMissing(reason)) => {
                warn!(%reason, "AWS credentials missing; alerts go to the log");
                Ok(Box::new(LogNotifier))
            }
            Err(err) => Err(err),
        }
    }

    /// A catalog that fails every download when credentials are missing,
    /// so the failure surfaces at the download step.
    fn catalog(&self) -> Box<dyn CatalogClient> {
        let client = KaggleCredentials::resolve(self.config.kaggle_config_dir.as_deref())
            .and_then(KaggleHttpClient::new);
        match client {
            Ok(client) => Box::new(client),
            Err(err) => Box::new(UnavailableCatalog(err.to_string())),
        }
    }

    fn pipeline(&mut self) -> Result<CliPipeline, PipelineError> {
        let catalog = self.catalog();
        let store = self.store()?;
        let notifier = self.notifier()?;
        Ok(Pipeline::new(self.config.clone(), catalog, store, notifier))
    }

    fn engine(&mut self) -> Result<AthenaQueryEngine, PipelineError> {
        Ok(AthenaQueryEngine::new(self.cloud()?))
    }
}

struct UnavailableCatalog(String);

impl CatalogClient for UnavailableCatalog {
    fn download(
        &self,
        _slug: &DatasetSlug,
        _destination: &Path,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        Err(PipelineError::CredentialsMissing(self.0.clone()))
    }
}

fn sink(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::Console => &ConsoleOutput,
        OutputMode::Json => &JsonOutput,
    }
}

fn run_everything(
    services: &mut Services,
    args: RunArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let pipeline = services.pipeline()?;
    let analyze = !args.skip_analysis && services.config.store == StoreBackend::S3;
    if !analyze && !args.skip_analysis {
        info!("local store in use; analysis needs the managed query engine and is skipped");
    }
    let engine = if analyze {
        match services.engine() {
            Ok(engine) => Some(engine),
            Err(PipelineError::CredentialsMissing(reason)) => {
                warn!(%reason, "AWS credentials missing; analysis is skipped");
                None
            }
            Err(err) => return Err(err.into()),
        }
    } else {
        None
    };
    let result = pipeline.run_everything(engine, args.date.resolve(), sink(output_mode))?;
    match output_mode {
        OutputMode::Json => JsonOutput::print(&result).map_err(filesystem)?,
        OutputMode::Console => print_run_summary(&result),
    }
    if !result.completed {
        return Err(miette::Report::msg("pipeline stopped before completion"));
    }
    Ok(())
}

fn run_download(services: &mut Services, output_mode: OutputMode) -> miette::Result<()> {
    let pipeline = services.pipeline()?;
    let result = pipeline.download(sink(output_mode));
    match output_mode {
        OutputMode::Json => JsonOutput::print(&result).map_err(filesystem)?,
        OutputMode::Console => {
            for file in &result.files {
                println!("{file}");
            }
        }
    }
    if !result.ok {
        return Err(miette::Report::msg("download failed"));
    }
    Ok(())
}

fn run_upload(
    services: &mut Services,
    args: UploadArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let pipeline = services.pipeline()?;
    let local = args
        .file
        .unwrap_or_else(|| services.config.local_raw_path().into_std_path_buf());
    let result = pipeline.upload(&local, args.date.resolve(), sink(output_mode));
    match output_mode {
        OutputMode::Json => JsonOutput::print(&result).map_err(filesystem)?,
        OutputMode::Console if result.ok => println!("Upload Successful! {}", result.location),
        OutputMode::Console => {}
    }
    if !result.ok {
        return Err(miette::Report::msg("upload failed"));
    }
    Ok(())
}

fn run_ingest(
    services: &mut Services,
    args: DateArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let pipeline = services.pipeline()?;
    let raw_key = services.config.raw_key(args.resolve());
    let response = pipeline.ingest_job().run(&raw_key);
    match output_mode {
        OutputMode::Json => JsonOutput::print(&response).map_err(filesystem)?,
        OutputMode::Console => println!("{} {}", response.status_code, response.body),
    }
    if !response.is_success() {
        return Err(miette::Report::msg(format!(
            "ingest job returned status {}",
            response.status_code
        )));
    }
    Ok(())
}

fn run_refine(
    services: &mut Services,
    args: RefineArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let run_date = args.date.resolve();
    let report = match args.source {
        Some(source) => {
            let source: ObjectLocation = source.parse()?;
            let request = RefineRequest {
                destination: ObjectLocation::new(
                    &services.config.bucket,
                    &services.config.refined_prefix,
                ),
                source,
                run_date,
                strategy: services.config.partition_strategy,
            };
            let job = RefinementJob::new(services.store()?, services.notifier()?);
            job.run(&request)?
        }
        None => services.pipeline()?.refine(run_date, sink(output_mode))?,
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print(&report).map_err(filesystem)?,
        OutputMode::Console => print_refine_summary(&report),
    }
    Ok(())
}

fn run_analyze(services: &mut Services, output_mode: OutputMode) -> miette::Result<()> {
    let engine = services.engine()?;
    let pipeline = services.pipeline()?;
    let report = pipeline.analyze(engine, sink(output_mode))?;
    match output_mode {
        OutputMode::Json => JsonOutput::print(&report).map_err(filesystem)?,
        OutputMode::Console => print!("{report}"),
    }
    Ok(())
}

fn run_dashboard(
    services: &mut Services,
    args: DashboardArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let engine = services.engine()?;
    let template = QueryRequest::new(
        "",
        &services.config.athena,
        &services.config.athena_output_location(),
    );
    let mut data = DashboardData::new(
        QueryCache::new(engine, template),
        services.config.athena.table.clone(),
        args.mode,
    );

    if let (Some(make), Some(year)) = (args.make, args.year) {
        let view = data.view(&make, year)?;
        match output_mode {
            OutputMode::Json => JsonOutput::print(&view).map_err(filesystem)?,
            OutputMode::Console => print_dashboard_view(&view),
        }
        return Ok(());
    }

    if matches!(output_mode, OutputMode::Json) {
        warn!("--json needs --make and --year for the dashboard; opening the terminal UI");
    }
    let mut tui = Tui::new(data)?;
    tui.run()
}

fn filesystem(err: std::io::Error) -> PipelineError {
    PipelineError::Filesystem(err.to_string())
}

fn print_run_summary(result: &RunResult) {
    let green = "\x1b[32m";
    let red = "\x1b[31m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}--- STEP 1: DOWNLOADING DATA ---{reset}");
    let mark = |ok: bool| {
        if ok {
            format!("{green}ok{reset}")
        } else {
            format!("{red}failed{reset}")
        }
    };
    println!("download {}: {}", result.download.dataset, mark(result.download.ok));
    if let Some(upload) = &result.upload {
        println!("{cyan}--- STEP 2: UPLOADING TO OBJECT STORE ---{reset}");
        println!("upload {} -> {}: {}", upload.local, upload.location, mark(upload.ok));
    }
    if let Some(refine) = &result.refine {
        println!("{cyan}--- STEP 3: REFINING ---{reset}");
        print_refine_summary(refine);
    }
    if let Some(analysis) = &result.analysis {
        println!("{cyan}--- STEP 4: ANALYZING AND VISUALIZING ---{reset}");
        print!("{analysis}");
    }
    if result.completed {
        println!("{green}PIPELINE COMPLETED SUCCESSFULLY!{reset}");
    } else {
        error!("pipeline stopped after a failed step");
    }
}

fn print_refine_summary(report: &RefineReport) {
    println!(
        "refined {} row(s) from {} ({} skipped)",
        report.rows_read, report.source, report.rows_skipped
    );
    for write in &report.partitions {
        println!("  {} {} rows, {} bytes", write.location, write.rows, write.bytes);
    }
    if !report.retained.is_empty() {
        let retained = report
            .retained
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        println!("  untouched: {}", retained.join(", "));
    }
}

fn print_dashboard_view(view: &DashboardView) {
    println!("Price analysis for the brand {} ({})", view.make, view.year);
    println!("  offers:        {}", view.metrics.total_offers);
    if let Some(price) = view.metrics.avg_price {
        println!("  average price: ${}", thousands(price, 2));
    }
    if let Some(mileage) = view.metrics.avg_mileage {
        println!("  avg mileage:   {} mil", thousands(mileage, 0));
    }
    println!("Price vs condition");
    for entry in &view.price_by_condition {
        println!("  {:>5} {:>14}", entry.condition, thousands(entry.avg_price, 2));
    }
    println!("States");
    for state in &view.states {
        println!("  {:<4} {:>6}", state.state, state.count);
    }
    if let Some(deals) = &view.deals {
        println!("Top {} best value deals", deals.len());
        for deal in deals {
            println!(
                "  {:<16} ${:>12} {}",
                deal.model.as_deref().unwrap_or("-"),
                thousands(deal.price, 2),
                deal.state.as_deref().unwrap_or("-")
            );
        }
    }
}
