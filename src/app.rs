use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::catalog::CatalogClient;
use crate::chart::render_top_makes;
use crate::config::{ALERT_SUBJECT, ResolvedConfig};
use crate::domain::{DatasetSlug, ObjectLocation};
use crate::error::PipelineError;
use crate::fs_util::find_csv;
use crate::notify::Notifier;
use crate::object_store::ObjectStore;
use crate::query::{QueryAdapter, QueryEngine, QueryRequest, analysis_sql};
use crate::refine::{RefineReport, RefineRequest, RefinementJob};
use crate::report::AnalysisReport;
use crate::table::Table;

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub ok: bool,
    pub dataset: String,
    pub files: Vec<String>,
    pub csv: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub ok: bool,
    pub local: String,
    pub location: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub download: DownloadResult,
    pub upload: Option<UploadResult>,
    pub refine: Option<RefineReport>,
    pub analysis: Option<AnalysisReport>,
    pub completed: bool,
}

/// Outcome of the scheduled ingest job; `body` is a JSON-encoded message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResponse {
    pub status_code: u16,
    pub body: String,
}

impl JobResponse {
    fn new(status_code: u16, message: &str) -> Self {
        let body = serde_json::to_string(message).unwrap_or_else(|_| format!("\"{message}\""));
        Self { status_code, body }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn step(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
        }
    }

    pub fn finished(message: impl Into<String>, started: Instant) -> Self {
        Self {
            message: message.into(),
            elapsed: Some(started.elapsed()),
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Uploads `local` to `location`. Failures are logged and reported as `false`.
pub fn upload_file<S: ObjectStore + ?Sized>(
    store: &S,
    local: &Path,
    location: &ObjectLocation,
) -> bool {
    match store.put_file(local, location) {
        Ok(()) => {
            info!(local = %local.display(), object = %location, "upload successful");
            true
        }
        Err(PipelineError::SourceUnavailable(message)) => {
            error!(local = %local.display(), %message, "the file was not found");
            false
        }
        Err(PipelineError::CredentialsMissing(message)) => {
            error!(%message, "credentials not available");
            false
        }
        Err(err) => {
            error!(object = %location, error = %err, "upload failed");
            false
        }
    }
}

/// Downloads `slug` into `dir` and returns the extracted files.
/// Failures are logged and reported as `None`.
pub fn download_dataset<C: CatalogClient + ?Sized>(
    catalog: &C,
    slug: &DatasetSlug,
    dir: &Path,
) -> Option<Vec<PathBuf>> {
    match catalog.download(slug, dir) {
        Ok(files) => Some(files),
        Err(err) => {
            error!(dataset = %slug, error = %err, "download failed");
            None
        }
    }
}

/// Scheduled download-then-upload job.
///
/// Works in a scratch directory that is removed afterwards and never raises:
/// every failure becomes a 500 response, optionally followed by an alert.
pub struct IngestJob<C: CatalogClient, S: ObjectStore, N: Notifier> {
    catalog: C,
    store: S,
    notifier: N,
    dataset: DatasetSlug,
    bucket: String,
    notify_on_failure: bool,
}

impl<C: CatalogClient, S: ObjectStore, N: Notifier> IngestJob<C, S, N> {
    pub fn new(
        catalog: C,
        store: S,
        notifier: N,
        dataset: DatasetSlug,
        bucket: impl Into<String>,
        notify_on_failure: bool,
    ) -> Self {
        Self {
            catalog,
            store,
            notifier,
            dataset,
            bucket: bucket.into(),
            notify_on_failure,
        }
    }

    /// `raw_key` is the destination key, flat or date-keyed.
    pub fn run(&self, raw_key: &str) -> JobResponse {
        let location = ObjectLocation::new(&self.bucket, raw_key);
        match self.ingest(&location) {
            Ok(()) => JobResponse::new(
                200,
                &format!("Pipeline SUCCESS! Data updated in {location}."),
            ),
            Err(err) => {
                error!(error = %err, "ingest failed");
                if self.notify_on_failure {
                    let message = format!("Ingest failed: {err}");
                    if let Err(alert_err) = self.notifier.publish(ALERT_SUBJECT, &message) {
                        warn!(error = %alert_err, "failed to publish ingest alert");
                    }
                }
                JobResponse::new(500, &format!("Pipeline failed: {err}"))
            }
        }
    }

    fn ingest(&self, location: &ObjectLocation) -> Result<(), PipelineError> {
        let scratch = tempfile::Builder::new()
            .prefix("vsp-ingest")
            .tempdir()
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        info!(dataset = %self.dataset, "downloading dataset");
        let files = self.catalog.download(&self.dataset, scratch.path())?;
        info!(files = files.len(), "dataset extracted");
        let csv = find_csv(scratch.path())?;
        info!(local = %csv.display(), object = %location, "uploading raw file");
        self.store.put_file(&csv, location)
    }
}

/// The interactive pipeline: download, upload, refine, analyze.
pub struct Pipeline<C: CatalogClient, S: ObjectStore, N: Notifier> {
    config: ResolvedConfig,
    catalog: C,
    store: S,
    notifier: N,
}

impl<C: CatalogClient, S: ObjectStore, N: Notifier> Pipeline<C, S, N> {
    pub fn new(config: ResolvedConfig, catalog: C, store: S, notifier: N) -> Self {
        Self {
            config,
            catalog,
            store,
            notifier,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn raw_location(&self, run_date: NaiveDate) -> ObjectLocation {
        ObjectLocation::new(&self.config.bucket, self.config.raw_key(run_date))
    }

    pub fn refined_root(&self) -> ObjectLocation {
        ObjectLocation::new(&self.config.bucket, &self.config.refined_prefix)
    }

    pub fn download(&self, sink: &dyn ProgressSink) -> DownloadResult {
        let started = Instant::now();
        let dir = &self.config.data_dir;
        sink.event(ProgressEvent::step(format!(
            "downloading {} into {dir}",
            self.config.dataset
        )));
        let dataset = self.config.dataset.to_string();
        let Some(files) = download_dataset(&self.catalog, &self.config.dataset, dir.as_std_path())
        else {
            sink.event(ProgressEvent::finished("download failed", started));
            return DownloadResult {
                ok: false,
                dataset,
                files: Vec::new(),
                csv: None,
            };
        };
        let csv = find_csv(dir.as_std_path())
            .map_err(|err| warn!(error = %err, "no CSV among downloaded files"))
            .ok();
        sink.event(ProgressEvent::finished(
            format!("downloaded {} file(s)", files.len()),
            started,
        ));
        DownloadResult {
            ok: true,
            dataset,
            files: files.iter().map(|path| path.display().to_string()).collect(),
            csv: csv.map(|path| path.display().to_string()),
        }
    }

    pub fn upload(
        &self,
        local: &Path,
        run_date: NaiveDate,
        sink: &dyn ProgressSink,
    ) -> UploadResult {
        let started = Instant::now();
        let location = self.raw_location(run_date);
        sink.event(ProgressEvent::step(format!(
            "uploading {} to {location}",
            local.display()
        )));
        let ok = upload_file(&self.store, local, &location);
        sink.event(ProgressEvent::finished(
            if ok { "upload successful" } else { "upload failed" },
            started,
        ));
        UploadResult {
            ok,
            local: local.display().to_string(),
            location: location.to_string(),
        }
    }

    pub fn refine(
        &self,
        run_date: NaiveDate,
        sink: &dyn ProgressSink,
    ) -> Result<RefineReport, PipelineError> {
        let started = Instant::now();
        let request = RefineRequest {
            source: self.raw_location(run_date),
            destination: self.refined_root(),
            run_date,
            strategy: self.config.partition_strategy,
        };
        sink.event(ProgressEvent::step(format!(
            "refining {} into {}",
            request.source, request.destination
        )));
        let report = RefinementJob::new(&self.store, &self.notifier).run(&request)?;
        sink.event(ProgressEvent::finished(
            format!("wrote {} partition(s)", report.partitions.len()),
            started,
        ));
        Ok(report)
    }

    pub fn analysis_request(&self) -> QueryRequest {
        QueryRequest::new(
            analysis_sql(&self.config.athena.view),
            &self.config.athena,
            &self.config.athena_output_location(),
        )
    }

    /// Queries the cleaned view, aggregates it and renders the chart.
    pub fn analyze<E: QueryEngine>(
        &self,
        engine: E,
        sink: &dyn ProgressSink,
    ) -> Result<AnalysisReport, PipelineError> {
        let started = Instant::now();
        sink.event(ProgressEvent::step(format!(
            "fetching data from view {}",
            self.config.athena.view
        )));
        let table = QueryAdapter::new(engine).fetch(&self.analysis_request())?;
        let report = self.build_report(&table)?;
        sink.event(ProgressEvent::finished("analysis complete", started));
        Ok(report)
    }

    pub fn build_report(&self, table: &Table) -> Result<AnalysisReport, PipelineError> {
        let mut report = AnalysisReport::build(table)?;
        let chart: Utf8PathBuf = render_top_makes(&report.top_makes, &self.config.reports_dir)?;
        report.chart_path = Some(chart.to_string());
        Ok(report)
    }

    /// Download, upload, refine and (when an engine is given) analyze.
    ///
    /// A failed download or upload stops the run and is reported through
    /// `completed`; refinement and analysis errors are returned.
    pub fn run_everything<E: QueryEngine>(
        &self,
        engine: Option<E>,
        run_date: NaiveDate,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, PipelineError> {
        info!("step 1: downloading data");
        let download = self.download(sink);
        let mut result = RunResult {
            download,
            upload: None,
            refine: None,
            analysis: None,
            completed: false,
        };
        if !result.download.ok {
            return Ok(result);
        }

        info!("step 2: uploading to object store");
        let local = result
            .download
            .csv
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.local_raw_path().into_std_path_buf());
        if !local.exists() {
            error!(
                path = %local.display(),
                "file not found; check the file name in the data folder"
            );
        }
        let upload = self.upload(&local, run_date, sink);
        let uploaded = upload.ok;
        result.upload = Some(upload);
        if !uploaded {
            return Ok(result);
        }

        info!("step 3: refining");
        result.refine = Some(self.refine(run_date, sink)?);

        match engine {
            Some(engine) => {
                info!("step 4: analyzing and visualizing");
                result.analysis = Some(self.analyze(engine, sink)?);
            }
            None => info!("no query engine configured; skipping analysis"),
        }
        result.completed = true;
        Ok(result)
    }

    pub fn ingest_job(&self) -> IngestJob<&C, &S, &N> {
        IngestJob::new(
            &self.catalog,
            &self.store,
            &self.notifier,
            self.config.dataset.clone(),
            &self.config.bucket,
            self.config.alerts.notify_on_failure,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigLoader};
    use crate::notify::LogNotifier;
    use crate::object_store::LocalObjectStore;

    struct RejectingCatalog;

    impl CatalogClient for RejectingCatalog {
        fn download(
            &self,
            _slug: &DatasetSlug,
            _destination: &Path,
        ) -> Result<Vec<PathBuf>, PipelineError> {
            Err(PipelineError::CredentialsMissing("no kaggle.json".to_string()))
        }
    }

    struct Silent;

    struct NoEngine;

    impl QueryEngine for NoEngine {
        fn execute(&self, _request: &QueryRequest) -> Result<Table, PipelineError> {
            Err(PipelineError::Runtime("not reachable".to_string()))
        }
    }

    impl ProgressSink for Silent {
        fn event(&self, _event: ProgressEvent) {}
    }

    #[test]
    fn failed_download_stops_the_run() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let mut config = ConfigLoader::resolve_config(Config::default()).unwrap();
        config.data_dir = root.join("data");
        let pipeline = Pipeline::new(
            config,
            RejectingCatalog,
            LocalObjectStore::new(root.join("store")),
            LogNotifier,
        );
        let result = pipeline
            .run_everything::<NoEngine>(
                None,
                NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
                &Silent,
            )
            .unwrap();
        assert!(!result.download.ok);
        assert!(result.upload.is_none());
        assert!(!result.completed);
    }

    #[test]
    fn job_response_body_is_json() {
        let response = JobResponse::new(500, "Pipeline failed: boom");
        assert_eq!(response.body, "\"Pipeline failed: boom\"");
        assert!(!response.is_success());
    }
}
