use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::info;

use crate::credentials::KaggleCredentials;
use crate::domain::DatasetSlug;
use crate::error::PipelineError;
use crate::fs_util::extract_zip;

pub const KAGGLE_API_URL: &str = "https://www.kaggle.com/api/v1";

/// Dataset catalog that serves archives by slug.
pub trait CatalogClient {
    /// Downloads the dataset archive for `slug` and extracts it into
    /// `destination`, returning the extracted files.
    fn download(&self, slug: &DatasetSlug, destination: &Path)
    -> Result<Vec<PathBuf>, PipelineError>;
}

impl<T: CatalogClient + ?Sized> CatalogClient for &T {
    fn download(
        &self,
        slug: &DatasetSlug,
        destination: &Path,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        (**self).download(slug, destination)
    }
}

impl<T: CatalogClient + ?Sized> CatalogClient for Box<T> {
    fn download(
        &self,
        slug: &DatasetSlug,
        destination: &Path,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        (**self).download(slug, destination)
    }
}

#[derive(Clone)]
pub struct KaggleHttpClient {
    client: Client,
    base_url: String,
    credentials: KaggleCredentials,
}

impl KaggleHttpClient {
    pub fn new(credentials: KaggleCredentials) -> Result<Self, PipelineError> {
        Self::with_base_url(credentials, KAGGLE_API_URL)
    }

    pub fn with_base_url(
        credentials: KaggleCredentials,
        base_url: impl Into<String>,
    ) -> Result<Self, PipelineError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("vsp/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PipelineError::CatalogHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| PipelineError::CatalogHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn download_url(&self, slug: &DatasetSlug) -> String {
        format!(
            "{}/datasets/download/{}/{}",
            self.base_url,
            slug.owner(),
            slug.name()
        )
    }

    fn write_response_to_file(
        &self,
        mut response: reqwest::blocking::Response,
        destination: &Path,
    ) -> Result<(), PipelineError> {
        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "catalog request failed".to_string());
            return Err(match code {
                401 | 403 => PipelineError::CredentialsMissing(format!(
                    "catalog rejected credentials ({code}): {message}"
                )),
                404 => PipelineError::SourceUnavailable(format!("dataset not found: {message}")),
                _ => PipelineError::CatalogStatus {
                    status: code,
                    message,
                },
            });
        }
        let mut file =
            File::create(destination).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| PipelineError::CatalogHttp(err.to_string()))?;
        Ok(())
    }
}

impl CatalogClient for KaggleHttpClient {
    fn download(
        &self,
        slug: &DatasetSlug,
        destination: &Path,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        fs::create_dir_all(destination).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let url = self.download_url(slug);
        info!(dataset = %slug, "downloading dataset");
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.key))
            .send()
            .map_err(|err| PipelineError::SourceUnavailable(err.to_string()))?;

        let archive = tempfile::Builder::new()
            .prefix("vsp-download")
            .suffix(".zip")
            .tempfile_in(destination)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        self.write_response_to_file(response, archive.path())?;
        let extracted = extract_zip(archive.path(), destination)?;
        info!(files = extracted.len(), dir = %destination.display(), "dataset extracted");
        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_url_layout() {
        let client = KaggleHttpClient::with_base_url(
            KaggleCredentials {
                username: "u".to_string(),
                key: "k".to_string(),
            },
            "https://example.test/api/v1/",
        )
        .unwrap();
        let slug: DatasetSlug = "syedanwarafridi/vehicle-sales-data".parse().unwrap();
        assert_eq!(
            client.download_url(&slug),
            "https://example.test/api/v1/datasets/download/syedanwarafridi/vehicle-sales-data"
        );
    }
}
