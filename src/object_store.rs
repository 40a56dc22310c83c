use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aws_sdk_s3::primitives::ByteStream;
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;
use tracing::{debug, info};

use crate::cloud::CloudContext;
use crate::domain::ObjectLocation;
use crate::error::PipelineError;

/// Durable keyed storage; the only hand-off medium between stages.
pub trait ObjectStore {
    fn put_file(&self, local: &Path, location: &ObjectLocation) -> Result<(), PipelineError>;
    fn put_bytes(&self, location: &ObjectLocation, content: Vec<u8>) -> Result<(), PipelineError>;
    fn get_bytes(&self, location: &ObjectLocation) -> Result<Vec<u8>, PipelineError>;
    /// Keys under `prefix`, sorted.
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, PipelineError>;
    fn delete(&self, location: &ObjectLocation) -> Result<(), PipelineError>;

    /// Makes `files` (names relative to `prefix`) the complete contents of
    /// `prefix`. New objects are written before stale ones are removed, so a
    /// file name reused across runs is swapped in place.
    fn replace_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<(), PipelineError> {
        let prefix = normalize_prefix(prefix);
        let existing = self.list(bucket, &prefix)?;
        let mut written = Vec::with_capacity(files.len());
        for (name, content) in files {
            let location = ObjectLocation::new(bucket, format!("{prefix}{name}"));
            self.put_bytes(&location, content)?;
            written.push(location.key);
        }
        for key in existing {
            if !written.contains(&key) {
                self.delete(&ObjectLocation::new(bucket, key))?;
            }
        }
        Ok(())
    }
}

impl<T: ObjectStore + ?Sized> ObjectStore for Box<T> {
    fn put_file(&self, local: &Path, location: &ObjectLocation) -> Result<(), PipelineError> {
        (**self).put_file(local, location)
    }

    fn put_bytes(&self, location: &ObjectLocation, content: Vec<u8>) -> Result<(), PipelineError> {
        (**self).put_bytes(location, content)
    }

    fn get_bytes(&self, location: &ObjectLocation) -> Result<Vec<u8>, PipelineError> {
        (**self).get_bytes(location)
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, PipelineError> {
        (**self).list(bucket, prefix)
    }

    fn delete(&self, location: &ObjectLocation) -> Result<(), PipelineError> {
        (**self).delete(location)
    }

    fn replace_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<(), PipelineError> {
        (**self).replace_prefix(bucket, prefix, files)
    }
}

impl<T: ObjectStore + ?Sized> ObjectStore for &T {
    fn put_file(&self, local: &Path, location: &ObjectLocation) -> Result<(), PipelineError> {
        (**self).put_file(local, location)
    }

    fn put_bytes(&self, location: &ObjectLocation, content: Vec<u8>) -> Result<(), PipelineError> {
        (**self).put_bytes(location, content)
    }

    fn get_bytes(&self, location: &ObjectLocation) -> Result<Vec<u8>, PipelineError> {
        (**self).get_bytes(location)
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, PipelineError> {
        (**self).list(bucket, prefix)
    }

    fn delete(&self, location: &ObjectLocation) -> Result<(), PipelineError> {
        (**self).delete(location)
    }

    fn replace_prefix(
        &self,
        bucket: &str,
        prefix: &str,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<(), PipelineError> {
        (**self).replace_prefix(bucket, prefix, files)
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

pub struct S3ObjectStore {
    cloud: Arc<CloudContext>,
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub fn new(cloud: Arc<CloudContext>) -> Self {
        let client = cloud.s3_client();
        Self { cloud, client }
    }
}

impl ObjectStore for S3ObjectStore {
    fn put_file(&self, local: &Path, location: &ObjectLocation) -> Result<(), PipelineError> {
        if !local.is_file() {
            return Err(PipelineError::SourceUnavailable(format!(
                "local file {} not found",
                local.display()
            )));
        }
        info!(file = %local.display(), object = %location, "uploading file");
        self.cloud.block_on(async {
            let body = ByteStream::from_path(local)
                .await
                .map_err(|err| PipelineError::SourceUnavailable(err.to_string()))?;
            self.client
                .put_object()
                .bucket(&location.bucket)
                .key(&location.key)
                .body(body)
                .send()
                .await
                .map_err(|err| {
                    PipelineError::WriteFailed(format!(
                        "put {location}: {}",
                        err.into_service_error()
                    ))
                })?;
            Ok::<(), PipelineError>(())
        })
    }

    fn put_bytes(&self, location: &ObjectLocation, content: Vec<u8>) -> Result<(), PipelineError> {
        debug!(object = %location, bytes = content.len(), "writing object");
        self.cloud.block_on(async {
            self.client
                .put_object()
                .bucket(&location.bucket)
                .key(&location.key)
                .body(ByteStream::from(content))
                .send()
                .await
                .map_err(|err| {
                    PipelineError::WriteFailed(format!(
                        "put {location}: {}",
                        err.into_service_error()
                    ))
                })?;
            Ok::<(), PipelineError>(())
        })
    }

    fn get_bytes(&self, location: &ObjectLocation) -> Result<Vec<u8>, PipelineError> {
        debug!(source = %location, "reading object");
        self.cloud.block_on(async {
            let output = self
                .client
                .get_object()
                .bucket(&location.bucket)
                .key(&location.key)
                .send()
                .await
                .map_err(|err| {
                    let service = err.into_service_error();
                    if service.is_no_such_key() {
                        PipelineError::SourceUnavailable(format!("{location} does not exist"))
                    } else {
                        PipelineError::SourceUnavailable(format!("get {location}: {service}"))
                    }
                })?;
            let data = output.body.collect().await.map_err(|err| {
                PipelineError::SourceUnavailable(format!("read {location}: {err}"))
            })?;
            Ok::<_, PipelineError>(data.into_bytes().to_vec())
        })
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, PipelineError> {
        self.cloud.block_on(async {
            let mut keys = Vec::new();
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|err| {
                    PipelineError::SourceUnavailable(format!(
                        "list s3://{bucket}/{prefix}: {}",
                        err.into_service_error()
                    ))
                })?;
                keys.extend(
                    page.contents()
                        .iter()
                        .filter_map(|object| object.key().map(str::to_string)),
                );
            }
            keys.sort();
            Ok::<_, PipelineError>(keys)
        })
    }

    fn delete(&self, location: &ObjectLocation) -> Result<(), PipelineError> {
        debug!(object = %location, "deleting object");
        self.cloud.block_on(async {
            self.client
                .delete_object()
                .bucket(&location.bucket)
                .key(&location.key)
                .send()
                .await
                .map_err(|err| {
                    PipelineError::WriteFailed(format!(
                        "delete {location}: {}",
                        err.into_service_error()
                    ))
                })?;
            Ok::<(), PipelineError>(())
        })
    }
}

/// Buckets as directories under a root; used for offline runs and tests.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: Utf8PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn path_for(&self, location: &ObjectLocation) -> Utf8PathBuf {
        self.root.join(&location.bucket).join(&location.key)
    }

    fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), PipelineError> {
        let parent = path
            .parent()
            .ok_or_else(|| PipelineError::WriteFailed(format!("invalid object path {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| PipelineError::WriteFailed(err.to_string()))?;
        let temp = Builder::new()
            .prefix(".vsp-object")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| PipelineError::WriteFailed(err.to_string()))?;
        fs::write(temp.path(), content).map_err(|err| PipelineError::WriteFailed(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| PipelineError::WriteFailed(err.to_string()))?;
        Ok(())
    }
}

impl ObjectStore for LocalObjectStore {
    fn put_file(&self, local: &Path, location: &ObjectLocation) -> Result<(), PipelineError> {
        let content = fs::read(local).map_err(|err| {
            PipelineError::SourceUnavailable(format!("local file {}: {err}", local.display()))
        })?;
        info!(file = %local.display(), object = %location, "copying file into local store");
        Self::write_atomic(&self.path_for(location), &content)
    }

    fn put_bytes(&self, location: &ObjectLocation, content: Vec<u8>) -> Result<(), PipelineError> {
        Self::write_atomic(&self.path_for(location), &content)
    }

    fn get_bytes(&self, location: &ObjectLocation) -> Result<Vec<u8>, PipelineError> {
        fs::read(self.path_for(location).as_std_path())
            .map_err(|err| PipelineError::SourceUnavailable(format!("{location}: {err}")))
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, PipelineError> {
        let bucket_root = self.root.join(bucket);
        if !bucket_root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut keys = walk_files(bucket_root.as_std_path())?
            .into_iter()
            .filter_map(|path| {
                let relative = path.strip_prefix(bucket_root.as_std_path()).ok()?;
                let key = relative
                    .components()
                    .map(|part| part.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                Some(key)
            })
            .filter(|key| key.starts_with(prefix) && !is_hidden_key(key))
            .collect::<Vec<_>>();
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, location: &ObjectLocation) -> Result<(), PipelineError> {
        let path = self.path_for(location);
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PipelineError::WriteFailed(format!("delete {location}: {err}"))),
        }
    }
}

/// Stands in for the remote store when no credentials resolve; every call
/// fails with `CredentialsMissing` so the failing step reports it.
#[derive(Debug, Clone)]
pub struct UnavailableStore {
    reason: String,
}

impl UnavailableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn refuse<T>(&self) -> Result<T, PipelineError> {
        Err(PipelineError::CredentialsMissing(self.reason.clone()))
    }
}

impl ObjectStore for UnavailableStore {
    fn put_file(&self, _local: &Path, _location: &ObjectLocation) -> Result<(), PipelineError> {
        self.refuse()
    }

    fn put_bytes(&self, _location: &ObjectLocation, _bytes: Vec<u8>) -> Result<(), PipelineError> {
        self.refuse()
    }

    fn get_bytes(&self, _location: &ObjectLocation) -> Result<Vec<u8>, PipelineError> {
        self.refuse()
    }

    fn list(&self, _bucket: &str, _prefix: &str) -> Result<Vec<String>, PipelineError> {
        self.refuse()
    }

    fn delete(&self, _location: &ObjectLocation) -> Result<(), PipelineError> {
        self.refuse()
    }
}

fn is_hidden_key(key: &str) -> bool {
    key.split('/').any(|part| part.starts_with(".vsp-"))
}

fn walk_files(root: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                items.push(path);
            }
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn store() -> (tempfile::TempDir, LocalObjectStore) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, LocalObjectStore::new(root))
    }

    #[test]
    fn put_get_list_delete() {
        let (_temp, store) = store();
        let location = ObjectLocation::new("bucket", "raw_data/car_prices.csv");
        store.put_bytes(&location, b"year\n2015\n".to_vec()).unwrap();
        assert_eq!(store.get_bytes(&location).unwrap(), b"year\n2015\n");
        assert_eq!(
            store.list("bucket", "raw_data/").unwrap(),
            vec!["raw_data/car_prices.csv".to_string()]
        );
        store.delete(&location).unwrap();
        assert_matches!(
            store.get_bytes(&location),
            Err(PipelineError::SourceUnavailable(_))
        );
    }

    #[test]
    fn replace_prefix_drops_stale_files() {
        let (_temp, store) = store();
        store
            .put_bytes(&ObjectLocation::new("b", "p/year=2024/month=5/old.parquet"), vec![1])
            .unwrap();
        store
            .replace_prefix(
                "b",
                "p/year=2024/month=5/",
                vec![("new.parquet".to_string(), vec![2])],
            )
            .unwrap();
        assert_eq!(
            store.list("b", "p/").unwrap(),
            vec!["p/year=2024/month=5/new.parquet".to_string()]
        );
    }

    #[test]
    fn replace_prefix_overwrites_in_place() {
        let (_temp, store) = store();
        let target = ObjectLocation::new("b", "p/year=2024/month=5/part-00000.parquet");
        store.put_bytes(&target, b"first".to_vec()).unwrap();
        store
            .put_bytes(&ObjectLocation::new("b", "p/year=2024/month=5/part-00001.parquet"), vec![1])
            .unwrap();

        store
            .replace_prefix(
                "b",
                "p/year=2024/month=5",
                vec![("part-00000.parquet".to_string(), b"second".to_vec())],
            )
            .unwrap();

        assert_eq!(store.get_bytes(&target).unwrap(), b"second");
        let partition_dir = store.root().join("b/p/year=2024/month=5");
        let entries = fs::read_dir(partition_dir.as_std_path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(entries, vec!["part-00000.parquet".to_string()]);
        let parent_entries = fs::read_dir(store.root().join("b/p/year=2024").as_std_path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(parent_entries, vec!["month=5".to_string()]);
    }

    #[test]
    fn unavailable_store_reports_missing_credentials() {
        let store = UnavailableStore::new("no AWS credentials provider configured");
        let location = ObjectLocation::new("b", "raw_data/car_prices.csv");
        assert_matches!(
            store.put_file(Path::new("car_prices.csv"), &location),
            Err(PipelineError::CredentialsMissing(_))
        );
        assert_matches!(
            store.replace_prefix("b", "refined_data/year=2024/month=5/", Vec::new()),
            Err(PipelineError::CredentialsMissing(_))
        );
    }

    #[test]
    fn put_file_missing_source() {
        let (temp, store) = store();
        let missing = temp.path().join("nope.csv");
        assert_matches!(
            store.put_file(&missing, &ObjectLocation::new("b", "k")),
            Err(PipelineError::SourceUnavailable(_))
        );
    }
}
