use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::PipelineError;

/// Extracts `zip_path` into `target_dir`, returning the extracted file paths.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        PipelineError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| PipelineError::Filesystem(err.to_string()))?;

    let mut extracted = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(PipelineError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        extracted.push(entry_path);
    }
    Ok(extracted)
}

/// First `.csv` file in `dir` (by file name), searched non-recursively.
pub fn find_csv(dir: &Path) -> Result<PathBuf, PipelineError> {
    let entries = fs::read_dir(dir).map_err(|err| {
        PipelineError::SourceUnavailable(format!("read {}: {err}", dir.display()))
    })?;
    let mut csv_files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let path = entry.path();
        let is_csv = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if path.is_file() && is_csv {
            csv_files.push(path);
        }
    }
    csv_files.sort();
    csv_files.into_iter().next().ok_or_else(|| {
        PipelineError::EmptyResult(format!("no CSV file found in {}", dir.display()))
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use zip::write::SimpleFileOptions;

    use super::*;

    #[test]
    fn extract_and_find_csv() {
        let temp = tempfile::tempdir().unwrap();
        let zip_path = temp.path().join("archive.zip");
        {
            let file = fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .start_file("car_prices.csv", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"year,make\n2015,Kia\n").unwrap();
            writer
                .start_file("README.txt", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"readme").unwrap();
            writer.finish().unwrap();
        }

        let out = temp.path().join("out");
        let extracted = extract_zip(&zip_path, &out).unwrap();
        assert_eq!(extracted.len(), 2);
        let csv = find_csv(&out).unwrap();
        assert!(csv.ends_with("car_prices.csv"));
    }

    #[test]
    fn find_csv_empty_dir() {
        let temp = tempfile::tempdir().unwrap();
        assert_matches!(find_csv(temp.path()), Err(PipelineError::EmptyResult(_)));
    }
}
