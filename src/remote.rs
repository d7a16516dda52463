//! Upload of an exported datawarehouse to S3 (or any S3-compatible store).

use crate::warehouse::UPDATE_DATE_FILE;
use crate::{Result, SyncError};
use aws_config::Region;
use aws_sdk_s3::{primitives::ByteStream, Client};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct S3UploadConfig {
    pub bucket: String,
    pub region: String,
    pub prefix: String,
    pub endpoint: Option<String>,
}

impl S3UploadConfig {
    /// `None` when `DWSYNC_S3_BUCKET` is unset
    pub fn from_env() -> Option<Self> {
        let bucket = match std::env::var("DWSYNC_S3_BUCKET") {
            Ok(b) if !b.is_empty() => b,
            _ => return None,
        };

        Some(Self {
            bucket,
            region: std::env::var("DWSYNC_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            prefix: std::env::var("DWSYNC_S3_PREFIX").unwrap_or_else(|_| "datawarehouse".to_string()),
            endpoint: std::env::var("DWSYNC_S3_ENDPOINT").ok(),
        })
    }
}

pub struct S3Uploader {
    client: Client,
    bucket: String,
    prefix: String,
    runtime: Runtime,
}

impl S3Uploader {
    pub fn new(config: S3UploadConfig) -> Result<Self> {
        let runtime = Runtime::new().map_err(|e| SyncError::Other(format!("tokio runtime error: {}", e)))?;
        let region = Region::new(config.region.clone());
        let base_config = runtime.block_on(aws_config::from_env().region(region.clone()).load());

        let mut s3_builder = aws_sdk_s3::config::Builder::from(&base_config).region(region);
        if let Some(endpoint) = &config.endpoint {
            s3_builder = s3_builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_builder.build()),
            bucket: config.bucket,
            prefix: config.prefix,
            runtime,
        })
    }

    /// Upload an export directory. Dataset files go first and the
    /// `update_date.txt` marker last, so a reader polling the marker never
    /// sees it ahead of the data. Returns the uploaded keys in upload order.
    pub fn upload_dir(&self, dir: &Path) -> Result<Vec<String>> {
        let plan = plan_upload(dir, &self.prefix)?;
        for item in &plan {
            self.put_object(item, fs::read(&item.path)?)?;
        }
        info!(bucket = %self.bucket, objects = plan.len(), "Upload finished");
        Ok(plan.into_iter().map(|item| item.key).collect())
    }

    fn put_object(&self, item: &UploadItem, bytes: Vec<u8>) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&item.key)
                    .content_type(item.content_type)
                    .body(ByteStream::from(bytes))
                    .send(),
            )
            .map_err(|e| SyncError::Other(format!("S3 put {}: {}", item.key, e)))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct UploadItem {
    key: String,
    path: PathBuf,
    content_type: &'static str,
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

fn object_key(prefix: &str, relative: &Path) -> String {
    let relative = relative.to_string_lossy().replace('\\', "/");
    match prefix.trim_end_matches('/') {
        "" => relative,
        prefix => format!("{}/{}", prefix, relative),
    }
}

/// Every file under `dir` with its key, sorted by key, the update marker last
fn plan_upload(dir: &Path, prefix: &str) -> Result<Vec<UploadItem>> {
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;

    let mut plan = files
        .into_iter()
        .map(|path| {
            let relative = path.strip_prefix(dir).map_err(|e| SyncError::Other(e.to_string()))?;
            Ok(UploadItem {
                key: object_key(prefix, relative),
                content_type: content_type(&path),
                path,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    plan.sort_by_key(|item| (item.path.ends_with(UPDATE_DATE_FILE), item.key.clone()));
    Ok(plan)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_keys() {
        assert_eq!(object_key("", Path::new("a/b.csv")), "a/b.csv");
        assert_eq!(object_key("dw/", Path::new("a/b.csv")), "dw/a/b.csv");
    }

    #[test]
    fn test_plan_uploads_marker_last_with_content_types() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("daostack")).unwrap();
        fs::write(dir.path().join("daostack").join("daos.csv"), "x").unwrap();
        fs::write(dir.path().join("daostack").join("metadata.json"), "{}").unwrap();
        fs::write(dir.path().join(UPDATE_DATE_FILE), "2022-03-01").unwrap();
        fs::write(dir.path().join("version.txt"), "1").unwrap();

        let plan = plan_upload(dir.path(), "dw").unwrap();
        let keys: Vec<&str> = plan.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["dw/daostack/daos.csv", "dw/daostack/metadata.json", "dw/version.txt", "dw/update_date.txt"]
        );
        assert_eq!(plan[0].content_type, "text/csv");
        assert_eq!(plan[1].content_type, "application/json");
        assert_eq!(plan[3].content_type, "text/plain");
    }
}
