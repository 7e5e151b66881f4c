//! Upload of failure routine artifacts to S3.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use aws_config::SdkConfig;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use tracing::info;

use crate::error::CvegateError;

#[derive(Clone)]
pub struct S3Uploader {
    client: Client,
    bucket: String,
}

impl S3Uploader {
    pub fn new(config: &SdkConfig, bucket: &str) -> Self {
        Self {
            client: Client::new(config),
            bucket: bucket.to_string(),
        }
    }

    /// Upload files keyed by their file name. Returns the `s3://` locations.
    pub async fn upload_files(&self, files: &[PathBuf]) -> Result<Vec<String>> {
        let mut locations = Vec::with_capacity(files.len());
        for file in files {
            locations.push(self.upload(file).await?);
        }
        Ok(locations)
    }

    async fn upload(&self, file: &Path) -> Result<String> {
        let start_time = Instant::now();
        let key = object_key(file)?;
        let body = tokio::fs::read(file)
            .await
            .with_context(|| format!("Failed to read file for upload: {}", file.display()))?;
        let size_bytes = body.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| CvegateError::aws("s3::put_object", e))?;

        let location = format!("s3://{}/{}", self.bucket, key);
        info!(
            location = %location,
            size_bytes,
            duration_seconds = start_time.elapsed().as_secs_f64(),
            "Uploaded file to S3"
        );
        Ok(location)
    }
}

fn object_key(file: &Path) -> Result<String> {
    file.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("Cannot derive S3 key from path: {}", file.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_uses_file_name() {
        let key = object_key(Path::new("/tmp/out/image-allowlist.json")).unwrap();
        assert_eq!(key, "image-allowlist.json");
    }

    #[test]
    fn test_object_key_rejects_root() {
        assert!(object_key(Path::new("/")).is_err());
    }
}
