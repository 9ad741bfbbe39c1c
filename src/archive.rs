//! Raw image archival in object storage.
//!
//! The archive key is derived from the photo's ingestion timestamp and image
//! type, so the read path can reconstruct it from the metadata record alone.
//! Keys must match byte-for-byte between the write path (ingestion) and the
//! read path (presigning at query time).

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::config::S3Config;

/// Derive the archive key for a photo: `<prefix>/<unix_seconds>.<image_type>`.
pub fn archive_key(prefix: &str, timestamp: DateTime<Utc>, image_type: &str) -> String {
    format!("{}/{}.{}", prefix, timestamp.timestamp(), image_type)
}

/// Capability seam for the blob store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PhotoArchive: Send + Sync {
    /// Upload raw image bytes under the given key.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;

    /// Issue a time-limited retrieval URL for an archived object.
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// S3-backed photo archive.
pub struct S3PhotoArchive {
    client: S3Client,
    bucket: String,
}

impl S3PhotoArchive {
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 photo archive initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl PhotoArchive for S3PhotoArchive {
    #[instrument(skip(self, bytes), fields(key = %key, size_bytes = bytes.len()))]
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_length(bytes.len() as i64)
            .content_type(content_type)
            .send()
            .await
            .context("Failed to upload photo to S3")?;

        debug!(key = %key, "Photo uploaded to archive");

        Ok(())
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String> {
        let presigning_config =
            PresigningConfig::expires_in(ttl).context("Failed to create presigning config")?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .context("Failed to generate presigned URL")?;

        Ok(presigned.uri().to_string())
    }
}

/// In-memory archive used by tests and local development runs. Stored
/// objects are `(bytes, content_type)` pairs; presigned URLs use a synthetic
/// `memory://` scheme.
#[derive(Default)]
pub struct InMemoryPhotoArchive {
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl InMemoryPhotoArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of archived objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Fetch a stored object for inspection.
    pub async fn get(&self, key: &str) -> Option<(Vec<u8>, String)> {
        self.objects.read().await.get(key).cloned()
    }
}

#[async_trait]
impl PhotoArchive for InMemoryPhotoArchive {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(())
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String> {
        if !self.objects.read().await.contains_key(key) {
            anyhow::bail!("object not found: {}", key);
        }
        Ok(format!("memory://{}?expires_in={}", key, ttl.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_format::ImageFormat;
    use chrono::TimeZone;

    #[test]
    fn test_archive_key_format() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();
        let key = archive_key("photos", ts, ImageFormat::Jpeg.as_str());
        assert_eq!(key, format!("photos/{}.jpeg", ts.timestamp()));
    }

    #[test]
    fn test_archive_key_is_reconstructible() {
        // The key derived at query time from the stored record must equal
        // the key used at ingestion time.
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let at_ingest = archive_key("photos", ts, "png");
        let at_query = archive_key("photos", ts, "png");
        assert_eq!(at_ingest, at_query);
    }

    #[tokio::test]
    async fn test_in_memory_put_and_presign() {
        let archive = InMemoryPhotoArchive::new();
        archive.put("photos/1.jpeg", &[1, 2, 3], "image/jpeg").await.unwrap();

        let (bytes, content_type) = archive.get("photos/1.jpeg").await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(content_type, "image/jpeg");

        let url = archive
            .presign("photos/1.jpeg", Duration::from_secs(900))
            .await
            .unwrap();
        assert!(url.starts_with("memory://photos/1.jpeg"));
    }

    #[tokio::test]
    async fn test_in_memory_presign_missing_object() {
        let archive = InMemoryPhotoArchive::new();
        assert!(archive
            .presign("photos/missing.png", Duration::from_secs(60))
            .await
            .is_err());
    }
}
