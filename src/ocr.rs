//! Text extraction from images.
//!
//! The OCR engine runs as a sidecar service; this module only carries the
//! bytes over and hands back whatever text comes out. The ingestion pipeline
//! decides what to do when extraction fails (it substitutes
//! [`OCR_FAILURE_TEXT`] rather than aborting).

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::config::OcrConfig;

/// Sentinel stored in place of real text when extraction fails.
pub const OCR_FAILURE_TEXT: &str = "OCR failed";

/// Capability seam for optical character recognition.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract text from an encoded image. Errors are transport or engine
    /// failures; an image with no discernible text yields an empty string.
    async fn extract_text(&self, image: &[u8]) -> Result<String>;
}

/// OCR client that posts image bytes to an HTTP OCR endpoint and reads the
/// extracted text from the plain-text response body.
pub struct HttpOcrClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpOcrClient {
    pub fn new(config: &OcrConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build OCR HTTP client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl TextExtractor for HttpOcrClient {
    async fn extract_text(&self, image: &[u8]) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .context("OCR request failed")?
            .error_for_status()
            .context("OCR endpoint returned an error status")?;

        let text = response
            .text()
            .await
            .context("Failed to read OCR response body")?;

        debug!(chars = text.len(), "Extracted text from image");

        Ok(text)
    }
}
