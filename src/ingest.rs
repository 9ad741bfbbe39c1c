//! Message-driven ingestion pipeline.
//!
//! One inbound MQTT publish becomes at most one photo record and one archived
//! blob. Failures are terminal per message: the transport is fire-and-forget,
//! so nothing here retries or negatively acknowledges. The single deliberate
//! asymmetry is OCR — extraction failure substitutes a sentinel and the
//! message continues, while every other step aborts processing.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::archive::{archive_key, PhotoArchive};
use crate::config::MqttConfig;
use crate::device_registry::{Device, DeviceRegistry, RegistryError};
use crate::image_format::ImageFormat;
use crate::ocr::{TextExtractor, OCR_FAILURE_TEXT};
use crate::photo_store::{NewPhoto, Photo, PhotoRepository};

/// Ingestion failures, one per inbound message.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Topic does not carry a single-level device suffix.
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),

    /// Sender is not in the registry. Expected and non-fatal.
    #[error("unknown device '{0}'")]
    UnknownDevice(String),

    /// Payload is not a recognized image container.
    #[error("payload is not a recognized image format")]
    UnrecognizedImage,

    /// Disconnect payload does not match the required sentinel.
    #[error("invalid disconnect payload")]
    InvalidDisconnectPayload,

    /// Store, archive or registry infrastructure fault.
    #[error("dependency failure: {0}")]
    Dependency(#[source] anyhow::Error),
}

impl IngestError {
    /// Sender-fault conditions are logged at warn and dropped; dependency
    /// faults are operational errors.
    pub fn is_sender_fault(&self) -> bool {
        !matches!(self, Self::Dependency(_))
    }
}

fn map_registry_err(e: RegistryError) -> IngestError {
    match e {
        RegistryError::NotFound(id) => IngestError::UnknownDevice(id),
        RegistryError::Store(e) => IngestError::Dependency(e),
    }
}

/// Topic prefixes and the disconnect sentinel, taken from MQTT config.
#[derive(Debug, Clone)]
pub struct IngestTopics {
    pub photo_prefix: String,
    pub register_prefix: String,
    pub disconnect_prefix: String,
    pub disconnect_payload: String,
}

impl From<&MqttConfig> for IngestTopics {
    fn from(config: &MqttConfig) -> Self {
        Self {
            photo_prefix: config.photo_topic_prefix.clone(),
            register_prefix: config.register_topic_prefix.clone(),
            disconnect_prefix: config.disconnect_topic_prefix.clone(),
            disconnect_payload: config.disconnect_payload.clone(),
        }
    }
}

/// Extract the device id suffix from `<prefix>/<device_id>`. The suffix must
/// be exactly one topic level.
pub fn device_id_from_topic<'a>(topic: &'a str, prefix: &str) -> Result<&'a str, IngestError> {
    let suffix = topic
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| IngestError::InvalidTopic(topic.to_string()))?;

    if suffix.is_empty() || suffix.contains('/') {
        return Err(IngestError::InvalidTopic(topic.to_string()));
    }

    Ok(suffix)
}

fn topic_matches(topic: &str, prefix: &str) -> bool {
    topic
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Orchestrates the photo and device-lifecycle handlers over injected
/// capability seams.
pub struct PhotoIngestor {
    devices: Arc<dyn DeviceRegistry>,
    photos: Arc<dyn PhotoRepository>,
    archive: Arc<dyn PhotoArchive>,
    ocr: Arc<dyn TextExtractor>,
    topics: IngestTopics,
    storage_prefix: String,
}

impl PhotoIngestor {
    pub fn new(
        devices: Arc<dyn DeviceRegistry>,
        photos: Arc<dyn PhotoRepository>,
        archive: Arc<dyn PhotoArchive>,
        ocr: Arc<dyn TextExtractor>,
        topics: IngestTopics,
        storage_prefix: String,
    ) -> Self {
        Self {
            devices,
            photos,
            archive,
            ocr,
            topics,
            storage_prefix,
        }
    }

    /// Route an inbound message to the matching handler by topic prefix.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> Result<(), IngestError> {
        if topic_matches(topic, &self.topics.photo_prefix) {
            self.handle_photo(topic, payload).await.map(|_| ())
        } else if topic_matches(topic, &self.topics.register_prefix) {
            self.handle_register(topic, payload).await.map(|_| ())
        } else if topic_matches(topic, &self.topics.disconnect_prefix) {
            self.handle_disconnect(topic, payload).await
        } else {
            Err(IngestError::InvalidTopic(topic.to_string()))
        }
    }

    /// Process one photo message: resolve device, decode, extract text,
    /// persist metadata, archive the raw bytes. Metadata is written before
    /// the blob so a crash mid-pipeline leaves a queryable record rather
    /// than an orphaned object.
    #[instrument(skip(self, payload), fields(topic = %topic, payload_size = payload.len()))]
    pub async fn handle_photo(&self, topic: &str, payload: &[u8]) -> Result<Photo, IngestError> {
        let device_id = device_id_from_topic(topic, &self.topics.photo_prefix)?;

        let device = self
            .devices
            .get(device_id)
            .await
            .map_err(map_registry_err)?;

        debug!(device_name = %device.device_name, "Photo from registered device");

        let format = ImageFormat::detect(payload).ok_or(IngestError::UnrecognizedImage)?;

        // Best effort: a failed extraction degrades to the sentinel instead
        // of dropping the photo.
        let text = match self.ocr.extract_text(payload).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Text extraction failed, storing sentinel");
                metrics::counter!("photosink.ocr.failures").increment(1);
                OCR_FAILURE_TEXT.to_string()
            }
        };

        // Captured once; both the record and the archive key derive from it.
        let timestamp = Utc::now();

        let photo = self
            .photos
            .insert(NewPhoto {
                timestamp,
                image_type: format.as_str().to_string(),
                device_id: Some(device_id.to_string()),
                text,
            })
            .await
            .map_err(IngestError::Dependency)?;

        let key = archive_key(&self.storage_prefix, timestamp, format.as_str());

        // An upload failure leaves the metadata record in place; the
        // inconsistency is tolerated and reconciliation is external.
        self.archive
            .put(&key, payload, &format.content_type())
            .await
            .map_err(IngestError::Dependency)?;

        info!(
            photo_id = %photo.id,
            key = %key,
            image_type = %format,
            "Photo ingested"
        );

        metrics::counter!("photosink.photos.ingested").increment(1);

        Ok(photo)
    }

    /// Process a registration message; payload is the display name.
    #[instrument(skip(self, payload), fields(topic = %topic))]
    pub async fn handle_register(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<Device, IngestError> {
        let device_id = device_id_from_topic(topic, &self.topics.register_prefix)?;
        let device_name = String::from_utf8_lossy(payload);

        let device = self
            .devices
            .register_or_update(device_id, &device_name)
            .await
            .map_err(map_registry_err)?;

        info!(device_id = %device.device_id, device_name = %device.device_name, "Device registered");

        metrics::counter!("photosink.devices.registered").increment(1);

        Ok(device)
    }

    /// Process a disconnect message; the payload must equal the configured
    /// sentinel exactly or the message is dropped.
    #[instrument(skip(self, payload), fields(topic = %topic))]
    pub async fn handle_disconnect(&self, topic: &str, payload: &[u8]) -> Result<(), IngestError> {
        let device_id = device_id_from_topic(topic, &self.topics.disconnect_prefix)?;

        if payload != self.topics.disconnect_payload.as_bytes() {
            return Err(IngestError::InvalidDisconnectPayload);
        }

        self.devices
            .mark_disconnected(device_id)
            .await
            .map_err(map_registry_err)?;

        info!(device_id = %device_id, "Device disconnected");

        metrics::counter!("photosink.devices.disconnected").increment(1);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{InMemoryPhotoArchive, MockPhotoArchive};
    use crate::device_registry::{DeviceStatus, InMemoryDeviceRegistry};
    use crate::ocr::MockTextExtractor;
    use crate::photo_store::InMemoryPhotoStore;

    fn test_topics() -> IngestTopics {
        IngestTopics {
            photo_prefix: "photos".to_string(),
            register_prefix: "register".to_string(),
            disconnect_prefix: "disconnect".to_string(),
            disconnect_payload: "Device disconnected".to_string(),
        }
    }

    fn jpeg_bytes() -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        bytes.extend_from_slice(b"JFIF\0");
        bytes.extend_from_slice(&[0u8; 64]);
        bytes
    }

    struct Fixture {
        devices: Arc<InMemoryDeviceRegistry>,
        photos: Arc<InMemoryPhotoStore>,
        archive: Arc<InMemoryPhotoArchive>,
    }

    fn ingestor_with_ocr(ocr: MockTextExtractor) -> (PhotoIngestor, Fixture) {
        let devices = Arc::new(InMemoryDeviceRegistry::new());
        let photos = Arc::new(InMemoryPhotoStore::new());
        let archive = Arc::new(InMemoryPhotoArchive::new());

        let ingestor = PhotoIngestor::new(
            devices.clone(),
            photos.clone(),
            archive.clone(),
            Arc::new(ocr),
            test_topics(),
            "photos".to_string(),
        );

        (
            ingestor,
            Fixture {
                devices,
                photos,
                archive,
            },
        )
    }

    fn ocr_returning(text: &str) -> MockTextExtractor {
        let text = text.to_string();
        let mut ocr = MockTextExtractor::new();
        ocr.expect_extract_text()
            .returning(move |_| Ok(text.clone()));
        ocr
    }

    #[test]
    fn test_device_id_from_topic() {
        assert_eq!(device_id_from_topic("photos/cam-1", "photos").unwrap(), "cam-1");
        assert!(device_id_from_topic("photos/", "photos").is_err());
        assert!(device_id_from_topic("photos", "photos").is_err());
        assert!(device_id_from_topic("photos/a/b", "photos").is_err());
        assert!(device_id_from_topic("register/cam-1", "photos").is_err());
        // Prefix match must respect the level separator
        assert!(device_id_from_topic("photosx/cam-1", "photos").is_err());
    }

    #[tokio::test]
    async fn test_photo_from_unregistered_device_writes_nothing() {
        let (ingestor, fx) = ingestor_with_ocr(MockTextExtractor::new());

        let err = ingestor
            .handle_photo("photos/ghost", &jpeg_bytes())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::UnknownDevice(ref id) if id == "ghost"));
        assert!(err.is_sender_fault());
        assert!(fx.photos.is_empty().await);
        assert!(fx.archive.is_empty().await);
    }

    #[tokio::test]
    async fn test_valid_jpeg_produces_record_and_matching_archive_key() {
        let (ingestor, fx) = ingestor_with_ocr(ocr_returning("PACKING LIST"));
        fx.devices.register_or_update("cam-1", "dock camera").await.unwrap();

        let photo = ingestor
            .handle_photo("photos/cam-1", &jpeg_bytes())
            .await
            .unwrap();

        assert_eq!(photo.image_type, "jpeg");
        assert_eq!(photo.device_id.as_deref(), Some("cam-1"));
        assert_eq!(photo.text, "PACKING LIST");
        assert_eq!(fx.photos.len().await, 1);

        let key = format!("photos/{}.jpeg", photo.timestamp.timestamp());
        let (bytes, content_type) = fx.archive.get(&key).await.expect("blob archived");
        assert_eq!(bytes, jpeg_bytes());
        assert_eq!(content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn test_png_payload_is_classified_as_png() {
        let (ingestor, fx) = ingestor_with_ocr(ocr_returning(""));
        fx.devices.register_or_update("cam-1", "cam").await.unwrap();

        let mut payload = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        payload.extend_from_slice(&[0u8; 32]);

        let photo = ingestor.handle_photo("photos/cam-1", &payload).await.unwrap();
        assert_eq!(photo.image_type, "png");
    }

    #[tokio::test]
    async fn test_undecodable_payload_writes_nothing() {
        let (ingestor, fx) = ingestor_with_ocr(MockTextExtractor::new());
        fx.devices.register_or_update("cam-1", "cam").await.unwrap();

        let err = ingestor
            .handle_photo("photos/cam-1", b"definitely not an image")
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::UnrecognizedImage));
        assert!(fx.photos.is_empty().await);
        assert!(fx.archive.is_empty().await);
    }

    #[tokio::test]
    async fn test_ocr_failure_substitutes_sentinel_and_completes() {
        let mut ocr = MockTextExtractor::new();
        ocr.expect_extract_text()
            .returning(|_| Err(anyhow::anyhow!("engine unavailable")));
        let (ingestor, fx) = ingestor_with_ocr(ocr);
        fx.devices.register_or_update("cam-1", "cam").await.unwrap();

        let photo = ingestor
            .handle_photo("photos/cam-1", &jpeg_bytes())
            .await
            .unwrap();

        assert_eq!(photo.text, OCR_FAILURE_TEXT);
        assert_eq!(fx.photos.len().await, 1);
        assert_eq!(fx.archive.len().await, 1);
    }

    #[tokio::test]
    async fn test_archive_failure_keeps_metadata_record() {
        let devices = Arc::new(InMemoryDeviceRegistry::new());
        let photos = Arc::new(InMemoryPhotoStore::new());
        devices.register_or_update("cam-1", "cam").await.unwrap();

        let mut archive = MockPhotoArchive::new();
        archive
            .expect_put()
            .returning(|_, _, _| Err(anyhow::anyhow!("bucket unreachable")));

        let ingestor = PhotoIngestor::new(
            devices,
            photos.clone(),
            Arc::new(archive),
            Arc::new(ocr_returning("text")),
            test_topics(),
            "photos".to_string(),
        );

        let err = ingestor
            .handle_photo("photos/cam-1", &jpeg_bytes())
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Dependency(_)));
        assert!(!err.is_sender_fault());
        // Metadata-first ordering: the record survives the failed upload.
        assert_eq!(photos.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_and_update_via_messages() {
        let (ingestor, fx) = ingestor_with_ocr(MockTextExtractor::new());

        ingestor
            .handle_register("register/cam-1", b"front door")
            .await
            .unwrap();
        let updated = ingestor
            .handle_register("register/cam-1", b"side door")
            .await
            .unwrap();

        assert_eq!(updated.device_name, "side door");
        assert_eq!(updated.status, DeviceStatus::Active);
        assert_eq!(fx.devices.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_requires_exact_sentinel_payload() {
        let (ingestor, fx) = ingestor_with_ocr(MockTextExtractor::new());
        fx.devices.register_or_update("cam-1", "cam").await.unwrap();

        let err = ingestor
            .handle_disconnect("disconnect/cam-1", b"goodbye")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidDisconnectPayload));

        // Status unchanged by the rejected message
        let device = fx.devices.get("cam-1").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Active);

        ingestor
            .handle_disconnect("disconnect/cam-1", b"Device disconnected")
            .await
            .unwrap();
        let device = fx.devices.get("cam-1").await.unwrap();
        assert_eq!(device.status, DeviceStatus::Inactive);
        assert_eq!(device.device_name, "cam");
    }

    #[tokio::test]
    async fn test_handle_message_routes_by_prefix() {
        let (ingestor, fx) = ingestor_with_ocr(ocr_returning("x"));

        ingestor
            .handle_message("register/cam-1", b"cam one")
            .await
            .unwrap();
        ingestor
            .handle_message("photos/cam-1", &jpeg_bytes())
            .await
            .unwrap();

        assert_eq!(fx.photos.len().await, 1);

        let err = ingestor
            .handle_message("unrelated/cam-1", b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidTopic(_)));
    }
}
