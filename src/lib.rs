//! Photosink
//!
//! MQTT photo ingestion service. Field devices publish raw images to
//! per-device topics; the service resolves the sender against a device
//! registry, classifies the image format, extracts text through an OCR
//! sidecar, indexes metadata in PostgreSQL and archives the raw bytes in S3.
//! A query API serves time/text/device-filtered photo lists, each decorated
//! with a presigned retrieval URL.
//!
//! ## Architecture
//!
//! ```text
//! MQTT Topics                                     S3 Bucket     PostgreSQL
//! ┌────────────────┐   ┌──────────────────┐      ┌──────────┐  ┌──────────┐
//! │ photos/+       │──▶│ Photo Ingestion  │─────▶│ photos/  │  │ photos   │
//! │ register/+     │──▶│ Pipeline         │──┐   │  {ts}.{fmt}  │ devices  │
//! │ disconnect/+   │──▶│ (decode, OCR)    │  └──▶└──────────┘  └──────────┘
//! └────────────────┘   └──────────────────┘                         ▲
//!        ▲                      │                                   │
//!        │              ┌───────▼────────┐      ┌──────────────┐    │
//! ┌──────┴───────┐      │ Device         │      │ Query API    │────┘
//! │ setup/{id}   │◀─────│ Registry       │◀─────│ (presigned   │
//! └──────────────┘      └────────────────┘      │  URLs)       │
//!                                               └──────────────┘
//! ```

pub mod api;
pub mod archive;
pub mod config;
pub mod device_registry;
pub mod image_format;
pub mod ingest;
pub mod mqtt_consumer;
pub mod ocr;
pub mod photo_store;

pub use archive::{archive_key, InMemoryPhotoArchive, PhotoArchive, S3PhotoArchive};
pub use config::Config;
pub use device_registry::{
    Device, DeviceRegistry, DeviceStatus, InMemoryDeviceRegistry, PostgresDeviceRegistry,
    RegistryError,
};
pub use image_format::ImageFormat;
pub use ingest::{IngestError, IngestTopics, PhotoIngestor};
pub use mqtt_consumer::{DeviceCommander, MqttDeviceCommander, MqttIngestService};
pub use ocr::{HttpOcrClient, TextExtractor, OCR_FAILURE_TEXT};
pub use photo_store::{
    InMemoryPhotoStore, NewPhoto, Photo, PhotoQuery, PhotoRepository, PostgresPhotoStore,
};
