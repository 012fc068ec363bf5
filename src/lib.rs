//! Image Keeper Service
//!
//! CRUD storage service for images, tags and bounding-box detections. Image
//! metadata lives in PostgreSQL, raw image bytes live in an upload directory
//! on the local filesystem keyed by filename, and the whole corpus can be
//! exported as a single ZIP archive (tag manifest, per-image detection JSON
//! enriched with pixel dimensions, and the raw files).
//!
//! ## Features
//!
//! - **Image/Tag/Detection CRUD**: unique image and tag names, find-or-create
//!   tag semantics, cascade deletes from images and tags to detections
//! - **Combined Uploads**: a multipart file plus its detections stored in one
//!   transaction
//! - **Archive Export**: `tags.json` + `images/<name>` + `detections/<stem>.json`,
//!   with width/height probed from file headers
//!
//! ## Architecture
//!
//! ```text
//! HTTP API                   Upload Directory          PostgreSQL
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ /images      │           │ <name>.jpg   │          │ images       │
//! │ /detections  │──────────▶│ <name>.png   │          │ tags         │
//! │ /upload*     │           │ ...          │          │ detections   │
//! └──────────────┘           └──────────────┘          └──────────────┘
//!        │                          │                         ▲
//!        │                          │                         │
//!        ▼                          ▼                         │
//! ┌──────────────┐           ┌──────────────┐                │
//! │ File         │           │ Metadata     │────────────────┘
//! │ Store        │           │ Store        │
//! └──────────────┘           └──────────────┘
//!        │                          │
//!        └──────────┬───────────────┘
//!                   ▼
//!            ┌──────────────┐
//!            │ Export       │──▶ images_detections.zip
//!            │ Engine       │
//!            └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod export;
pub mod file_store;
pub mod metadata_store;

pub use api::{AppState, create_router, start_api_server};
pub use config::Config;
pub use error::ServiceError;
pub use export::{ExportEngine, ARCHIVE_FILENAME};
pub use file_store::FileStore;
pub use metadata_store::{
    BoundingBox, DetectionRecord, DetectionWithTag, ImageRecord, MetadataStore, NewDetection,
    StorageStats, TagRecord,
};
