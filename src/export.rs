use crate::error::ServiceError;
use crate::file_store::FileStore;
use crate::metadata_store::{DetectionRecord, ImageRecord, MetadataStore, TagRecord};
use serde::Serialize;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Suggested filename for the exported archive
pub const ARCHIVE_FILENAME: &str = "images_detections.zip";

/// Tag entry in the archive manifest (`tags.json`)
#[derive(Debug, Serialize)]
struct TagManifestEntry {
    id: i64,
    name: String,
}

/// Detection entry enriched with its image's pixel dimensions.
///
/// `width`/`height` are `null` when the backing file is missing or its
/// header cannot be read.
#[derive(Debug, Serialize)]
struct DetectionExportEntry {
    id: i64,
    tag_id: i64,
    x_min: i32,
    y_min: i32,
    x_max: i32,
    y_max: i32,
    width: Option<u32>,
    height: Option<u32>,
}

/// Export engine assembling the whole corpus into one ZIP archive.
///
/// Layout: `tags.json` at the root, `images/<name>` for every image whose
/// backing file exists, and `detections/<stem>.json` for every image.
pub struct ExportEngine {
    metadata_store: Arc<MetadataStore>,
    file_store: Arc<FileStore>,
}

impl ExportEngine {
    pub fn new(metadata_store: Arc<MetadataStore>, file_store: Arc<FileStore>) -> Self {
        Self {
            metadata_store,
            file_store,
        }
    }

    /// Export all tags, images and detections as a single archive.
    ///
    /// The archive is buffered fully in memory before it is returned; this
    /// is sized for small corpora, not a streaming pipeline.
    #[instrument(skip(self))]
    pub async fn export_archive(&self) -> Result<Vec<u8>, ServiceError> {
        let tags = self.metadata_store.list_tags().await?;
        let images = self.metadata_store.list_images().await?;

        let mut entries = Vec::with_capacity(images.len());
        for image in images {
            let detections = self
                .metadata_store
                .list_detections_by_image_id(image.id)
                .await?;
            entries.push((image, detections));
        }

        let archive = build_archive(self.file_store.upload_dir(), &tags, &entries)?;

        info!(
            tag_count = tags.len(),
            image_count = entries.len(),
            archive_bytes = archive.len(),
            "Export archive assembled"
        );
        metrics::counter!("keeper.exports.completed").increment(1);

        Ok(archive)
    }
}

/// Assemble the archive from already-fetched records.
///
/// A missing backing file means no `images/` entry and `null` dimensions for
/// that image's detections; a file whose header cannot be parsed keeps its
/// `images/` entry but also falls back to `null` dimensions. Neither aborts
/// the export.
fn build_archive(
    upload_dir: &Path,
    tags: &[TagRecord],
    entries: &[(ImageRecord, Vec<DetectionRecord>)],
) -> Result<Vec<u8>, ServiceError> {
    let mut cursor = Cursor::new(Vec::new());

    {
        let mut archive = ZipWriter::new(&mut cursor);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let manifest: Vec<TagManifestEntry> = tags
            .iter()
            .map(|tag| TagManifestEntry {
                id: tag.id,
                name: tag.name.clone(),
            })
            .collect();
        archive.start_file("tags.json", options)?;
        archive.write_all(&serde_json::to_vec_pretty(&manifest)?)?;

        for (image, detections) in entries {
            let image_path = upload_dir.join(&image.name);

            let dimensions = if image_path.exists() {
                let bytes = std::fs::read(&image_path)?;
                archive.start_file(format!("images/{}", image.name), options)?;
                archive.write_all(&bytes)?;

                probe_dimensions(&image_path)
            } else {
                warn!(
                    image = %image.name,
                    "Backing file missing, exporting detections without dimensions"
                );
                None
            };

            let (width, height) = match dimensions {
                Some((w, h)) => (Some(w), Some(h)),
                None => (None, None),
            };

            let detection_entries: Vec<DetectionExportEntry> = detections
                .iter()
                .map(|d| DetectionExportEntry {
                    id: d.id,
                    tag_id: d.tag_id,
                    x_min: d.x_min,
                    y_min: d.y_min,
                    x_max: d.x_max,
                    y_max: d.y_max,
                    width,
                    height,
                })
                .collect();

            archive.start_file(format!("detections/{}.json", file_stem(&image.name)), options)?;
            archive.write_all(&serde_json::to_vec_pretty(&detection_entries)?)?;
        }

        archive.finish()?;
    }

    Ok(cursor.into_inner())
}

/// Read pixel dimensions from the file header without decoding the image
fn probe_dimensions(path: &Path) -> Option<(u32, u32)> {
    match image::image_dimensions(path) {
        Ok(dimensions) => Some(dimensions),
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Failed to probe image dimensions"
            );
            None
        }
    }
}

/// Filename without its final extension, for the per-image detections entry
fn file_stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Read;

    fn image_record(id: i64, name: &str) -> ImageRecord {
        ImageRecord {
            id,
            name: name.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn tag_record(id: i64, name: &str) -> TagRecord {
        TagRecord {
            id,
            name: name.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn detection_record(id: i64, image_id: i64, tag_id: i64) -> DetectionRecord {
        DetectionRecord {
            id,
            image_id,
            tag_id,
            x_min: 1,
            y_min: 2,
            x_max: 10,
            y_max: 20,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn write_png(path: &Path, width: u32, height: u32) {
        image::RgbImage::new(width, height).save(path).unwrap();
    }

    fn archive_entry(archive_bytes: &[u8], name: &str) -> Vec<u8> {
        let mut archive = zip::ZipArchive::new(Cursor::new(archive_bytes)).unwrap();
        let mut entry = archive.by_name(name).unwrap();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("a.jpg"), "a");
        assert_eq!(file_stem("photo.tar.gz"), "photo.tar");
        assert_eq!(file_stem("noext"), "noext");
    }

    #[test]
    fn test_archive_layout_and_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a.png"), 4, 3);
        write_png(&dir.path().join("b.png"), 8, 5);

        let tags = vec![tag_record(1, "cat"), tag_record(2, "dog")];
        let entries = vec![
            (
                image_record(1, "a.png"),
                vec![detection_record(1, 1, 1), detection_record(2, 1, 2)],
            ),
            (image_record(2, "b.png"), vec![detection_record(3, 2, 1)]),
        ];

        let bytes = build_archive(dir.path(), &tags, &entries).unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.as_slice())).unwrap();
        let mut names: Vec<String> = archive.file_names().map(String::from).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "detections/a.json",
                "detections/b.json",
                "images/a.png",
                "images/b.png",
                "tags.json",
            ]
        );
        drop(archive);

        let manifest: serde_json::Value =
            serde_json::from_slice(&archive_entry(&bytes, "tags.json")).unwrap();
        assert_eq!(manifest[0]["name"], "cat");
        assert_eq!(manifest[1]["name"], "dog");

        let a_detections: serde_json::Value =
            serde_json::from_slice(&archive_entry(&bytes, "detections/a.json")).unwrap();
        assert_eq!(a_detections.as_array().unwrap().len(), 2);
        for entry in a_detections.as_array().unwrap() {
            assert_eq!(entry["width"], 4);
            assert_eq!(entry["height"], 3);
        }

        // b's listing holds only b's detections, with b's dimensions
        let b_detections: serde_json::Value =
            serde_json::from_slice(&archive_entry(&bytes, "detections/b.json")).unwrap();
        assert_eq!(b_detections.as_array().unwrap().len(), 1);
        assert_eq!(b_detections[0]["id"], 3);
        assert_eq!(b_detections[0]["width"], 8);
        assert_eq!(b_detections[0]["height"], 5);
    }

    #[test]
    fn test_missing_file_exports_null_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("present.png"), 4, 3);

        let tags = vec![tag_record(1, "cat")];
        let entries = vec![
            (
                image_record(1, "present.png"),
                vec![detection_record(1, 1, 1)],
            ),
            (
                image_record(2, "missing.png"),
                vec![detection_record(2, 2, 1)],
            ),
        ];

        let bytes = build_archive(dir.path(), &tags, &entries).unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.as_slice())).unwrap();
        let names: Vec<String> = archive.file_names().map(String::from).collect();
        assert!(names.contains(&"images/present.png".to_string()));
        assert!(!names.contains(&"images/missing.png".to_string()));
        assert!(names.contains(&"detections/missing.json".to_string()));
        drop(archive);

        let missing: serde_json::Value =
            serde_json::from_slice(&archive_entry(&bytes, "detections/missing.json")).unwrap();
        assert_eq!(missing[0]["width"], serde_json::Value::Null);
        assert_eq!(missing[0]["height"], serde_json::Value::Null);

        let present: serde_json::Value =
            serde_json::from_slice(&archive_entry(&bytes, "detections/present.json")).unwrap();
        assert_eq!(present[0]["width"], 4);
        assert_eq!(present[0]["height"], 3);
    }

    #[test]
    fn test_malformed_file_keeps_entry_without_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.png"), b"not a png").unwrap();

        let entries = vec![(
            image_record(1, "broken.png"),
            vec![detection_record(1, 1, 1)],
        )];

        let bytes = build_archive(dir.path(), &[], &entries).unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.as_slice())).unwrap();
        let names: Vec<String> = archive.file_names().map(String::from).collect();
        assert!(names.contains(&"images/broken.png".to_string()));
        drop(archive);

        let detections: serde_json::Value =
            serde_json::from_slice(&archive_entry(&bytes, "detections/broken.json")).unwrap();
        assert_eq!(detections[0]["width"], serde_json::Value::Null);
    }
}
