use crate::error::ServiceError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument};

/// Filesystem store for raw image bytes, keyed by filename.
///
/// The image record in the database and the file of the same name here are
/// logically one entity split across two stores. Concurrent writes to the
/// same filename are last-writer-wins; the unique constraint on image names
/// in the database is the only guard against duplicate uploads.
pub struct FileStore {
    upload_dir: PathBuf,
}

impl FileStore {
    /// Create a file store, ensuring the upload directory exists
    pub async fn new(upload_dir: impl Into<PathBuf>) -> Result<Self, ServiceError> {
        let upload_dir = upload_dir.into();
        fs::create_dir_all(&upload_dir).await?;

        info!(upload_dir = %upload_dir.display(), "Upload directory ready");

        Ok(Self { upload_dir })
    }

    /// Resolve a filename against the upload directory
    pub fn path_for(&self, name: &str) -> Result<PathBuf, ServiceError> {
        validate_filename(name)?;
        Ok(self.upload_dir.join(name))
    }

    /// Write file bytes, replacing any existing file of the same name
    #[instrument(skip(self, bytes), fields(name = %name, size_bytes = bytes.len()))]
    pub async fn write(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, ServiceError> {
        let path = self.path_for(name)?;
        fs::write(&path, bytes).await?;

        debug!(path = %path.display(), "File written");

        Ok(path)
    }

    /// Read file bytes, `None` if the file does not exist
    pub async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, ServiceError> {
        let path = self.path_for(name)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a file; a missing file is not an error
    pub async fn delete(&self, name: &str) -> Result<(), ServiceError> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "File deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Check whether a file exists in the upload directory
    pub async fn exists(&self, name: &str) -> Result<bool, ServiceError> {
        let path = self.path_for(name)?;
        Ok(fs::try_exists(&path).await?)
    }

    /// Get the upload directory path
    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }
}

/// Reject filenames that could escape the upload directory
pub fn validate_filename(name: &str) -> Result<(), ServiceError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(ServiceError::Validation(format!(
            "Invalid image name: {name:?}"
        )));
    }
    Ok(())
}

/// Content type for an image filename, by extension
pub fn content_type_for(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("photo.jpg").is_ok());
        assert!(validate_filename("photo-001_a.png").is_ok());
        assert!(validate_filename("").is_err());
        assert!(validate_filename(".").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("../photo.jpg").is_err());
        assert!(validate_filename("a/b.jpg").is_err());
        assert!(validate_filename("a\\b.jpg").is_err());
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a.jpg"), "image/jpeg");
        assert_eq!(content_type_for("a.JPEG"), "image/jpeg");
        assert_eq!(content_type_for("a.png"), "image/png");
        assert_eq!(content_type_for("a.gif"), "image/gif");
        assert_eq!(content_type_for("a"), "application/octet-stream");
        assert_eq!(content_type_for("a.bin"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_write_read_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();

        let path = store.write("a.jpg", b"jpeg bytes").await.unwrap();
        assert!(path.ends_with("a.jpg"));
        assert!(store.exists("a.jpg").await.unwrap());

        let bytes = store.read("a.jpg").await.unwrap();
        assert_eq!(bytes.as_deref(), Some(b"jpeg bytes".as_slice()));

        store.delete("a.jpg").await.unwrap();
        assert!(!store.exists("a.jpg").await.unwrap());
        assert_eq!(store.read("a.jpg").await.unwrap(), None);

        // Deleting again is tolerated
        store.delete("a.jpg").await.unwrap();
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).await.unwrap();

        assert!(store.read("../escape.jpg").await.is_err());
        assert!(store.write("../escape.jpg", b"x").await.is_err());
    }
}
