//! Local staging of uploaded files ahead of the object-store push.

use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// One inbound upload as handed over by the routing layer.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// An uploaded file written to local ephemeral storage. The file is removed
/// when the value drops, so it survives exactly as long as one ingestion
/// call regardless of how that call exits.
#[derive(Debug)]
pub struct StagedFile {
    pub path: PathBuf,
    pub original_name: String,
    pub extension: String,
    pub content_type: String,
}

impl StagedFile {
    /// Write `file` under a freshly generated name in `dir`, preserving the
    /// original extension (`bin` when there is none).
    pub async fn stage(dir: &Path, file: &IncomingFile) -> std::io::Result<StagedFile> {
        let extension = Path::new(&file.filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("bin")
            .to_string();
        let path = dir.join(format!("{}.{}", Uuid::new_v4(), extension));
        tokio::fs::write(&path, &file.bytes).await?;
        Ok(StagedFile {
            path,
            original_name: file.filename.clone(),
            extension,
            content_type: file.content_type.clone(),
        })
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove staged file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(name: &str) -> IncomingFile {
        IncomingFile {
            filename: name.to_string(),
            content_type: "image/jpeg".to_string(),
            bytes: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn stage_writes_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let staged = StagedFile::stage(dir.path(), &jpeg("photo.jpg")).await.unwrap();
        assert_eq!(staged.extension, "jpg");
        assert_eq!(staged.original_name, "photo.jpg");
        assert_eq!(tokio::fs::read(&staged.path).await.unwrap(), vec![1, 2, 3]);

        let path = staged.path.clone();
        drop(staged);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn extensionless_uploads_stage_as_bin() {
        let dir = tempfile::tempdir().unwrap();
        let staged = StagedFile::stage(dir.path(), &jpeg("README")).await.unwrap();
        assert_eq!(staged.extension, "bin");
    }

    #[tokio::test]
    async fn staged_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let a = StagedFile::stage(dir.path(), &jpeg("a.jpg")).await.unwrap();
        let b = StagedFile::stage(dir.path(), &jpeg("a.jpg")).await.unwrap();
        assert_ne!(a.path, b.path);
    }

    #[tokio::test]
    async fn stage_into_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = StagedFile::stage(&missing, &jpeg("a.jpg")).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
