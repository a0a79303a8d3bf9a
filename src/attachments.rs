//! Attachment storage for invoice files
//!
//! Uploads happen before a transaction opens and trash moves after it commits;
//! neither is part of the database transaction.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tracing::{debug, info};

use crate::db::FileDescriptor;
use crate::error::LedgerError;

/// File waiting to be uploaded alongside an activity write
#[derive(Debug, Clone)]
pub struct PendingAttachment {
    pub file_name: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn upload(&self, attachment: PendingAttachment) -> Result<FileDescriptor, LedgerError>;

    /// Move a stored file out of the live area
    async fn move_to_trash(&self, file: &FileDescriptor) -> Result<(), LedgerError>;
}

/// Attachments on the local filesystem
pub struct LocalAttachmentStore {
    root_dir: PathBuf,
    trash_dir: PathBuf,
}

impl LocalAttachmentStore {
    pub async fn new<P: AsRef<Path>>(root_dir: P, trash_dir: P) -> Result<Self, LedgerError> {
        let root_dir = root_dir.as_ref().to_path_buf();
        let trash_dir = trash_dir.as_ref().to_path_buf();

        fs::create_dir_all(&root_dir).await?;
        fs::create_dir_all(&trash_dir).await?;

        info!(path = %root_dir.display(), "Initialized attachment store");

        Ok(Self { root_dir, trash_dir })
    }

    fn sanitize(file_name: &str) -> String {
        file_name
            .chars()
            .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
            .collect()
    }
}

#[async_trait]
impl AttachmentStore for LocalAttachmentStore {
    async fn upload(&self, attachment: PendingAttachment) -> Result<FileDescriptor, LedgerError> {
        if attachment.file_name.trim().is_empty() {
            return Err(LedgerError::Validation("attachment file name is empty".into()));
        }

        let stored_name = format!(
            "{}_{}",
            uuid::Uuid::new_v4(),
            Self::sanitize(attachment.file_name.trim())
        );
        let path = self.root_dir.join(&stored_name);
        fs::write(&path, &attachment.data).await?;

        debug!(path = %path.display(), size = attachment.data.len(), "Stored attachment");

        Ok(FileDescriptor {
            name: attachment.file_name,
            path: path.to_string_lossy().into_owned(),
            size_bytes: attachment.data.len() as u64,
            uploaded_at: Utc::now(),
        })
    }

    async fn move_to_trash(&self, file: &FileDescriptor) -> Result<(), LedgerError> {
        let source = PathBuf::from(&file.path);
        let file_name = source
            .file_name()
            .ok_or_else(|| LedgerError::NotFound(format!("attachment path {}", file.path)))?;
        let target = self.trash_dir.join(file_name);

        fs::rename(&source, &target).await?;
        info!(from = %source.display(), to = %target.display(), "Moved attachment to trash");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_upload_then_trash() {
        let temp = TempDir::new().unwrap();
        let store = LocalAttachmentStore::new(temp.path().join("files"), temp.path().join("trash"))
            .await
            .unwrap();

        let file = store
            .upload(PendingAttachment {
                file_name: "invoice/2025.pdf".into(),
                data: b"pdf".to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(file.size_bytes, 3);
        assert!(file.path.ends_with("invoice_2025.pdf"));
        assert!(Path::new(&file.path).exists());

        store.move_to_trash(&file).await.unwrap();
        assert!(!Path::new(&file.path).exists());
        let trashed = std::fs::read_dir(temp.path().join("trash")).unwrap().count();
        assert_eq!(trashed, 1);
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let temp = TempDir::new().unwrap();
        let store = LocalAttachmentStore::new(temp.path().join("files"), temp.path().join("trash"))
            .await
            .unwrap();
        let err = store
            .upload(PendingAttachment { file_name: " ".into(), data: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
