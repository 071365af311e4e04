//! Blob-ingestion pipeline: stage locally, push to the object store, then
//! record the blob and its owner association in one transaction.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::model::Blob;
use crate::object_store::{ObjectStore, UploadError};
use crate::pool::Pool;
use crate::repo;
use crate::staging::{IncomingFile, StagedFile};
use crate::store::Connector;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Local staging failed; nothing left the machine.
    #[error("failed to stage upload locally: {0}")]
    Staging(#[from] std::io::Error),
    /// The object-store push failed; no database write was attempted.
    #[error(transparent)]
    Upload(#[from] UploadError),
    /// The object was uploaded but the database never recorded it. The two
    /// stores disagree; the key and blob id are surfaced so an operator can
    /// reconcile or retry the database step.
    #[error("blob {blob_id} uploaded to key {key} but not recorded: {source}")]
    Inconsistent {
        blob_id: String,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// The ingestion pipeline. Holds the process-wide pool and object-store
/// handles; construct once at startup and share.
pub struct Ingestor<C: Connector> {
    pool: Pool<C>,
    store: Arc<dyn ObjectStore>,
    staging_dir: PathBuf,
}

impl<C: Connector> Ingestor<C> {
    pub fn new(pool: Pool<C>, store: Arc<dyn ObjectStore>, staging_dir: PathBuf) -> Self {
        Self {
            pool,
            store,
            staging_dir,
        }
    }

    /// Ingest one uploaded file for `owner_id`.
    ///
    /// The staged copy is deleted on every exit path. Failures map onto how
    /// far the call got: [`IngestError::Staging`] before any network call,
    /// [`IngestError::Upload`] before any database write, and
    /// [`IngestError::Inconsistent`] for the one case where the object store
    /// and the database can diverge.
    #[instrument(skip_all, fields(owner_id = %owner_id, filename = %file.filename))]
    pub async fn ingest(&self, file: &IncomingFile, owner_id: &str) -> Result<Blob, IngestError> {
        let staged = StagedFile::stage(&self.staging_dir, file).await?;

        let key = format!("user/{}.{}", Uuid::new_v4(), staged.extension);
        let url = self
            .store
            .upload(&staged.path, &key, &staged.content_type)
            .await?;
        drop(staged);

        let blob = Blob::new(&file.filename, &file.content_type, &url);
        self.persist(&blob, owner_id, &key).await?;

        info!(blob_id = %blob.id, key, "ingested blob");
        Ok(blob)
    }

    /// Ingest a batch of files for one owner, in order. Stops at the first
    /// failure; already-ingested blobs stay committed.
    pub async fn ingest_all(
        &self,
        files: &[IncomingFile],
        owner_id: &str,
    ) -> Result<Vec<Blob>, IngestError> {
        let mut blobs = Vec::with_capacity(files.len());
        for file in files {
            blobs.push(self.ingest(file, owner_id).await?);
        }
        Ok(blobs)
    }

    /// Record the blob after a successful upload. Every failure past this
    /// point leaves an object without a row, so everything maps to
    /// `Inconsistent`.
    async fn persist(&self, blob: &Blob, owner_id: &str, key: &str) -> Result<(), IngestError> {
        let inconsistent = |source: Box<dyn std::error::Error + Send + Sync>| {
            error!(
                blob_id = %blob.id,
                key,
                error = %source,
                "object uploaded but blob record not committed; stores disagree"
            );
            IngestError::Inconsistent {
                blob_id: blob.id.clone(),
                key: key.to_string(),
                source,
            }
        };

        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(err) => return Err(inconsistent(Box::new(err))),
        };
        let result = repo::insert_blob_for_owner(&mut *conn, blob, owner_id).await;
        self.pool.release(conn).await;
        result.map_err(|err| inconsistent(Box::new(err)))
    }
}
