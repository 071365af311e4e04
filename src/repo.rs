//! Blob persistence over the transactional store surface.

use tracing::warn;

use crate::model::Blob;
use crate::store::{StoreConn, StoreError};

const TIMESTAMP_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Insert the blob row and its owner-association row in a single
/// transaction. Commit happens only after both are staged; on any failure
/// the transaction is rolled back and nothing is visible.
pub async fn insert_blob_for_owner<C: StoreConn>(
    conn: &mut C,
    blob: &Blob,
    owner_id: &str,
) -> Result<(), StoreError> {
    conn.begin().await?;
    if let Err(err) = stage_rows(conn, blob, owner_id).await {
        if let Err(rb_err) = conn.rollback().await {
            warn!(error = %rb_err, "rollback failed after aborted blob insert");
        }
        return Err(err);
    }
    conn.commit().await
}

async fn stage_rows<C: StoreConn>(
    conn: &mut C,
    blob: &Blob,
    owner_id: &str,
) -> Result<(), StoreError> {
    let created_at = blob.created_at.format(TIMESTAMP_FMT).to_string();
    let updated_at = blob.updated_at.format(TIMESTAMP_FMT).to_string();
    conn.execute(
        "INSERT INTO blobs (id, content_type, filename, url, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
        &[
            &blob.id,
            &blob.content_type,
            &blob.filename,
            &blob.url,
            &created_at,
            &updated_at,
        ],
    )
    .await?;
    conn.execute(
        "INSERT INTO user_blobs (user_id, blob_id) VALUES (?, ?)",
        &[owner_id, &blob.id],
    )
    .await?;
    Ok(())
}
