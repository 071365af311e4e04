//! Object-store client: pushes staged files to an S3 bucket and synthesizes
//! the durable public URL.
//!
//! One upload operation, two provider modes selected by configuration:
//! cloud-hosted S3 (region-addressed URLs, optional CDN rewrite) or a
//! self-hosted S3-compatible service behind an explicit endpoint (URLs built
//! from the configured public host, never rewritten).

use async_trait::async_trait;
use opendal::layers::LoggingLayer;
use opendal::services::S3;
use opendal::Operator;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::instrument;

use crate::config::{ObjectStoreConfig, Provider};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to read staged file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("object store rejected key {key}: {source}")]
    Store {
        key: String,
        #[source]
        source: opendal::Error,
    },
}

/// The single operation the ingestion pipeline needs. Either the object
/// fully exists at the destination key afterwards, or the call failed and it
/// does not; re-uploading the same key overwrites and is safe to retry.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<String, UploadError>;
}

/// How public URLs are synthesized for uploaded keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicUrlStyle {
    /// `https://{bucket}.s3.{region}.amazonaws.com/{key}`, with the storage
    /// domain swapped for the CDN domain when one is configured.
    Cloud {
        bucket: String,
        region: String,
        cdn_domain: Option<String>,
    },
    /// `{public_base}/{bucket}/{key}`; never rewritten.
    SelfHosted { bucket: String, public_base: String },
}

impl PublicUrlStyle {
    pub fn from_config(cfg: &ObjectStoreConfig) -> Self {
        match cfg.provider {
            Provider::Cloud => PublicUrlStyle::Cloud {
                bucket: cfg.bucket.clone(),
                region: cfg.region.clone().unwrap_or_default(),
                cdn_domain: cfg.cdn_domain.clone(),
            },
            Provider::SelfHosted => PublicUrlStyle::SelfHosted {
                bucket: cfg.bucket.clone(),
                public_base: cfg.public_url_base.clone().unwrap_or_default(),
            },
        }
    }

    pub fn public_url(&self, key: &str) -> String {
        match self {
            PublicUrlStyle::Cloud {
                bucket,
                region,
                cdn_domain,
            } => {
                let storage_domain = format!("{bucket}.s3.{region}.amazonaws.com");
                let url = format!("https://{storage_domain}/{key}");
                match cdn_domain {
                    Some(cdn) => url.replace(&storage_domain, cdn),
                    None => url,
                }
            }
            PublicUrlStyle::SelfHosted {
                bucket,
                public_base,
            } => format!("{}/{bucket}/{key}", public_base.trim_end_matches('/')),
        }
    }
}

/// Production client over the opendal S3 service. Works against both
/// cloud-hosted S3 and self-hosted S3-compatible services.
pub struct S3ObjectStore {
    op: Operator,
    urls: PublicUrlStyle,
}

impl S3ObjectStore {
    pub fn from_config(cfg: &ObjectStoreConfig) -> Result<Self, opendal::Error> {
        let mut builder = S3::default().bucket(&cfg.bucket);

        // MinIO and friends do not care about the region but opendal wants
        // one; the original deployment only sets it for cloud S3.
        builder = builder.region(cfg.region.as_deref().unwrap_or("us-east-1"));

        if let Some(endpoint) = cfg.endpoint.as_deref() {
            if !endpoint.is_empty() {
                builder = builder.endpoint(endpoint);
            }
        }
        if let Some(access_key) = cfg.access_key.as_deref() {
            builder = builder.access_key_id(access_key);
        }
        if let Some(secret_key) = cfg.secret_key.as_deref() {
            builder = builder.secret_access_key(secret_key);
        }

        let op = Operator::new(builder)?
            .layer(LoggingLayer::default())
            .finish();
        Ok(Self {
            op,
            urls: PublicUrlStyle::from_config(cfg),
        })
    }

    /// Build a client around an existing operator. Tests inject an fs-backed
    /// operator here to exercise the upload path without a bucket.
    pub fn with_operator(op: Operator, urls: PublicUrlStyle) -> Self {
        Self { op, urls }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip_all, fields(key = %key))]
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<String, UploadError> {
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|source| UploadError::Read {
                path: local_path.to_path_buf(),
                source,
            })?;

        let mut writer = self.op.write_with(key, data);
        if self.op.info().full_capability().write_with_content_type {
            writer = writer.content_type(content_type);
        }
        writer.await.map_err(|source| UploadError::Store {
            key: key.to_string(),
            source,
        })?;

        Ok(self.urls.public_url(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendal::services::Fs;

    #[test]
    fn cloud_url_without_cdn() {
        let urls = PublicUrlStyle::Cloud {
            bucket: "pics".into(),
            region: "us-east-1".into(),
            cdn_domain: None,
        };
        assert_eq!(
            urls.public_url("user/a.jpg"),
            "https://pics.s3.us-east-1.amazonaws.com/user/a.jpg"
        );
    }

    #[test]
    fn cloud_url_rewrites_storage_domain_to_cdn() {
        let urls = PublicUrlStyle::Cloud {
            bucket: "pics".into(),
            region: "us-east-1".into(),
            cdn_domain: Some("cdn.example.com".into()),
        };
        assert_eq!(
            urls.public_url("user/a.jpg"),
            "https://cdn.example.com/user/a.jpg"
        );
    }

    #[test]
    fn self_hosted_url_never_rewrites() {
        let urls = PublicUrlStyle::SelfHosted {
            bucket: "pics".into(),
            public_base: "http://files.example.com/".into(),
        };
        assert_eq!(
            urls.public_url("user/a.jpg"),
            "http://files.example.com/pics/user/a.jpg"
        );
    }

    #[tokio::test]
    async fn upload_pushes_exact_bytes() {
        let root = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();

        let op = Operator::new(Fs::default().root(&root.path().to_string_lossy()))
            .unwrap()
            .finish();
        let store = S3ObjectStore::with_operator(
            op,
            PublicUrlStyle::SelfHosted {
                bucket: "pics".into(),
                public_base: "http://files.example.com".into(),
            },
        );

        let staged = staging.path().join("in.jpg");
        let payload = vec![0xAB; 10 * 1024];
        tokio::fs::write(&staged, &payload).await.unwrap();

        let url = store
            .upload(&staged, "user/out.jpg", "image/jpeg")
            .await
            .unwrap();
        assert_eq!(url, "http://files.example.com/pics/user/out.jpg");

        let stored = tokio::fs::read(root.path().join("user/out.jpg")).await.unwrap();
        assert_eq!(stored, payload);
    }

    #[tokio::test]
    async fn upload_missing_staged_file_is_a_read_error() {
        let root = tempfile::tempdir().unwrap();
        let op = Operator::new(Fs::default().root(&root.path().to_string_lossy()))
            .unwrap()
            .finish();
        let store = S3ObjectStore::with_operator(
            op,
            PublicUrlStyle::SelfHosted {
                bucket: "pics".into(),
                public_base: "http://files.example.com".into(),
            },
        );

        let err = store
            .upload(Path::new("/nonexistent/in.jpg"), "user/out.jpg", "image/jpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Read { .. }));
    }
}
