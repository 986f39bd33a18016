//! Artifact processing: turning a downloaded file into a transportable
//! reference (inline data URI for images, presigned URL for everything
//! else when an object store is configured).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::warn;

use crate::config::ObjectStoreConfig;

/// A file artifact produced during execution, shipped back to the caller
/// as inline data or a signed URL.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ArtifactRef {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: Option<u64>,
    pub url: Option<String>,
}

/// Uploads artifacts to durable storage and hands back an access URL.
///
/// Namespacing by owner/session is the store's responsibility; the core
/// only supplies the object name it would like used.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(
        &self,
        local_path: &Path,
        object_name: &str,
        owner_id: &str,
        session_id: &str,
    ) -> anyhow::Result<String>;
}

/// Processes a single downloaded file into an [`ArtifactRef`].
pub struct ArtifactProcessor {
    store: Option<Arc<dyn ArtifactStore>>,
}

impl ArtifactProcessor {
    pub fn new(store: Option<Arc<dyn ArtifactStore>>) -> Self {
        Self { store }
    }

    pub fn without_store() -> Self {
        Self { store: None }
    }

    /// Process a local file (already downloaded from the sandbox) into an
    /// [`ArtifactRef`].
    ///
    /// Images are always inlined as base64 data URIs — never uploaded.
    /// Everything else is uploaded if a store is configured; upload
    /// failures are logged and leave `url` unset rather than failing the
    /// whole call (§4.2, §7: artifact errors are swallowed).
    pub async fn process_file(
        &self,
        local_path: &Path,
        original_filename: &str,
        owner_id: &str,
        session_id: &str,
    ) -> anyhow::Result<ArtifactRef> {
        let mime_type = mime_guess::from_path(original_filename)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let size_bytes = tokio::fs::metadata(local_path).await.ok().map(|m| m.len());

        let mut artifact = ArtifactRef {
            filename: original_filename.to_string(),
            mime_type: mime_type.clone(),
            size_bytes,
            url: None,
        };

        if mime_type.starts_with("image/") {
            let bytes = tokio::fs::read(local_path).await?;
            let encoded = BASE64.encode(bytes);
            artifact.url = Some(format!("data:{mime_type};base64,{encoded}"));
        } else if let Some(store) = &self.store {
            match store
                .upload(local_path, original_filename, owner_id, session_id)
                .await
            {
                Ok(url) => artifact.url = Some(url),
                Err(err) => {
                    warn!(filename = %original_filename, error = %err, "artifact upload failed, leaving url unset");
                }
            }
        }

        Ok(artifact)
    }
}

/// S3-compatible object store, grounded on the `boto3`-based store this
/// crate's Python predecessor used: upload the object, then hand back a
/// presigned GET URL valid for one hour.
pub struct S3ArtifactStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ArtifactStore {
    pub async fn from_config(config: &ObjectStoreConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "sandbox-orchestrator-config",
            ));
        }

        let shared_config = loader.load().await;
        let client = aws_sdk_s3::Client::new(&shared_config);

        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn upload(
        &self,
        local_path: &Path,
        object_name: &str,
        owner_id: &str,
        session_id: &str,
    ) -> anyhow::Result<String> {
        let key = format!("{owner_id}/{session_id}/{object_name}");
        let body = aws_sdk_s3::primitives::ByteStream::from_path(local_path).await?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await?;

        let presigning_config = aws_sdk_s3::presigning::PresigningConfig::expires_in(
            std::time::Duration::from_secs(3600),
        )?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(presigning_config)
            .await?;

        Ok(presigned.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn image_is_inlined_as_data_uri() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("new.png");
        tokio::fs::write(&path, b"\x89PNG\r\n\x1a\nfakepngbytes")
            .await
            .unwrap();

        let processor = ArtifactProcessor::without_store();
        let artifact = processor
            .process_file(&path, "new.png", "u1", "s1")
            .await
            .unwrap();

        assert_eq!(artifact.mime_type, "image/png");
        assert!(artifact.url.unwrap().starts_with("data:image/png;base64,"));
    }

    #[tokio::test]
    async fn non_image_without_store_has_no_url() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let processor = ArtifactProcessor::without_store();
        let artifact = processor
            .process_file(&path, "notes.txt", "u1", "s1")
            .await
            .unwrap();

        assert_eq!(artifact.mime_type, "text/plain");
        assert!(artifact.url.is_none());
    }

    struct FailingStore;

    #[async_trait]
    impl ArtifactStore for FailingStore {
        async fn upload(
            &self,
            _local_path: &Path,
            _object_name: &str,
            _owner_id: &str,
            _session_id: &str,
        ) -> anyhow::Result<String> {
            anyhow::bail!("simulated upload failure")
        }
    }

    #[tokio::test]
    async fn failed_upload_leaves_url_unset_instead_of_failing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let processor = ArtifactProcessor::new(Some(Arc::new(FailingStore)));
        let artifact = processor
            .process_file(&path, "notes.txt", "u1", "s1")
            .await
            .unwrap();

        assert!(artifact.url.is_none());
    }
}
