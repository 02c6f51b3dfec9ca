//! S3 object-store backend.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::Path;
use tracing::debug;

use studiosync_common::{Error, ObjectKey, Result};

use crate::provider::{read_with_backoff, ObjectStore, RemoteObject};

/// Bucket region used by the service.
const AWS_REGION: &str = "us-east-1";

/// S3-backed object store.
///
/// Credentials are injected at construction; the daemon obtains them either
/// from static configuration or from the metadata service's credential
/// vending endpoint.
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Build a store for one bucket with static or vended credentials.
    pub fn new(access: &str, secret: &str, session: Option<String>, bucket: impl Into<String>) -> Self {
        let credentials = Credentials::new(access, secret, session, None, "static");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(AWS_REGION))
            .credentials_provider(credentials)
            .build();

        let bucket = bucket.into();
        debug!(%bucket, "using S3 bucket");
        Self { client: Client::from_conf(config), bucket }
    }

    fn storage_err(op: &str, key: &str, err: impl std::fmt::Display) -> Error {
        Error::Storage(format!("{} {}: {}", op, key, err))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn name(&self) -> &str {
        "s3"
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }

            let page = request
                .send()
                .await
                .map_err(|e| Self::storage_err("list", prefix, e))?;

            for object in page.contents() {
                let (Some(key), Some(etag)) = (object.key(), object.e_tag()) else {
                    continue;
                };
                objects.push(RemoteObject {
                    // Legacy clients wrote some keys with backslashes;
                    // ObjectKey normalizes them on the way in.
                    key: ObjectKey::new(key)?,
                    etag: etag.trim_matches('"').to_string(),
                });
            }

            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        debug!(prefix, count = objects.len(), "listed remote objects");
        Ok(objects)
    }

    async fn upload(&self, local: &Path, key: &ObjectKey) -> Result<()> {
        let data = read_with_backoff(local).await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Self::storage_err("upload", key.as_str(), e))?;
        Ok(())
    }

    async fn download(&self, key: &ObjectKey, local: &Path) -> Result<()> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| Self::storage_err("download", key.as_str(), e))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| Self::storage_err("download", key.as_str(), e))?
            .into_bytes();

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, data).await?;
        Ok(())
    }

    async fn copy(&self, src: &ObjectKey, dst: &ObjectKey) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src.as_str()))
            .key(dst.as_str())
            .send()
            .await
            .map_err(|e| Self::storage_err("copy", src.as_str(), e))?;
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| Self::storage_err("delete", key.as_str(), e))?;
        Ok(())
    }
}
