//! Object-storage backend.
//!
//! Keys map to objects named by their lowercase hex form. The AWS client
//! is built on first use so constructing the store (and the builder that
//! configures it) stays synchronous and offline.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use tokio::sync::OnceCell;

use crate::{hex, Store, StoreError};

#[derive(Debug)]
pub struct S3Store {
    profile: String,
    region: String,
    bucket: String,
    client: OnceCell<aws_sdk_s3::Client>,
}

impl S3Store {
    pub fn new(
        profile: impl Into<String>,
        region: impl Into<String>,
        bucket: impl Into<String>,
    ) -> S3Store {
        S3Store {
            profile: profile.into(),
            region: region.into(),
            bucket: bucket.into(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> &aws_sdk_s3::Client {
        self.client
            .get_or_init(|| async {
                let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .profile_name(&self.profile)
                    .region(aws_config::Region::new(self.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::Client::new(&config)
            })
            .await
    }
}

#[async_trait]
impl Store for S3Store {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let output = self
            .client()
            .await
            .get_object()
            .bucket(&self.bucket)
            .key(hex(key))
            .send()
            .await;
        match output {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(data.into_bytes().to_vec())
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    Err(StoreError::not_found(key))
                } else {
                    Err(StoreError::Backend(service_error.to_string()))
                }
            }
        }
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.client()
            .await
            .put_object()
            .bucket(&self.bucket)
            .key(hex(key))
            .body(ByteStream::from(value.to_vec()))
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.into_service_error().to_string()))?;
        Ok(())
    }
}
