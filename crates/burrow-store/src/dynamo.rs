//! DynamoDB backend.
//!
//! Items carry the key in attribute `k` and the value in attribute `va`.
//! DynamoDB rejects empty binary attributes, so an empty value is an item
//! with no `va` at all, and reads turn that back into empty bytes.

use async_trait::async_trait;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::AttributeValue;
use tokio::sync::OnceCell;

use crate::{hex, Store, StoreError};

#[derive(Debug)]
pub struct DynamoStore {
    profile: String,
    region: String,
    table: String,
    client: OnceCell<aws_sdk_dynamodb::Client>,
}

impl DynamoStore {
    pub fn new(
        profile: impl Into<String>,
        region: impl Into<String>,
        table: impl Into<String>,
    ) -> DynamoStore {
        DynamoStore {
            profile: profile.into(),
            region: region.into(),
            table: table.into(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> &aws_sdk_dynamodb::Client {
        self.client
            .get_or_init(|| async {
                let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .profile_name(&self.profile)
                    .region(aws_config::Region::new(self.region.clone()))
                    .load()
                    .await;
                aws_sdk_dynamodb::Client::new(&config)
            })
            .await
    }
}

#[async_trait]
impl Store for DynamoStore {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let output = self
            .client()
            .await
            .get_item()
            .table_name(&self.table)
            .key("k", AttributeValue::B(Blob::new(key.to_vec())))
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.into_service_error().to_string()))?;
        let Some(item) = output.item else {
            return Err(StoreError::NotFound(hex(&key[..key.len().min(10)])));
        };
        match item.get("va") {
            Some(AttributeValue::B(blob)) => Ok(blob.as_ref().to_vec()),
            Some(other) => Err(StoreError::Backend(format!(
                "value attribute has unexpected type: {other:?}"
            ))),
            None => Ok(Vec::new()),
        }
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut request = self
            .client()
            .await
            .put_item()
            .table_name(&self.table)
            .item("k", AttributeValue::B(Blob::new(key.to_vec())));
        if !value.is_empty() {
            request = request.item("va", AttributeValue::B(Blob::new(value.to_vec())));
        }
        request
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.into_service_error().to_string()))?;
        Ok(())
    }
}
