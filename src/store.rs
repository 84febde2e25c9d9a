//! Object-store access seam.
//!
//! Product files live in a public bucket reachable with unsigned requests,
//! so the store client is a distinct capability from the authenticated
//! catalog client: it carries no credentials at all. The `StoreOps` trait
//! is the boundary the lister and scheduler work against; tests substitute
//! an in-memory implementation.

use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::operation::get_object::GetObjectOutput;
use aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Output;
use aws_sdk_s3::Client;
use serde::Serialize;
use thiserror::Error;

use crate::error::FetchError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object store request failed: {0}")]
    Request(String),
}

impl From<StoreError> for FetchError {
    fn from(err: StoreError) -> Self {
        FetchError::Network(err.to_string())
    }
}

/// One remote file of a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageObjectRef {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
}

pub trait StoreOps {
    async fn get_object(self: &Self, bucket: &str, key: &str)
        -> Result<GetObjectOutput, StoreError>;

    async fn get_object_range(
        self: &Self,
        bucket: &str,
        key: &str,
        start_byte: u64,
        end_byte: u64,
    ) -> Result<GetObjectOutput, StoreError>;

    async fn list_objects_page(
        self: &Self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListObjectsV2Output, StoreError>;
}

/// Unsigned client for the public imagery bucket.
pub struct AnonymousStore {
    client: Client,
}

impl AnonymousStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(region: &str) -> Self {
        let region = Region::new(region.to_string());
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .no_credentials()
            .region(region)
            .load()
            .await;
        Self {
            client: Client::new(&config),
        }
    }
}

impl StoreOps for AnonymousStore {
    async fn get_object(
        self: &Self,
        bucket: &str,
        key: &str,
    ) -> Result<GetObjectOutput, StoreError> {
        self.client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::Request(format!("{}", DisplayErrorContext(&e))))
    }

    async fn get_object_range(
        self: &Self,
        bucket: &str,
        key: &str,
        start_byte: u64,
        end_byte: u64,
    ) -> Result<GetObjectOutput, StoreError> {
        let range = format!("bytes={}-{}", start_byte, end_byte);
        self.client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(range)
            .send()
            .await
            .map_err(|e| StoreError::Request(format!("{}", DisplayErrorContext(&e))))
    }

    async fn list_objects_page(
        self: &Self,
        bucket: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListObjectsV2Output, StoreError> {
        self.client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| StoreError::Request(format!("{}", DisplayErrorContext(&e))))
    }
}
