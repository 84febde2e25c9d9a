//! Enumerates the object-store entries a product's prefix resolves to.

use tracing::{debug, warn};

use crate::error::FetchError;
use crate::retry::RetryPolicy;
use crate::store::{StorageObjectRef, StoreError, StoreOps};

/// List every object under `prefix`, following continuation tokens until
/// the listing is exhausted. Zero listed objects is `NotFound`, which is
/// fatal for the job; a transient listing failure is retried first.
pub async fn list_prefix<S: StoreOps>(
    store: &S,
    bucket: &str,
    prefix: &str,
    retry: &RetryPolicy,
) -> Result<Vec<StorageObjectRef>, FetchError> {
    let mut objects: Vec<StorageObjectRef> = vec![];
    let mut continuation: Option<String> = None;

    loop {
        let page = list_page_with_retry(store, bucket, prefix, continuation.clone(), retry).await?;

        for entry in page.contents() {
            let Some(key) = entry.key() else { continue };
            // Directory markers carry no file payload.
            if key.ends_with('/') {
                continue;
            }
            objects.push(StorageObjectRef {
                bucket: bucket.to_string(),
                key: key.to_string(),
                size: entry.size().unwrap_or(0).max(0) as u64,
                etag: entry.e_tag().map(str::to_string),
            });
        }

        match page.next_continuation_token() {
            Some(token) => continuation = Some(token.to_string()),
            None => break,
        }
    }

    if objects.is_empty() {
        return Err(FetchError::NotFound {
            prefix: prefix.to_string(),
        });
    }

    debug!(prefix, count = objects.len(), "listing complete");
    Ok(objects)
}

async fn list_page_with_retry<S: StoreOps>(
    store: &S,
    bucket: &str,
    prefix: &str,
    continuation: Option<String>,
    retry: &RetryPolicy,
) -> Result<aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Output, FetchError> {
    let mut delay = retry.initial_delay;
    let mut last_error: Option<StoreError> = None;

    for attempt in 1..=retry.max_attempts {
        match store
            .list_objects_page(bucket, prefix, continuation.clone())
            .await
        {
            Ok(page) => return Ok(page),
            Err(e) => {
                if attempt < retry.max_attempts {
                    warn!(prefix, attempt, error = %e, "listing request failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = retry.next_delay(delay);
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .map(FetchError::from)
        .unwrap_or_else(|| FetchError::Network("listing failed".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MockStore;

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn lists_all_objects_under_prefix() {
        let store = MockStore::new(vec![
            ("tiles/31/U/DA/2025/3/B02.jp2".to_string(), vec![1, 2, 3]),
            ("tiles/31/U/DA/2025/3/B03.jp2".to_string(), vec![4, 5]),
            ("tiles/30/U/XC/2025/3/B02.jp2".to_string(), vec![9]),
        ]);
        let objects = list_prefix(&store, "bucket", "tiles/31/U/DA/2025/3", &retry())
            .await
            .unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].key, "tiles/31/U/DA/2025/3/B02.jp2");
        assert_eq!(objects[0].size, 3);
        assert!(objects[0].etag.is_some());
    }

    #[tokio::test]
    async fn follows_continuation_tokens() {
        let objects: Vec<(String, Vec<u8>)> = (0..7)
            .map(|i| (format!("tiles/31/U/DA/2025/3/B{i:02}.jp2"), vec![i as u8]))
            .collect();
        let store = MockStore::new(objects).with_page_size(3);
        let listed = list_prefix(&store, "bucket", "tiles/31/U/DA/2025/3", &retry())
            .await
            .unwrap();
        assert_eq!(listed.len(), 7);
        assert_eq!(store.list_page_count(), 3);
    }

    #[tokio::test]
    async fn empty_prefix_is_not_found() {
        let store = MockStore::new(vec![]);
        let err = list_prefix(&store, "bucket", "tiles/31/U/DA/2025/3", &retry())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotFound { prefix } if prefix == "tiles/31/U/DA/2025/3"));
    }

    #[tokio::test]
    async fn skips_directory_markers() {
        let store = MockStore::new(vec![
            ("tiles/31/U/DA/2025/3/".to_string(), vec![]),
            ("tiles/31/U/DA/2025/3/B02.jp2".to_string(), vec![1]),
        ]);
        let objects = list_prefix(&store, "bucket", "tiles/31/U/DA/2025/3", &retry())
            .await
            .unwrap();
        assert_eq!(objects.len(), 1);
    }
}
