/*!
Amazon S3 raw store.

Blobs live at `<prefix>/<kind-dir>/<id>` and the manifest at
`<prefix>/manifest.json`. The adapter owns a Tokio runtime and blocks on the
AWS SDK futures, since the persistence worker and rebind threads are plain OS
threads. Retries run inside that runtime through `rebind_retry::with_backoff`.

# Authentication
The standard AWS credential provider chain is used: environment variables,
the shared credentials file, then instance or task roles.
*/

use std::sync::Arc;

use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use rebind_retry::{object_store_backoff_policy, with_backoff, BoxFuture, RetryError, RetryResult};
use tokio::runtime::Runtime;
use tracing::{debug, info};

use super::{from_retry, validate_id, RawStore};
use crate::memento::ObjectKind;
use crate::{PersistError, Result};

const MANIFEST_KEY: &str = "manifest.json";

/// Raw store backed by an S3 bucket
#[derive(Debug)]
pub struct S3Store {
    client: S3Client,
    bucket: String,
    prefix: Option<String>,
    runtime: Arc<Runtime>,
}

impl S3Store {
    /// Connect to `bucket`, loading credentials and region from the environment
    /// unless `region` is given.
    pub fn new(bucket: String, prefix: Option<String>, region: Option<String>) -> Result<Self> {
        let runtime = Runtime::new().map_err(|e| {
            PersistError::storage(format!("Failed to create async runtime for S3 client: {e}"))
        })?;

        let sdk_config = runtime.block_on(async {
            let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
            if let Some(region) = region {
                loader = loader.region(aws_config::Region::new(region));
            }
            loader.load().await
        });

        if sdk_config.credentials_provider().is_none() {
            return Err(PersistError::storage(
                "AWS credentials not found. Please set AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, and AWS_REGION environment variables",
            ));
        }

        info!(bucket = %bucket, prefix = ?prefix, "initialized S3 memento store");

        Ok(S3Store {
            client: S3Client::new(&sdk_config),
            bucket,
            prefix: prefix.map(|p| p.trim_matches('/').to_string()).filter(|p| !p.is_empty()),
            runtime: Arc::new(runtime),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn key(&self, tail: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{tail}"),
            None => tail.to_string(),
        }
    }

    fn kind_prefix(&self, kind: ObjectKind) -> String {
        self.key(&format!("{}/", kind.dir_name()))
    }

    fn blob_key(&self, kind: ObjectKind, id: &str) -> Result<String> {
        validate_id(id)?;
        Ok(self.key(&format!("{}/{id}", kind.dir_name())))
    }

    /// Run `attempt` on the store's runtime with the object-store backoff policy
    fn retry<'a, T, F>(&self, op: &'static str, attempt: F) -> Result<T>
    where
        F: FnMut(usize) -> BoxFuture<'a, T>,
    {
        self.runtime
            .block_on(with_backoff(op, object_store_backoff_policy(), attempt))
            .map_err(from_retry)
    }

    fn put(&self, op: &'static str, key: &str, data: &[u8]) -> Result<()> {
        let body = Bytes::copy_from_slice(data);
        self.retry(op, |attempt| {
            debug!(bucket = %self.bucket, key, attempt, "put_object");
            let request = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(body.clone()));
            Box::pin(async move {
                request
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_sdk_error(op, e, key))
            })
        })
    }

    /// `Ok(None)` when the key does not exist
    fn get(&self, op: &'static str, key: &str) -> Result<Option<Bytes>> {
        self.retry(op, |_| Box::pin(self.get_once(op, key)))
    }

    async fn get_once(&self, op: &'static str, key: &str) -> RetryResult<Option<Bytes>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match output {
            Ok(output) => output
                .body
                .collect()
                .await
                .map(|data| Some(data.into_bytes()))
                .map_err(|e| {
                    rebind_retry::transient_error!(
                        op,
                        PersistError::storage(format!("Failed to read S3 object stream: {e}"))
                    )
                }),
            Err(SdkError::ServiceError(service_err)) if service_err.err().is_no_such_key() => {
                Ok(None)
            }
            Err(e) => Err(classify_sdk_error(op, e, key)),
        }
    }
}

impl RawStore for S3Store {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix.as_deref().unwrap_or(""))
    }

    fn list_ids(&self, kind: ObjectKind) -> Result<Vec<String>> {
        let prefix = self.kind_prefix(kind);
        let mut ids = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self.retry("list_objects", |_| {
                let request = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&prefix)
                    .set_continuation_token(continuation.clone());
                let prefix = &prefix;
                Box::pin(async move {
                    request
                        .send()
                        .await
                        .map_err(|e| classify_sdk_error("list_objects", e, prefix))
                })
            })?;

            for object in page.contents() {
                if let Some(id) = object.key().and_then(|k| k.strip_prefix(&prefix)) {
                    if !id.is_empty() && !id.contains('/') {
                        ids.push(id.to_string());
                    }
                }
            }

            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(next.to_string());
                }
                _ => break,
            }
        }

        ids.sort();
        Ok(ids)
    }

    fn read(&self, kind: ObjectKind, id: &str) -> Result<Bytes> {
        let key = self.blob_key(kind, id)?;
        self.get("get_object", &key)?
            .ok_or_else(|| PersistError::storage(format!("S3 object '{key}' not found")))
    }

    fn write(&self, kind: ObjectKind, id: &str, data: &[u8]) -> Result<()> {
        let key = self.blob_key(kind, id)?;
        self.put("put_object", &key, data)
    }

    fn delete(&self, kind: ObjectKind, id: &str) -> Result<()> {
        let key = self.blob_key(kind, id)?;
        self.retry("delete_object", |_| {
            let request = self.client.delete_object().bucket(&self.bucket).key(&key);
            let key = &key;
            Box::pin(async move {
                request
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_sdk_error("delete_object", e, key))
            })
        })
    }

    fn read_manifest(&self) -> Result<Option<Vec<u8>>> {
        Ok(self
            .get("get_manifest", &self.key(MANIFEST_KEY))?
            .map(|data| data.to_vec()))
    }

    fn write_manifest(&self, data: &[u8]) -> Result<()> {
        self.put("put_manifest", &self.key(MANIFEST_KEY), data)
    }
}

/// Map an AWS SDK error to a retry classification with a readable cause
fn classify_sdk_error<E>(op: &'static str, error: SdkError<E>, key: &str) -> RetryError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    let (transient, message) = match &error {
        SdkError::DispatchFailure(dispatch_err) => (
            true,
            format!("S3 {op} request failed to dispatch: {dispatch_err:?}"),
        ),
        SdkError::TimeoutError(_) => (true, format!("S3 {op} request timed out (key: {key})")),
        SdkError::ResponseError(response_err) => {
            (true, format!("S3 {op} response error: {response_err:?}"))
        }
        SdkError::ServiceError(service_err) => match service_err.err().code() {
            Some("InternalError" | "SlowDown" | "ServiceUnavailable" | "RequestTimeout") => (
                true,
                format!(
                    "S3 {op} transient service error: {}",
                    service_err.err().message().unwrap_or("unknown")
                ),
            ),
            Some("NoSuchBucket") => (false, "S3 bucket not found".to_string()),
            Some("NoSuchKey") => (false, format!("S3 object '{key}' not found")),
            Some("AccessDenied" | "Forbidden") => (
                false,
                "Access denied to S3 (check credentials and permissions)".to_string(),
            ),
            Some(code) => (
                false,
                format!(
                    "S3 service error ({code}): {}",
                    service_err.err().message().unwrap_or("Unknown error")
                ),
            ),
            None => (false, format!("S3 {op} service error: {service_err:?}")),
        },
        _ => (false, format!("S3 {op} error: {error:?}")),
    };

    let cause = PersistError::storage(message);
    if transient {
        rebind_retry::transient_error!(op, cause)
    } else {
        rebind_retry::permanent_error!(op, cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::get_object::GetObjectError;

    #[test]
    fn test_timeout_is_transient() {
        let timeout: SdkError<GetObjectError> = SdkError::timeout_error("deadline exceeded");
        let classified = classify_sdk_error("get_object", timeout, "state/entities/e1");

        assert!(classified.is_transient());
        assert!(classified.to_string().contains("state/entities/e1"));
    }

    #[test]
    fn test_construction_failure_is_permanent() {
        let failure: SdkError<GetObjectError> = SdkError::construction_failure("bad request");
        let classified = classify_sdk_error("get_object", failure, "k");
        assert!(!classified.is_transient());
    }
}
