//! S3-based state storage backend.
//!
//! Keys: `{prefix}{stack}/state.json` and `{prefix}{stack}/state.lock`.
//! The lock object is written with `If-None-Match: *`, so only one writer can
//! create it.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::StackState;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// HTTP status S3 answers when a conditional write loses.
const PRECONDITION_FAILED: u16 = 412;

/// S3-based state store for one stack.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, ending with the stack name and a slash.
    prefix: String,
}

/// Outcome of a conditional put.
enum PutOutcome {
    Written,
    AlreadyExists,
}

impl S3StateStore {
    /// Creates a store using credentials from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>, stack: &str) -> Result<Self> {
        let config = if let Some(region) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix, stack))
    }

    /// Creates a store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>, stack: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: stack_prefix(prefix, stack),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::s3(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| StateError::Corrupted {
                    message: format!("Invalid UTF-8 in S3 object: {e}"),
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    async fn put_object(&self, key: &str, content: &str, only_if_absent: bool) -> Result<PutOutcome> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json");
        if only_if_absent {
            request = request.if_none_match("*");
        }

        match request.send().await {
            Ok(_) => Ok(PutOutcome::Written),
            Err(e)
                if e.raw_response()
                    .is_some_and(|r| r.status().as_u16() == PRECONDITION_FAILED) =>
            {
                Ok(PutOutcome::AlreadyExists)
            }
            Err(e) => Err(StateError::s3(format!("S3 put error: {e}")).into()),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::s3(format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }

    fn parse_lock(content: &str) -> Result<LockInfo> {
        serde_json::from_str(content).map_err(|e| {
            StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            }
            .into()
        })
    }
}

/// Normalizes the key prefix and appends the stack name.
fn stack_prefix(prefix: Option<&str>, stack: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(p) => format!("{p}/{stack}/"),
        None => format!("{stack}/"),
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<StackState>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };

        let state: StackState = serde_json::from_str(&json).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse state: {e}"),
        })?;

        info!(
            "Loaded state for stack {} ({} resources)",
            state.stack,
            state.resources.len()
        );
        Ok(Some(state))
    }

    async fn save(&self, state: &StackState) -> Result<()> {
        let key = self.key(STATE_KEY);
        info!("Saving state to s3://{}/{key}", self.bucket);

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        self.put_object(&key, &content, false).await?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn exists(&self) -> Result<bool> {
        self.object_exists(&self.key(STATE_KEY)).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id);
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        if let PutOutcome::AlreadyExists = self.put_object(&key, &content, true).await? {
            if let Some(existing) = self.get_lock_info().await?
                && !existing.is_expired()
            {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }

            warn!("Expired lock found, taking over");
            self.delete_object(&key).await?;
            if let PutOutcome::AlreadyExists = self.put_object(&key, &content, true).await? {
                return Err(StateError::LockFailed {
                    message: String::from("Another process took the lock concurrently"),
                }
                .into());
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let key = self.key(LOCK_KEY);

        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&key).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }

        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        match self.get_object(&self.key(LOCK_KEY)).await? {
            Some(content) => Self::parse_lock(&content).map(Some),
            None => Ok(None),
        }
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock_info| !lock_info.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
