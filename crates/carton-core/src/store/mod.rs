pub mod memory;
pub mod s3;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::path::BlobPath;

/// Content type assigned to blobs created without an explicit one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// The closed error taxonomy shared by every backend. Display strings lead
/// with the kind name so failures classify by variant or by prefix.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("InvalidResourceName: {0}")]
    InvalidResourceName(String),
    #[error("ContainerNotFound: {0}")]
    ContainerNotFound(String),
    #[error("BlobNotFound: {0}")]
    BlobNotFound(String),
    #[error("ContainerAlreadyExists: {0}")]
    ContainerAlreadyExists(String),
    #[error("BlobAlreadyExists: {0}")]
    BlobAlreadyExists(String),
    #[error("BucketDoesNotExist: {0}")]
    BucketDoesNotExist(String),
    #[error("NotAuthorized: {0}")]
    NotAuthorized(String),
    #[error("ConnectionError: {0}")]
    ConnectionError(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("Io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Anonymous-read exposure level of a container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessPolicy {
    #[default]
    Private,
    BlobPublic,
    ContainerPublic,
}

impl fmt::Display for AccessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            AccessPolicy::Private => "private",
            AccessPolicy::BlobPublic => "blob-public",
            AccessPolicy::ContainerPublic => "container-public",
        };
        f.write_str(value)
    }
}

impl FromStr for AccessPolicy {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, String> {
        match value {
            "private" => Ok(AccessPolicy::Private),
            "blob-public" => Ok(AccessPolicy::BlobPublic),
            "container-public" => Ok(AccessPolicy::ContainerPublic),
            other => Err(format!("unknown access policy {other:?}")),
        }
    }
}

/// Options for [`BlobStorage::create_container`].
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateContainerOptions {
    pub access_policy: AccessPolicy,
}

/// Options for the blob write operations.
#[derive(Clone, Debug, Default)]
pub struct WriteBlobOptions {
    /// Content type recorded on the blob; [`DEFAULT_CONTENT_TYPE`] when not
    /// set.
    pub content_type: Option<String>,
}

/// Options for URL resolution.
#[derive(Clone, Copy, Debug, Default)]
pub struct UrlOptions {
    /// Include a signed access token in the URL query string.
    pub include_access_token: bool,
}

/// Container names must be non-empty, lowercase, and free of separators.
/// Checked before any backend lookup.
pub(crate) fn validate_container_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StorageError::InvalidResourceName(
            "container name is empty".to_string(),
        ));
    }
    if name.contains('/') {
        return Err(StorageError::InvalidResourceName(format!(
            "container name {name:?} contains a separator"
        )));
    }
    if name.chars().any(|c| c.is_uppercase()) {
        return Err(StorageError::InvalidResourceName(format!(
            "container name {name:?} is not lowercase"
        )));
    }
    Ok(())
}

/// The contract every storage backend implements.
///
/// Operations that touch state are asynchronous. URL resolution is pure
/// computation over configuration state and performs no I/O.
///
/// Existence checks, creates, and deletes never fail merely because the
/// target is absent or already present; that outcome is the boolean result.
/// Content and metadata access on a missing target fails with the specific
/// [`StorageError::ContainerNotFound`] / [`StorageError::BlobNotFound`] kind.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// URL of the storage root.
    fn storage_url(&self, opts: &UrlOptions) -> String;

    /// URL of a container.
    fn container_url(&self, name: &str, opts: &UrlOptions) -> Result<String>;

    /// URL of a blob.
    fn blob_url(&self, path: &BlobPath, opts: &UrlOptions) -> Result<String>;

    /// Create a container. Returns `true` if newly created, `false` if it
    /// already existed.
    async fn create_container(&self, name: &str, opts: CreateContainerOptions) -> Result<bool>;

    async fn container_exists(&self, name: &str) -> Result<bool>;

    async fn container_access_policy(&self, name: &str) -> Result<AccessPolicy>;

    async fn set_container_access_policy(&self, name: &str, policy: AccessPolicy) -> Result<()>;

    /// Delete a container and every blob in it. Returns `false` if it did
    /// not exist.
    async fn delete_container(&self, name: &str) -> Result<bool>;

    /// Complete, sorted list of container names. Backends with paginated
    /// listings follow continuation markers until exhausted.
    async fn list_containers(&self) -> Result<Vec<String>>;

    /// Create a blob with empty content if it does not already exist.
    /// Returns `true` if newly created; never overwrites existing content.
    async fn create_blob(&self, path: &BlobPath, opts: WriteBlobOptions) -> Result<bool>;

    async fn blob_exists(&self, path: &BlobPath) -> Result<bool>;

    /// Blob content decoded as UTF-8.
    async fn blob_contents_string(&self, path: &BlobPath) -> Result<String>;

    /// Create or overwrite a blob from a string, replacing its content type.
    async fn set_blob_contents_string(
        &self,
        path: &BlobPath,
        contents: &str,
        opts: WriteBlobOptions,
    ) -> Result<()>;

    /// Create or overwrite a blob from a local file, replacing its content
    /// type. The content length is determined before transfer.
    async fn set_blob_contents_file(
        &self,
        path: &BlobPath,
        file: &Path,
        opts: WriteBlobOptions,
    ) -> Result<()>;

    async fn blob_content_type(&self, path: &BlobPath) -> Result<Option<String>>;

    /// Replace a blob's content type without altering its content.
    async fn set_blob_content_type(&self, path: &BlobPath, content_type: &str) -> Result<()>;

    /// Delete a blob. Returns `false` if it did not exist.
    async fn delete_blob(&self, path: &BlobPath) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_leads_with_kind() {
        let err = StorageError::ContainerNotFound("no container named \"logs\"".to_string());
        assert!(err.to_string().starts_with("ContainerNotFound: "));

        let err = StorageError::InvalidResourceName("container name is empty".to_string());
        assert!(err.to_string().starts_with("InvalidResourceName: "));
    }

    #[test]
    fn access_policy_round_trips_through_display() {
        for policy in [
            AccessPolicy::Private,
            AccessPolicy::BlobPublic,
            AccessPolicy::ContainerPublic,
        ] {
            let rendered = policy.to_string();
            assert_eq!(rendered.parse::<AccessPolicy>().unwrap(), policy);
        }
    }

    #[test]
    fn access_policy_serde_is_kebab_case() {
        let rendered = serde_json::to_string(&AccessPolicy::ContainerPublic).unwrap();
        assert_eq!(rendered, "\"container-public\"");
        let parsed: AccessPolicy = serde_json::from_str("\"blob-public\"").unwrap();
        assert_eq!(parsed, AccessPolicy::BlobPublic);
    }

    #[test]
    fn container_name_validation() {
        assert!(validate_container_name("logs").is_ok());
        assert!(validate_container_name("logs-2024").is_ok());

        for bad in ["", "Logs", "logs/2024", "LOGS"] {
            let err = validate_container_name(bad).unwrap_err();
            assert!(
                matches!(err, StorageError::InvalidResourceName(_)),
                "expected InvalidResourceName for {bad:?}, got {err}"
            );
        }
    }
}
