use std::fmt;
use std::str::FromStr;

use crate::store::{Result, StorageError};

/// Address of a blob: a container name plus the blob's name within it.
///
/// The string form is always `container/name`. Parsing splits at the *first*
/// separator only, so blob names may themselves contain separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobPath {
    container_name: String,
    blob_name: String,
}

impl BlobPath {
    pub fn new(container_name: impl Into<String>, blob_name: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            blob_name: blob_name.into(),
        }
    }

    /// Parse a combined `container/name` string.
    pub fn parse(value: &str) -> Result<Self> {
        value.parse()
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn blob_name(&self) -> &str {
        &self.blob_name
    }
}

impl FromStr for BlobPath {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self> {
        let Some((container_name, blob_name)) = value.split_once('/') else {
            return Err(StorageError::InvalidResourceName(format!(
                "blob path {value:?} has no separator"
            )));
        };
        if blob_name.is_empty() {
            return Err(StorageError::InvalidResourceName(format!(
                "blob path {value:?} has an empty blob name"
            )));
        }
        Ok(Self::new(container_name, blob_name))
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container_name, self.blob_name)
    }
}
