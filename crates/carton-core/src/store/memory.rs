use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{
    validate_container_name, AccessPolicy, BlobStorage, CreateContainerOptions, Result,
    StorageError, UrlOptions, WriteBlobOptions, DEFAULT_CONTENT_TYPE,
};
use crate::path::BlobPath;

const MEMORY_URL_BASE: &str = "memory://storage";

#[derive(Clone, Debug)]
struct BlobRecord {
    content: Vec<u8>,
    content_type: String,
}

#[derive(Debug)]
struct ContainerRecord {
    access_policy: AccessPolicy,
    blobs: HashMap<String, BlobRecord>,
}

/// In-memory reference backend. Deterministic and process-local, with the
/// same observable behavior as the cloud backend for every operation.
#[derive(Default)]
pub struct MemoryStorage {
    containers: DashMap<String, ContainerRecord>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_container<T>(
        &self,
        name: &str,
        f: impl FnOnce(&ContainerRecord) -> Result<T>,
    ) -> Result<T> {
        validate_container_name(name)?;
        let container = self.containers.get(name).ok_or_else(|| {
            StorageError::ContainerNotFound(format!("no container named {name:?}"))
        })?;
        f(&container)
    }

    fn with_container_mut<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut ContainerRecord) -> Result<T>,
    ) -> Result<T> {
        validate_container_name(name)?;
        let mut container = self.containers.get_mut(name).ok_or_else(|| {
            StorageError::ContainerNotFound(format!("no container named {name:?}"))
        })?;
        f(&mut container)
    }

    fn with_blob<T>(&self, path: &BlobPath, f: impl FnOnce(&BlobRecord) -> T) -> Result<T> {
        self.with_container(path.container_name(), |container| {
            let blob = container
                .blobs
                .get(path.blob_name())
                .ok_or_else(|| StorageError::BlobNotFound(format!("no blob at {path}")))?;
            Ok(f(blob))
        })
    }

    fn write_blob(&self, path: &BlobPath, content: Vec<u8>, opts: WriteBlobOptions) -> Result<()> {
        self.with_container_mut(path.container_name(), |container| {
            let content_type = opts
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
            container.blobs.insert(
                path.blob_name().to_string(),
                BlobRecord {
                    content,
                    content_type,
                },
            );
            Ok(())
        })
    }
}

#[async_trait]
impl BlobStorage for MemoryStorage {
    // There are no credentials behind the memory scheme, so the access-token
    // option has no effect on these URLs.
    fn storage_url(&self, _opts: &UrlOptions) -> String {
        format!("{MEMORY_URL_BASE}/")
    }

    fn container_url(&self, name: &str, _opts: &UrlOptions) -> Result<String> {
        validate_container_name(name)?;
        Ok(format!("{MEMORY_URL_BASE}/{name}/"))
    }

    fn blob_url(&self, path: &BlobPath, _opts: &UrlOptions) -> Result<String> {
        validate_container_name(path.container_name())?;
        Ok(format!("{MEMORY_URL_BASE}/{path}"))
    }

    async fn create_container(&self, name: &str, opts: CreateContainerOptions) -> Result<bool> {
        validate_container_name(name)?;
        // The entry API holds the shard lock across the check and the insert,
        // so two concurrent creators of the same absent name cannot both
        // observe `true`.
        match self.containers.entry(name.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(ContainerRecord {
                    access_policy: opts.access_policy,
                    blobs: HashMap::new(),
                });
                Ok(true)
            }
        }
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        validate_container_name(name)?;
        Ok(self.containers.contains_key(name))
    }

    async fn container_access_policy(&self, name: &str) -> Result<AccessPolicy> {
        self.with_container(name, |container| Ok(container.access_policy))
    }

    async fn set_container_access_policy(&self, name: &str, policy: AccessPolicy) -> Result<()> {
        self.with_container_mut(name, |container| {
            container.access_policy = policy;
            Ok(())
        })
    }

    async fn delete_container(&self, name: &str) -> Result<bool> {
        validate_container_name(name)?;
        Ok(self.containers.remove(name).is_some())
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .containers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create_blob(&self, path: &BlobPath, opts: WriteBlobOptions) -> Result<bool> {
        self.with_container_mut(path.container_name(), |container| {
            if container.blobs.contains_key(path.blob_name()) {
                return Ok(false);
            }
            container.blobs.insert(
                path.blob_name().to_string(),
                BlobRecord {
                    content: Vec::new(),
                    content_type: opts
                        .content_type
                        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
                },
            );
            Ok(true)
        })
    }

    async fn blob_exists(&self, path: &BlobPath) -> Result<bool> {
        validate_container_name(path.container_name())?;
        let Some(container) = self.containers.get(path.container_name()) else {
            return Ok(false);
        };
        Ok(container.blobs.contains_key(path.blob_name()))
    }

    async fn blob_contents_string(&self, path: &BlobPath) -> Result<String> {
        self.with_blob(path, |blob| {
            String::from_utf8_lossy(&blob.content).into_owned()
        })
    }

    async fn set_blob_contents_string(
        &self,
        path: &BlobPath,
        contents: &str,
        opts: WriteBlobOptions,
    ) -> Result<()> {
        self.write_blob(path, contents.as_bytes().to_vec(), opts)
    }

    async fn set_blob_contents_file(
        &self,
        path: &BlobPath,
        file: &Path,
        opts: WriteBlobOptions,
    ) -> Result<()> {
        let content = tokio::fs::read(file).await?;
        self.write_blob(path, content, opts)
    }

    async fn blob_content_type(&self, path: &BlobPath) -> Result<Option<String>> {
        self.with_blob(path, |blob| Some(blob.content_type.clone()))
    }

    async fn set_blob_content_type(&self, path: &BlobPath, content_type: &str) -> Result<()> {
        self.with_container_mut(path.container_name(), |container| {
            let blob = container
                .blobs
                .get_mut(path.blob_name())
                .ok_or_else(|| StorageError::BlobNotFound(format!("no blob at {path}")))?;
            blob.content_type = content_type.to_string();
            Ok(())
        })
    }

    async fn delete_blob(&self, path: &BlobPath) -> Result<bool> {
        validate_container_name(path.container_name())?;
        let Some(mut container) = self.containers.get_mut(path.container_name()) else {
            return Ok(false);
        };
        Ok(container.blobs.remove(path.blob_name()).is_some())
    }
}
