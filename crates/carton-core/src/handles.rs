//! Navigation handles: immutable bindings of a path to a backend.
//!
//! Each handle holds an `Arc<dyn BlobStorage>` plus the pre-bound name or
//! path and forwards every operation to the contract. Handles own no other
//! state and are freely cloneable.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::path::BlobPath;
use crate::store::{
    AccessPolicy, BlobStorage, CreateContainerOptions, Result, UrlOptions, WriteBlobOptions,
};

/// A container with its name pre-bound: the contract's container-scoped
/// operations plus every blob-scoped operation addressed by blob name.
#[derive(Clone)]
pub struct ContainerHandle {
    storage: Arc<dyn BlobStorage>,
    name: String,
}

impl ContainerHandle {
    pub fn new(storage: Arc<dyn BlobStorage>, name: impl Into<String>) -> Self {
        Self {
            storage,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn blob_path(&self, name: &str) -> BlobPath {
        BlobPath::new(self.name.clone(), name)
    }

    pub fn blob(&self, name: impl Into<String>) -> BlobHandle {
        BlobHandle::new(
            self.storage.clone(),
            BlobPath::new(self.name.clone(), name),
        )
    }

    pub fn prefix(&self, segment: impl Into<String>) -> PrefixHandle {
        PrefixHandle::new(self.storage.clone(), self.name.clone(), segment)
    }

    pub fn url(&self, opts: &UrlOptions) -> Result<String> {
        self.storage.container_url(&self.name, opts)
    }

    pub async fn create(&self, opts: CreateContainerOptions) -> Result<bool> {
        self.storage.create_container(&self.name, opts).await
    }

    pub async fn exists(&self) -> Result<bool> {
        self.storage.container_exists(&self.name).await
    }

    pub async fn access_policy(&self) -> Result<AccessPolicy> {
        self.storage.container_access_policy(&self.name).await
    }

    pub async fn set_access_policy(&self, policy: AccessPolicy) -> Result<()> {
        self.storage
            .set_container_access_policy(&self.name, policy)
            .await
    }

    pub async fn delete(&self) -> Result<bool> {
        self.storage.delete_container(&self.name).await
    }

    pub async fn create_blob(&self, name: &str, opts: WriteBlobOptions) -> Result<bool> {
        self.storage.create_blob(&self.blob_path(name), opts).await
    }

    pub async fn blob_exists(&self, name: &str) -> Result<bool> {
        self.storage.blob_exists(&self.blob_path(name)).await
    }

    pub async fn blob_contents_string(&self, name: &str) -> Result<String> {
        self.storage
            .blob_contents_string(&self.blob_path(name))
            .await
    }

    pub async fn set_blob_contents_string(
        &self,
        name: &str,
        contents: &str,
        opts: WriteBlobOptions,
    ) -> Result<()> {
        self.storage
            .set_blob_contents_string(&self.blob_path(name), contents, opts)
            .await
    }

    pub async fn set_blob_contents_file(
        &self,
        name: &str,
        file: &Path,
        opts: WriteBlobOptions,
    ) -> Result<()> {
        self.storage
            .set_blob_contents_file(&self.blob_path(name), file, opts)
            .await
    }

    pub async fn blob_content_type(&self, name: &str) -> Result<Option<String>> {
        self.storage.blob_content_type(&self.blob_path(name)).await
    }

    pub async fn set_blob_content_type(&self, name: &str, content_type: &str) -> Result<()> {
        self.storage
            .set_blob_content_type(&self.blob_path(name), content_type)
            .await
    }

    pub async fn delete_blob(&self, name: &str) -> Result<bool> {
        self.storage.delete_blob(&self.blob_path(name)).await
    }

    pub fn blob_url(&self, name: &str, opts: &UrlOptions) -> Result<String> {
        self.storage.blob_url(&self.blob_path(name), opts)
    }
}

/// A view over a container plus a leading path segment. Child paths are
/// computed by concatenation; no separator is inserted automatically.
#[derive(Clone)]
pub struct PrefixHandle {
    storage: Arc<dyn BlobStorage>,
    container: String,
    prefix: String,
}

impl PrefixHandle {
    pub fn new(
        storage: Arc<dyn BlobStorage>,
        container: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            container: container.into(),
            prefix: prefix.into(),
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn container(&self) -> ContainerHandle {
        ContainerHandle::new(self.storage.clone(), self.container.clone())
    }

    pub fn blob(&self, suffix: &str) -> BlobHandle {
        BlobHandle::new(
            self.storage.clone(),
            BlobPath::new(self.container.clone(), format!("{}{}", self.prefix, suffix)),
        )
    }

    pub fn child(&self, suffix: &str) -> PrefixHandle {
        PrefixHandle::new(
            self.storage.clone(),
            self.container.clone(),
            format!("{}{}", self.prefix, suffix),
        )
    }
}

/// A blob with its full path pre-bound.
#[derive(Clone)]
pub struct BlobHandle {
    storage: Arc<dyn BlobStorage>,
    path: BlobPath,
}

impl BlobHandle {
    pub fn new(storage: Arc<dyn BlobStorage>, path: BlobPath) -> Self {
        Self { storage, path }
    }

    pub fn path(&self) -> &BlobPath {
        &self.path
    }

    pub fn url(&self, opts: &UrlOptions) -> Result<String> {
        self.storage.blob_url(&self.path, opts)
    }

    pub async fn create(&self, opts: WriteBlobOptions) -> Result<bool> {
        self.storage.create_blob(&self.path, opts).await
    }

    pub async fn exists(&self) -> Result<bool> {
        self.storage.blob_exists(&self.path).await
    }

    pub async fn contents_string(&self) -> Result<String> {
        self.storage.blob_contents_string(&self.path).await
    }

    pub async fn set_contents_string(&self, contents: &str, opts: WriteBlobOptions) -> Result<()> {
        self.storage
            .set_blob_contents_string(&self.path, contents, opts)
            .await
    }

    pub async fn set_contents_file(&self, file: &Path, opts: WriteBlobOptions) -> Result<()> {
        self.storage
            .set_blob_contents_file(&self.path, file, opts)
            .await
    }

    pub async fn content_type(&self) -> Result<Option<String>> {
        self.storage.blob_content_type(&self.path).await
    }

    pub async fn set_content_type(&self, content_type: &str) -> Result<()> {
        self.storage
            .set_blob_content_type(&self.path, content_type)
            .await
    }

    pub async fn delete(&self) -> Result<bool> {
        self.storage.delete_blob(&self.path).await
    }
}

/// Handle construction on any shared backend.
#[async_trait]
pub trait BlobStorageExt {
    fn container(&self, name: impl Into<String>) -> ContainerHandle;
    fn blob(&self, path: BlobPath) -> BlobHandle;
    /// Every container, as a handle bound to this backend.
    async fn containers(&self) -> Result<Vec<ContainerHandle>>;
}

#[async_trait]
impl BlobStorageExt for Arc<dyn BlobStorage> {
    fn container(&self, name: impl Into<String>) -> ContainerHandle {
        ContainerHandle::new(self.clone(), name)
    }

    fn blob(&self, path: BlobPath) -> BlobHandle {
        BlobHandle::new(self.clone(), path)
    }

    async fn containers(&self) -> Result<Vec<ContainerHandle>> {
        let names = self.list_containers().await?;
        Ok(names
            .into_iter()
            .map(|name| ContainerHandle::new(self.clone(), name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStorage;

    fn storage() -> Arc<dyn BlobStorage> {
        Arc::new(MemoryStorage::new())
    }

    #[tokio::test]
    async fn container_handle_pre_binds_the_container() {
        let storage = storage();
        let container = storage.container("docs");
        assert!(container.create(CreateContainerOptions::default()).await.unwrap());

        container
            .set_blob_contents_string("readme.md", "# hi", WriteBlobOptions::default())
            .await
            .unwrap();
        assert!(container.blob_exists("readme.md").await.unwrap());
        assert_eq!(
            container.blob_contents_string("readme.md").await.unwrap(),
            "# hi"
        );

        // The handle and the raw contract address the same state.
        let path = BlobPath::parse("docs/readme.md").unwrap();
        assert_eq!(storage.blob_contents_string(&path).await.unwrap(), "# hi");
    }

    #[tokio::test]
    async fn blob_handle_pre_binds_the_full_path() {
        let storage = storage();
        storage
            .container("docs")
            .create(CreateContainerOptions::default())
            .await
            .unwrap();

        let blob = storage.blob(BlobPath::parse("docs/a/b.txt").unwrap());
        assert!(!blob.exists().await.unwrap());
        blob.set_contents_string("nested", WriteBlobOptions::default())
            .await
            .unwrap();
        assert_eq!(blob.contents_string().await.unwrap(), "nested");
        assert!(blob.delete().await.unwrap());
        assert!(!blob.exists().await.unwrap());
    }

    #[tokio::test]
    async fn prefix_concatenates_without_inserting_a_separator() {
        let storage = storage();
        let container = storage.container("logs");
        container.create(CreateContainerOptions::default()).await.unwrap();

        let with_separator = container.prefix("2024/");
        with_separator
            .blob("app.log")
            .set_contents_string("a", WriteBlobOptions::default())
            .await
            .unwrap();
        assert!(storage
            .blob_exists(&BlobPath::parse("logs/2024/app.log").unwrap())
            .await
            .unwrap());

        let without_separator = container.prefix("2024");
        without_separator
            .blob("app.log")
            .set_contents_string("b", WriteBlobOptions::default())
            .await
            .unwrap();
        assert!(storage
            .blob_exists(&BlobPath::parse("logs/2024app.log").unwrap())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn nested_prefixes_accumulate() {
        let storage = storage();
        let container = storage.container("logs");
        container.create(CreateContainerOptions::default()).await.unwrap();

        let nested = container.prefix("2024/").child("01/");
        assert_eq!(nested.prefix(), "2024/01/");
        nested
            .blob("app.log")
            .set_contents_string("x", WriteBlobOptions::default())
            .await
            .unwrap();
        assert!(storage
            .blob_exists(&BlobPath::parse("logs/2024/01/app.log").unwrap())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn containers_returns_bound_handles() {
        let storage = storage();
        for name in ["beta", "alpha"] {
            storage
                .container(name)
                .create(CreateContainerOptions::default())
                .await
                .unwrap();
        }

        let containers = storage.containers().await.unwrap();
        let names: Vec<&str> = containers.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        for container in &containers {
            assert!(container.exists().await.unwrap());
        }
    }
}
