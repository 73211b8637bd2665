use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, IF_NONE_MATCH};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode, Url};
use rusty_s3::actions::ListObjectsV2;
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::{
    validate_container_name, AccessPolicy, BlobStorage, CreateContainerOptions, Result,
    StorageError, UrlOptions, WriteBlobOptions, DEFAULT_CONTENT_TYPE,
};
use crate::path::BlobPath;

const SIGNED_URL_DURATION: Duration = Duration::from_secs(60 * 60);

// Two disjoint keyspaces inside the bucket: marker objects anchoring
// container existence and policy, and the blob data itself.
const CONTAINER_KEYSPACE: &str = "containers";
const BLOB_KEYSPACE: &str = "blobs";

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct S3Config {
    pub key: String,
    pub endpoint: String,
    pub secret: String,
    pub token: Option<String>,
    pub bucket: String,
    pub region: String,
    pub bucket_prefix: Option<String>,
}

/// Body of a container marker object. `private` is represented by absence of
/// the policy value.
#[derive(Serialize, Deserialize, Default)]
struct ContainerMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_policy: Option<AccessPolicy>,
}

impl ContainerMeta {
    fn from_policy(policy: AccessPolicy) -> Self {
        let access_policy = match policy {
            AccessPolicy::Private => None,
            other => Some(other),
        };
        ContainerMeta { access_policy }
    }

    fn policy(&self) -> AccessPolicy {
        self.access_policy.unwrap_or_default()
    }
}

/// Cloud backend over an S3-compatible service. Requests are presigned with
/// `rusty_s3` and sent with `reqwest`; transport errors are normalized into
/// the shared [`StorageError`] taxonomy so callers are backend-agnostic.
pub struct S3Storage {
    bucket: Bucket,
    _bucket_checked: OnceLock<()>,
    client: Client,
    credentials: Credentials,
    prefix: Option<String>,
    cancellation_token: Option<CancellationToken>,
}

impl S3Storage {
    pub fn new(config: S3Config) -> Self {
        let credentials = match config.token {
            Some(token) => Credentials::new_with_token(config.key, config.secret, token),
            None => Credentials::new(config.key, config.secret),
        };
        let endpoint: Url = config.endpoint.parse().expect("endpoint is a valid url");
        let path_style =
            // if endpoint is localhost then bucket url must be of forme http://localhost:<port>/<bucket>
            // instead of <method>:://<bucket>.<endpoint>
            if endpoint.host_str().expect("endpoint Url should have host") == "localhost" {
                UrlStyle::Path
            } else {
                UrlStyle::VirtualHost
            };
        let bucket = Bucket::new(endpoint, path_style, config.bucket, config.region)
            .expect("Url has a valid scheme and host");

        S3Storage {
            bucket,
            _bucket_checked: OnceLock::new(),
            client: Client::new(),
            credentials,
            prefix: config.bucket_prefix,
            cancellation_token: None,
        }
    }

    /// Abort in-flight requests when `token` is cancelled; aborted calls fail
    /// with [`StorageError::Cancelled`].
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    fn sign<'a, A: S3Action<'a>>(&self, action: A) -> Url {
        action.sign_with_time(SIGNED_URL_DURATION, &OffsetDateTime::now_utc())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = if let Some(token) = &self.cancellation_token {
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(StorageError::Cancelled(
                        "request aborted by cancellation token".to_string(),
                    ))
                }
                response = request.send() => response,
            }
        } else {
            request.send().await
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => return Err(StorageError::ConnectionError(e.to_string())),
        };

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(StorageError::BlobNotFound(
                "received NOT_FOUND from S3-compatible API".to_string(),
            )),
            StatusCode::PRECONDITION_FAILED => Err(StorageError::BlobAlreadyExists(
                "received PRECONDITION_FAILED from S3-compatible API".to_string(),
            )),
            StatusCode::FORBIDDEN => Err(StorageError::NotAuthorized(
                "received FORBIDDEN from S3-compatible API".to_string(),
            )),
            StatusCode::UNAUTHORIZED => Err(StorageError::NotAuthorized(
                "received UNAUTHORIZED from S3-compatible API".to_string(),
            )),
            status => Err(StorageError::ConnectionError(format!(
                "received {} from S3-compatible API",
                status
            ))),
        }
    }

    async fn read_response_bytes(response: Response) -> Result<Bytes> {
        match response.bytes().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => Err(StorageError::ConnectionError(e.to_string())),
        }
    }

    pub async fn init(&self) -> Result<()> {
        if self._bucket_checked.get().is_some() {
            return Ok(());
        }

        let action = self.bucket.head_bucket(Some(&self.credentials));
        let url = self.sign(action);
        let result = self.send(self.client.head(url)).await;

        match result {
            // Normally a 404 indicates that we are attempting to fetch an
            // object that does not exist, but no object key was addressed
            // here, so it indicates that the bucket does not exist.
            Err(StorageError::BlobNotFound(_)) => {
                return Err(StorageError::BucketDoesNotExist(
                    "bucket does not exist".to_string(),
                ))
            }
            Err(e) => return Err(e),
            Ok(response) => response,
        };

        let _ = self._bucket_checked.set(());
        Ok(())
    }

    fn prefixed_key(&self, key: &str) -> String {
        if let Some(path_prefix) = &self.prefix {
            format!("{}/{}", path_prefix, key)
        } else {
            key.to_string()
        }
    }

    fn container_key(&self, name: &str) -> String {
        self.prefixed_key(&format!("{CONTAINER_KEYSPACE}/{name}"))
    }

    fn blob_key(&self, path: &BlobPath) -> String {
        self.prefixed_key(&format!("{BLOB_KEYSPACE}/{path}"))
    }

    fn blob_keyspace(&self, container: &str) -> String {
        self.prefixed_key(&format!("{BLOB_KEYSPACE}/{container}/"))
    }

    /// Base URL of the bucket: a signed HEAD on it with the query stripped.
    fn base_url(&self) -> String {
        let url = self.sign(self.bucket.head_bucket(Some(&self.credentials)));
        normalize_url(url, false)
    }

    /// Re-map the transport not-found/already-exists kinds for operations
    /// that address a container marker object.
    fn as_container_error(name: &str, err: StorageError) -> StorageError {
        match err {
            StorageError::BlobNotFound(_) => {
                StorageError::ContainerNotFound(format!("no container named {name:?}"))
            }
            StorageError::BlobAlreadyExists(_) => {
                StorageError::ContainerAlreadyExists(format!("container {name:?} already exists"))
            }
            other => other,
        }
    }

    async fn head_container(&self, name: &str) -> Result<bool> {
        let key = self.container_key(name);
        let action = self.bucket.head_object(Some(&self.credentials), &key);
        let url = self.sign(action);
        match self.send(self.client.head(url)).await {
            Ok(_) => Ok(true),
            Err(StorageError::BlobNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn require_container(&self, name: &str) -> Result<()> {
        if self.head_container(name).await? {
            Ok(())
        } else {
            Err(StorageError::ContainerNotFound(format!(
                "no container named {name:?}"
            )))
        }
    }

    async fn read_container_meta(&self, name: &str) -> Result<ContainerMeta> {
        let key = self.container_key(name);
        let action = self.bucket.get_object(Some(&self.credentials), &key);
        let url = self.sign(action);
        let response = self
            .send(self.client.get(url))
            .await
            .map_err(|e| Self::as_container_error(name, e))?;
        let bytes = Self::read_response_bytes(response).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::ConnectionError(format!("invalid container metadata: {e}")))
    }

    async fn write_container_meta(
        &self,
        name: &str,
        meta: &ContainerMeta,
        if_none_match: bool,
    ) -> Result<()> {
        let body = serde_json::to_vec(meta).map_err(|e| {
            StorageError::ConnectionError(format!("container metadata encoding failed: {e}"))
        })?;
        let key = self.container_key(name);
        let action = self.bucket.put_object(Some(&self.credentials), &key);
        let url = self.sign(action);
        let mut request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if if_none_match {
            request = request.header(IF_NONE_MATCH, "*");
        }
        self.send(request)
            .await
            .map(|_| ())
            .map_err(|e| Self::as_container_error(name, e))
    }

    /// A 404 on a blob does not say which level is missing; a secondary
    /// check on the container marker decides.
    async fn blob_not_found(&self, path: &BlobPath) -> StorageError {
        match self.head_container(path.container_name()).await {
            Ok(true) => StorageError::BlobNotFound(format!("no blob at {path}")),
            Ok(false) => StorageError::ContainerNotFound(format!(
                "no container named {:?}",
                path.container_name()
            )),
            Err(e) => e,
        }
    }

    async fn delete_key(&self, key: &str) -> Result<()> {
        let action = self.bucket.delete_object(Some(&self.credentials), key);
        let url = self.sign(action);
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)> {
        let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
        action.query_mut().insert("prefix", prefix.to_string());
        if let Some(token) = continuation_token {
            action
                .query_mut()
                .insert("continuation-token", token.to_string());
        }
        let url = self.sign(action);
        let response = self.send(self.client.get(url)).await?;
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return Err(StorageError::ConnectionError(e.to_string())),
        };
        let parsed = ListObjectsV2::parse_response(&text)
            .map_err(|e| StorageError::ConnectionError(format!("invalid list response: {e}")))?;
        let keys = parsed
            .contents
            .into_iter()
            .map(|object| object.key)
            .collect();
        Ok((keys, parsed.next_continuation_token))
    }

    async fn list_all(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let (page, next) = self
                .list_page(prefix, continuation_token.as_deref())
                .await?;
            keys.extend(page);
            match next {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn put_blob(
        &self,
        path: &BlobPath,
        body: Body,
        content_length: Option<u64>,
        content_type: &str,
        if_none_match: bool,
    ) -> Result<Response> {
        let key = self.blob_key(path);
        let action = self.bucket.put_object(Some(&self.credentials), &key);
        let url = self.sign(action);
        let mut request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, content_type)
            .body(body);
        if let Some(content_length) = content_length {
            request = request.header(CONTENT_LENGTH, content_length);
        }
        if if_none_match {
            request = request.header(IF_NONE_MATCH, "*");
        }
        self.send(request).await
    }
}

/// Presigned URLs percent-encode path separators inside object keys and
/// carry the access token as query credentials. Decode the separators back
/// to literal `/` and drop the query when the token was not requested.
fn normalize_url(mut url: Url, include_access_token: bool) -> String {
    if !include_access_token {
        url.set_query(None);
    }
    url.to_string().replace("%2F", "/")
}

#[async_trait]
impl BlobStorage for S3Storage {
    fn storage_url(&self, opts: &UrlOptions) -> String {
        if opts.include_access_token {
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            if let Some(prefix) = &self.prefix {
                action.query_mut().insert("prefix", format!("{prefix}/"));
            }
            normalize_url(self.sign(action), true)
        } else {
            self.base_url()
        }
    }

    fn container_url(&self, name: &str, opts: &UrlOptions) -> Result<String> {
        validate_container_name(name)?;
        if opts.include_access_token {
            // A token scoped to a container is a signed listing of its blob
            // keyspace.
            let mut action = self.bucket.list_objects_v2(Some(&self.credentials));
            action
                .query_mut()
                .insert("prefix", self.blob_keyspace(name));
            Ok(normalize_url(self.sign(action), true))
        } else {
            let base = self.base_url();
            let base = base.trim_end_matches('/');
            Ok(format!("{}/{}", base, self.blob_keyspace(name)))
        }
    }

    fn blob_url(&self, path: &BlobPath, opts: &UrlOptions) -> Result<String> {
        validate_container_name(path.container_name())?;
        let key = self.blob_key(path);
        let action = self.bucket.get_object(Some(&self.credentials), &key);
        Ok(normalize_url(self.sign(action), opts.include_access_token))
    }

    async fn create_container(&self, name: &str, opts: CreateContainerOptions) -> Result<bool> {
        validate_container_name(name)?;
        self.init().await?;
        let meta = ContainerMeta::from_policy(opts.access_policy);
        match self.write_container_meta(name, &meta, true).await {
            Ok(()) => Ok(true),
            Err(StorageError::ContainerAlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        validate_container_name(name)?;
        self.init().await?;
        self.head_container(name).await
    }

    async fn container_access_policy(&self, name: &str) -> Result<AccessPolicy> {
        validate_container_name(name)?;
        self.init().await?;
        Ok(self.read_container_meta(name).await?.policy())
    }

    async fn set_container_access_policy(&self, name: &str, policy: AccessPolicy) -> Result<()> {
        validate_container_name(name)?;
        self.init().await?;
        self.require_container(name).await?;
        self.write_container_meta(name, &ContainerMeta::from_policy(policy), false)
            .await
    }

    async fn delete_container(&self, name: &str) -> Result<bool> {
        validate_container_name(name)?;
        self.init().await?;
        if !self.head_container(name).await? {
            return Ok(false);
        }

        // Empty the container before removing its marker.
        let keys = self.list_all(&self.blob_keyspace(name)).await?;
        let count = keys.len();
        for key in keys {
            self.delete_key(&key).await?;
        }
        self.delete_key(&self.container_key(name)).await?;
        tracing::debug!(container = %name, blobs = count, "Deleted container.");
        Ok(true)
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        self.init().await?;
        let marker_prefix = self.prefixed_key(&format!("{CONTAINER_KEYSPACE}/"));
        let keys = self.list_all(&marker_prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&marker_prefix).map(str::to_string))
            .collect())
    }

    async fn create_blob(&self, path: &BlobPath, opts: WriteBlobOptions) -> Result<bool> {
        validate_container_name(path.container_name())?;
        self.init().await?;
        self.require_container(path.container_name()).await?;
        let content_type = opts.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
        match self
            .put_blob(path, Body::from(Vec::new()), None, content_type, true)
            .await
        {
            Ok(_) => Ok(true),
            Err(StorageError::BlobAlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn blob_exists(&self, path: &BlobPath) -> Result<bool> {
        validate_container_name(path.container_name())?;
        self.init().await?;
        let key = self.blob_key(path);
        let action = self.bucket.head_object(Some(&self.credentials), &key);
        let url = self.sign(action);
        match self.send(self.client.head(url)).await {
            Ok(_) => Ok(true),
            Err(StorageError::BlobNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn blob_contents_string(&self, path: &BlobPath) -> Result<String> {
        validate_container_name(path.container_name())?;
        self.init().await?;
        let key = self.blob_key(path);
        let action = self.bucket.get_object(Some(&self.credentials), &key);
        let url = self.sign(action);
        match self.send(self.client.get(url)).await {
            Ok(response) => {
                let bytes = Self::read_response_bytes(response).await?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            Err(StorageError::BlobNotFound(_)) => Err(self.blob_not_found(path).await),
            Err(e) => Err(e),
        }
    }

    async fn set_blob_contents_string(
        &self,
        path: &BlobPath,
        contents: &str,
        opts: WriteBlobOptions,
    ) -> Result<()> {
        validate_container_name(path.container_name())?;
        self.init().await?;
        self.require_container(path.container_name()).await?;
        let content_type = opts.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
        self.put_blob(
            path,
            Body::from(contents.as_bytes().to_vec()),
            None,
            content_type,
            false,
        )
        .await?;
        Ok(())
    }

    async fn set_blob_contents_file(
        &self,
        path: &BlobPath,
        file: &Path,
        opts: WriteBlobOptions,
    ) -> Result<()> {
        validate_container_name(path.container_name())?;
        self.init().await?;
        self.require_container(path.container_name()).await?;

        let file = tokio::fs::File::open(file).await?;
        let content_length = file.metadata().await?.len();
        let content_type = opts.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE);
        tracing::debug!(blob = %path, bytes = content_length, "Streaming file upload.");
        self.put_blob(
            path,
            Body::wrap_stream(ReaderStream::new(file)),
            Some(content_length),
            content_type,
            false,
        )
        .await?;
        Ok(())
    }

    async fn blob_content_type(&self, path: &BlobPath) -> Result<Option<String>> {
        validate_container_name(path.container_name())?;
        self.init().await?;
        let key = self.blob_key(path);
        let action = self.bucket.head_object(Some(&self.credentials), &key);
        let url = self.sign(action);
        match self.send(self.client.head(url)).await {
            Ok(response) => Ok(response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)),
            Err(StorageError::BlobNotFound(_)) => Err(self.blob_not_found(path).await),
            Err(e) => Err(e),
        }
    }

    async fn set_blob_content_type(&self, path: &BlobPath, content_type: &str) -> Result<()> {
        validate_container_name(path.container_name())?;
        self.init().await?;

        // Presigned requests offer no metadata-only rewrite; re-put the
        // current bytes under the new content type.
        let key = self.blob_key(path);
        let action = self.bucket.get_object(Some(&self.credentials), &key);
        let url = self.sign(action);
        let response = match self.send(self.client.get(url)).await {
            Ok(response) => response,
            Err(StorageError::BlobNotFound(_)) => return Err(self.blob_not_found(path).await),
            Err(e) => return Err(e),
        };
        let bytes = Self::read_response_bytes(response).await?;
        self.put_blob(path, Body::from(bytes.to_vec()), None, content_type, false)
            .await?;
        Ok(())
    }

    async fn delete_blob(&self, path: &BlobPath) -> Result<bool> {
        validate_container_name(path.container_name())?;
        self.init().await?;

        // DELETE on an S3-compatible API succeeds whether or not the object
        // exists, so the prior-existence answer needs a HEAD first.
        let key = self.blob_key(path);
        let action = self.bucket.head_object(Some(&self.credentials), &key);
        let url = self.sign(action);
        match self.send(self.client.head(url)).await {
            Ok(_) => {}
            Err(StorageError::BlobNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        }
        self.delete_key(&key).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_storage(bucket_prefix: Option<&str>) -> S3Storage {
        S3Storage::new(S3Config {
            key: "test-key".to_string(),
            endpoint: "https://s3.dualstack.us-east-1.amazonaws.com".to_string(),
            secret: "test-secret".to_string(),
            token: None,
            bucket: "carton-test".to_string(),
            region: "us-east-1".to_string(),
            bucket_prefix: bucket_prefix.map(str::to_string),
        })
    }

    #[test]
    fn key_layout_keeps_keyspaces_disjoint() {
        let storage = test_storage(None);
        let path = BlobPath::parse("containers/trick.txt").unwrap();
        assert_eq!(storage.container_key("containers"), "containers/containers");
        assert_eq!(storage.blob_key(&path), "blobs/containers/trick.txt");
    }

    #[test]
    fn key_layout_honors_bucket_prefix() {
        let storage = test_storage(Some("team-a"));
        let path = BlobPath::parse("logs/2024/app.log").unwrap();
        assert_eq!(storage.container_key("logs"), "team-a/containers/logs");
        assert_eq!(storage.blob_key(&path), "team-a/blobs/logs/2024/app.log");
        assert_eq!(storage.blob_keyspace("logs"), "team-a/blobs/logs/");
    }

    #[test]
    fn blob_url_without_token_has_no_query_and_literal_separators() {
        let storage = test_storage(None);
        let path = BlobPath::parse("logs/2024/01/app.log").unwrap();
        let url = storage.blob_url(&path, &UrlOptions::default()).unwrap();
        assert!(url.contains("/blobs/logs/2024/01/app.log"));
        assert!(!url.contains('?'));
        assert!(!url.contains("%2F"));
    }

    #[test]
    fn blob_url_with_token_keeps_signature_query() {
        let storage = test_storage(None);
        let path = BlobPath::parse("logs/app.log").unwrap();
        let url = storage
            .blob_url(
                &path,
                &UrlOptions {
                    include_access_token: true,
                },
            )
            .unwrap();
        assert!(url.contains("X-Amz-Signature="));
        assert!(!url.contains("%2F"));
    }

    #[test]
    fn container_url_without_token_is_path_style() {
        let storage = test_storage(None);
        let url = storage
            .container_url("logs", &UrlOptions::default())
            .unwrap();
        assert!(url.ends_with("/blobs/logs/"));
        assert!(!url.contains('?'));
    }

    #[test]
    fn url_resolution_validates_container_names() {
        let storage = test_storage(None);
        let err = storage
            .container_url("Logs", &UrlOptions::default())
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidResourceName(_)));
    }

    #[test]
    fn container_error_remapping() {
        let err = S3Storage::as_container_error(
            "logs",
            StorageError::BlobNotFound("received NOT_FOUND from S3-compatible API".to_string()),
        );
        assert!(matches!(err, StorageError::ContainerNotFound(_)));

        let err = S3Storage::as_container_error(
            "logs",
            StorageError::BlobAlreadyExists(
                "received PRECONDITION_FAILED from S3-compatible API".to_string(),
            ),
        );
        assert!(matches!(err, StorageError::ContainerAlreadyExists(_)));

        let err = S3Storage::as_container_error(
            "logs",
            StorageError::NotAuthorized("received FORBIDDEN from S3-compatible API".to_string()),
        );
        assert!(matches!(err, StorageError::NotAuthorized(_)));
    }

    #[test]
    fn container_meta_encodes_private_as_absence() {
        let rendered =
            serde_json::to_string(&ContainerMeta::from_policy(AccessPolicy::Private)).unwrap();
        assert_eq!(rendered, "{}");

        let rendered =
            serde_json::to_string(&ContainerMeta::from_policy(AccessPolicy::ContainerPublic))
                .unwrap();
        assert_eq!(rendered, "{\"access_policy\":\"container-public\"}");

        let parsed: ContainerMeta = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.policy(), AccessPolicy::Private);
    }
}
