//! Backblaze B2 partition source
//!
//! Lists the partitions of a table stored under a prefix in a B2 bucket.

use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use super::errors::SourceError;
use super::types::{normalize_prefix, partition_path, FileInfo, ListFilesResponse};
use super::PartitionSource;

/// B2 API base URL for authorization (v3 for nested apiInfo structure)
const B2_AUTH_URL: &str = "https://api.backblazeb2.com/b2api/v3/b2_authorize_account";

/// HTTP client timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of retries for retryable errors
const MAX_RETRIES: u32 = 3;

/// Page size for b2_list_file_names
const MAX_FILE_COUNT: u32 = 1000;

/// Auth state that can be refreshed (interior mutability)
struct AuthState {
    auth_token: String,
    api_url: String,
}

/// B2 API client for listing bucket contents
#[derive(Clone)]
pub struct B2Client {
    /// HTTP client for making requests
    http_client: Client,
    /// B2 account ID
    account_id: String,
    /// Mutable auth state (refreshable on 401)
    auth_state: Arc<RwLock<AuthState>>,
    /// Authorization endpoint, reused for token refresh
    auth_url: String,
    /// Stored credentials for re-authorization
    key_id: String,
    key: String,
    /// Bucket ID to operate on
    bucket_id: String,
}

/// Response from b2_authorize_account API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeAccountResponse {
    account_id: String,
    authorization_token: String,
    api_info: ApiInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiInfo {
    storage_api: StorageApiInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageApiInfo {
    api_url: String,
}

/// Response from b2_list_buckets API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListBucketsResponse {
    buckets: Vec<BucketInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketInfo {
    bucket_id: String,
    bucket_name: String,
}

/// Request body for b2_list_file_names API
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListFileNamesRequest {
    bucket_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
    max_file_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_file_name: Option<String>,
}

/// Turn a non-success response into a SourceError
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SourceError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(SourceError::from_status(status, &body))
}

/// Call b2_authorize_account with Basic auth
///
/// A 401 here means the application key itself was rejected, so it is
/// reported as `Forbidden` rather than as an expired token.
async fn authorize_account(
    http_client: &Client,
    auth_url: &str,
    key_id: &str,
    key: &str,
) -> Result<AuthorizeAccountResponse, SourceError> {
    let credentials = format!("{}:{}", key_id, key);
    let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
    let auth_header = format!("Basic {}", encoded);

    let response = http_client
        .get(auth_url)
        .header("Authorization", &auth_header)
        .send()
        .await?;

    let response = check_status(response).await.map_err(|e| match e {
        SourceError::AuthExpired => {
            SourceError::Forbidden(format!("B2 rejected application key '{}'", key_id))
        }
        other => other,
    })?;
    Ok(response.json().await?)
}

impl B2Client {
    /// Get current auth token
    fn auth_token(&self) -> String {
        self.auth_state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .auth_token
            .clone()
    }

    /// Get current API URL
    fn api_url(&self) -> String {
        self.auth_state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .api_url
            .clone()
    }

    /// Refresh the auth token by re-authorizing with B2
    pub async fn refresh_auth(&self) -> Result<(), SourceError> {
        info!("Refreshing B2 auth token...");

        let auth_response = authorize_account(&self.http_client, &self.auth_url, &self.key_id, &self.key).await?;

        let mut state = self
            .auth_state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        state.auth_token = auth_response.authorization_token;
        state.api_url = auth_response.api_info.storage_api.api_url;

        info!("B2 auth token refreshed successfully");
        Ok(())
    }

    /// Execute an operation with retry logic and exponential backoff
    async fn with_retry<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, SourceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let backoff_ms: [u64; 3] = [500, 1000, 2000];
        let mut attempt = 0;

        loop {
            let e = match f().await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            if !e.is_retryable() || attempt >= MAX_RETRIES {
                return Err(e);
            }

            // Handle auth expiry by refreshing token
            if matches!(e, SourceError::AuthExpired) && attempt == 0 {
                warn!(operation = operation, "Auth expired, refreshing token...");
                if let Err(refresh_err) = self.refresh_auth().await {
                    error!(error = %refresh_err, "Failed to refresh auth token");
                }
            }

            let delay = backoff_ms.get(attempt as usize).copied().unwrap_or(2000);
            warn!(
                operation = operation,
                attempt = attempt + 1,
                max = MAX_RETRIES,
                delay_ms = delay,
                error = %e,
                "Retrying B2 operation"
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
            attempt += 1;
        }
    }

    /// Authorize with B2 and create a new client for the specified bucket
    ///
    /// # Arguments
    /// * `key_id` - B2 application key ID
    /// * `key` - B2 application key
    /// * `bucket_name` - Name of the bucket to access
    pub async fn authorize(key_id: &str, key: &str, bucket_name: &str) -> Result<Self, SourceError> {
        Self::authorize_with_url(B2_AUTH_URL, key_id, key, bucket_name).await
    }

    /// Authorize against a specific b2_authorize_account endpoint
    pub(crate) async fn authorize_with_url(
        auth_url: &str,
        key_id: &str,
        key: &str,
        bucket_name: &str,
    ) -> Result<Self, SourceError> {
        info!(bucket = bucket_name, "Authorizing with B2 API...");

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SourceError::Request(e.to_string()))?;

        let auth_response = authorize_account(&http_client, auth_url, key_id, key).await?;

        let api_url = auth_response.api_info.storage_api.api_url;
        debug!(api_url = %api_url, "B2 authorization successful");

        let mut client = Self {
            http_client,
            account_id: auth_response.account_id,
            auth_state: Arc::new(RwLock::new(AuthState {
                auth_token: auth_response.authorization_token,
                api_url,
            })),
            auth_url: auth_url.to_string(),
            key_id: key_id.to_string(),
            key: key.to_string(),
            bucket_id: String::new(),
        };

        client.bucket_id = client.get_bucket_id(bucket_name).await?;

        info!(bucket_name = bucket_name, bucket_id = %client.bucket_id, "B2 client ready");
        Ok(client)
    }

    /// Look up bucket ID from bucket name
    async fn get_bucket_id(&self, bucket_name: &str) -> Result<String, SourceError> {
        let url = format!("{}/b2api/v2/b2_list_buckets", self.api_url());

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", &self.auth_token())
            .json(&serde_json::json!({
                "accountId": self.account_id,
                "bucketName": bucket_name
            }))
            .send()
            .await?;

        let list_response: ListBucketsResponse = check_status(response).await?.json().await?;

        list_response
            .buckets
            .into_iter()
            .find(|b| b.bucket_name == bucket_name)
            .map(|b| b.bucket_id)
            .ok_or_else(|| SourceError::NotFound(format!("Bucket '{}' not found", bucket_name)))
    }

    /// Fetch a single page of b2_list_file_names
    async fn list_files_page(
        &self,
        request: &ListFileNamesRequest,
    ) -> Result<ListFilesResponse, SourceError> {
        let url = format!("{}/b2api/v2/b2_list_file_names", self.api_url());

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", &self.auth_token())
            .json(request)
            .send()
            .await?;

        Ok(check_status(response).await?.json().await?)
    }

    /// List every file name in the bucket under an optional prefix
    ///
    /// Follows `nextFileName` until the listing is exhausted.
    pub async fn list_file_names(&self, prefix: Option<&str>) -> Result<Vec<FileInfo>, SourceError> {
        let mut all_files = Vec::new();
        let mut start_file_name: Option<String> = None;

        loop {
            let request = ListFileNamesRequest {
                bucket_id: self.bucket_id.clone(),
                prefix: prefix.map(String::from),
                max_file_count: MAX_FILE_COUNT,
                start_file_name: start_file_name.take(),
            };

            debug!(prefix = ?prefix, start = ?request.start_file_name, "Listing files from B2");

            let request = &request;
            let page = self
                .with_retry("list_file_names", move || self.list_files_page(request))
                .await?;

            all_files.extend(page.files);

            match page.next_file_name {
                Some(next) => start_file_name = Some(next),
                None => break,
            }
        }

        debug!(count = all_files.len(), "Listed files from B2");
        Ok(all_files)
    }

    /// Get the bucket ID
    pub fn bucket_id(&self) -> &str {
        &self.bucket_id
    }
}

/// Collect the distinct, sorted partitions touched by uploads after `since`
pub fn partitions_from_files(files: &[FileInfo], table_prefix: &str, since: Option<u64>) -> Vec<String> {
    files
        .iter()
        .filter(|file| file.is_upload() && file.written_since(since))
        .filter_map(|file| partition_path(&file.file_name, table_prefix))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Partition source backed by a table prefix in a B2 bucket
///
/// Authorization is deferred to the first listing, so a warm cache never
/// touches the network. The listing trait is synchronous, so calls are
/// bridged onto the runtime with `Handle::block_on`. Call it from a blocking
/// thread, not from inside an async task.
pub struct B2PartitionSource {
    /// Authorization endpoint
    auth_url: String,
    /// B2 application key ID
    key_id: String,
    /// B2 application key
    key: String,
    /// Bucket holding the table
    bucket_name: String,
    /// Table location within the bucket
    table_prefix: String,
    /// Client, created on first use
    client: OnceCell<B2Client>,
    /// Tokio runtime handle for async operations
    runtime: Handle,
}

impl B2PartitionSource {
    /// Create a source for the table stored under `table_prefix`
    pub fn new(key_id: &str, key: &str, bucket_name: &str, table_prefix: &str, runtime: Handle) -> Self {
        Self {
            auth_url: B2_AUTH_URL.to_string(),
            key_id: key_id.to_string(),
            key: key.to_string(),
            bucket_name: bucket_name.to_string(),
            table_prefix: normalize_prefix(table_prefix),
            client: OnceCell::new(),
            runtime,
        }
    }

    /// Use a different b2_authorize_account endpoint
    #[cfg(test)]
    pub(crate) fn with_auth_url(mut self, auth_url: &str) -> Self {
        self.auth_url = auth_url.to_string();
        self
    }

    async fn list_files(&self) -> Result<Vec<FileInfo>, SourceError> {
        let client = self
            .client
            .get_or_try_init(|| {
                B2Client::authorize_with_url(&self.auth_url, &self.key_id, &self.key, &self.bucket_name)
            })
            .await?;

        let prefix = (!self.table_prefix.is_empty()).then_some(self.table_prefix.as_str());
        client.list_file_names(prefix).await
    }
}

impl PartitionSource for B2PartitionSource {
    fn list_partitions_since(&self, since: Option<u64>) -> Result<Vec<String>, SourceError> {
        let files = self.runtime.block_on(self.list_files())?;

        let partitions = partitions_from_files(&files, &self.table_prefix, since);
        info!(
            bucket = %self.bucket_name,
            prefix = %self.table_prefix,
            files = files.len(),
            partitions = partitions.len(),
            "Listed partitions from B2"
        );
        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PartitionListCache;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const AUTH_PATH: &str = "/b2api/v3/b2_authorize_account";
    const LIST_BUCKETS_PATH: &str = "/b2api/v2/b2_list_buckets";
    const LIST_FILES_PATH: &str = "/b2api/v2/b2_list_file_names";

    fn auth_url(server: &MockServer) -> String {
        format!("{}{}", server.uri(), AUTH_PATH)
    }

    async fn mount_auth(server: &MockServer, times: u64) {
        Mock::given(method("GET"))
            .and(path(AUTH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "accountId": "acct-1",
                "authorizationToken": "token-1",
                "apiInfo": {"storageApi": {"apiUrl": server.uri()}}
            })))
            .expect(times)
            .mount(server)
            .await;
    }

    async fn mount_bucket(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path(LIST_BUCKETS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "buckets": [
                    {"bucketId": "bucket-1", "bucketName": "warehouse", "bucketType": "allPrivate"}
                ]
            })))
            .mount(server)
            .await;
    }

    fn files_page(names: &[&str], next: Option<&str>) -> serde_json::Value {
        let files: Vec<_> = names
            .iter()
            .map(|name| json!({"fileName": name, "uploadTimestamp": 100, "action": "upload"}))
            .collect();
        json!({"files": files, "nextFileName": next})
    }

    async fn test_client(server: &MockServer) -> B2Client {
        B2Client::authorize_with_url(&auth_url(server), "key-id", "key", "warehouse")
            .await
            .unwrap()
    }

    fn upload(name: &str, ts: u64) -> FileInfo {
        FileInfo {
            file_name: name.to_string(),
            upload_timestamp: ts,
            action: "upload".to_string(),
        }
    }

    #[test]
    fn test_list_request_serialization() {
        let request = ListFileNamesRequest {
            bucket_id: "test-bucket".to_string(),
            prefix: Some("warehouse/trips/".to_string()),
            max_file_count: 100,
            start_file_name: None,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("bucketId"));
        assert!(json.contains("prefix"));
        assert!(json.contains("maxFileCount"));
        assert!(!json.contains("startFileName"));
    }

    #[test]
    fn test_partitions_from_files() {
        let files = vec![
            upload("t/2024/01/02/b.parquet", 20),
            upload("t/2024/01/01/a.parquet", 10),
            upload("t/2024/01/01/c.parquet", 30),
            upload("t/.hoodie/hoodie.properties", 5),
            upload("t/README", 5),
            FileInfo {
                file_name: "t/2024/01/03/d.parquet".to_string(),
                upload_timestamp: 40,
                action: "hide".to_string(),
            },
        ];

        assert_eq!(
            partitions_from_files(&files, "t", None),
            vec!["2024/01/01".to_string(), "2024/01/02".to_string()]
        );
        assert_eq!(
            partitions_from_files(&files, "t", Some(20)),
            vec!["2024/01/01".to_string()]
        );
        assert!(partitions_from_files(&files, "t", Some(30)).is_empty());
    }

    #[tokio::test]
    async fn test_authorize_resolves_bucket_id() {
        let server = MockServer::start().await;
        mount_auth(&server, 1).await;
        mount_bucket(&server).await;

        let client = test_client(&server).await;
        assert_eq!(client.bucket_id(), "bucket-1");
    }

    #[tokio::test]
    async fn test_rejected_key_is_forbidden() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(AUTH_PATH))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad_auth_token"))
            .expect(1)
            .mount(&server)
            .await;

        let result = B2Client::authorize_with_url(&auth_url(&server), "key-id", "key", "warehouse").await;
        assert!(matches!(result, Err(SourceError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_list_file_names_follows_pages() {
        let server = MockServer::start().await;
        mount_auth(&server, 1).await;
        mount_bucket(&server).await;

        // Second page first: it is the more specific match
        Mock::given(method("POST"))
            .and(path(LIST_FILES_PATH))
            .and(body_partial_json(json!({"startFileName": "t/2024/01/02/b.parquet"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(files_page(&["t/2024/01/02/b.parquet"], None)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(LIST_FILES_PATH))
            .and(header("authorization", "token-1"))
            .and(body_partial_json(json!({"bucketId": "bucket-1", "prefix": "t/"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(files_page(
                &["t/2024/01/01/a.parquet", "t/2024/01/01/c.parquet"],
                Some("t/2024/01/02/b.parquet"),
            )))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let files = client.list_file_names(Some("t/")).await.unwrap();

        let names: Vec<_> = files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["t/2024/01/01/a.parquet", "t/2024/01/01/c.parquet", "t/2024/01/02/b.parquet"]
        );
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        mount_auth(&server, 1).await;
        mount_bucket(&server).await;

        Mock::given(method("POST"))
            .and(path(LIST_FILES_PATH))
            .respond_with(ResponseTemplate::new(503).set_body_string("service_unavailable"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(LIST_FILES_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(files_page(&["t/p=1/a.parquet"], None)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let files = client.list_file_names(Some("t/")).await.unwrap();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        mount_auth(&server, 1).await;
        mount_bucket(&server).await;

        Mock::given(method("POST"))
            .and(path(LIST_FILES_PATH))
            .respond_with(ResponseTemplate::new(503).set_body_string("service_unavailable"))
            .expect(u64::from(MAX_RETRIES) + 1)
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let result = client.list_file_names(Some("t/")).await;
        assert!(matches!(result, Err(SourceError::Server(503, _))));
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let server = MockServer::start().await;
        mount_auth(&server, 1).await;
        mount_bucket(&server).await;

        Mock::given(method("POST"))
            .and(path(LIST_FILES_PATH))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such bucket"))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let result = client.list_file_names(None).await;
        assert!(matches!(result, Err(SourceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_expired_token_reauthorizes_once() {
        let server = MockServer::start().await;
        // Initial authorization plus one refresh
        mount_auth(&server, 2).await;
        mount_bucket(&server).await;

        Mock::given(method("POST"))
            .and(path(LIST_FILES_PATH))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired_auth_token"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(LIST_FILES_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(files_page(&["t/p=1/a.parquet"], None)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let files = client.list_file_names(Some("t/")).await.unwrap();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_warm_cache_skips_authorization() {
        let server = MockServer::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let cache_file = tmp.path().join("trips.partitions");
        std::fs::write(&cache_file, "2024/01/01\n").unwrap();

        let source = B2PartitionSource::new("key-id", "key", "warehouse", "t", Handle::current())
            .with_auth_url(&auth_url(&server));
        let cache = PartitionListCache::new(Arc::new(source), &cache_file);

        assert_eq!(cache.get_all_partitions().unwrap(), vec!["2024/01/01"]);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_source_lists_partitions_on_miss() {
        let server = MockServer::start().await;
        mount_auth(&server, 1).await;
        mount_bucket(&server).await;
        Mock::given(method("POST"))
            .and(path(LIST_FILES_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(files_page(
                &[
                    "t/.hoodie/hoodie.properties",
                    "t/2024/01/01/a.parquet",
                    "t/2024/01/02/b.parquet",
                ],
                None,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let cache_file = tmp.path().join("trips.partitions");
        let source = B2PartitionSource::new("key-id", "key", "warehouse", "t", Handle::current())
            .with_auth_url(&auth_url(&server));
        let cache = PartitionListCache::new(Arc::new(source), &cache_file);

        let partitions = tokio::task::spawn_blocking(move || cache.get_all_partitions())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(partitions, vec!["2024/01/01", "2024/01/02"]);
        assert!(cache_file.exists());
    }
}
