//! Retrying REST client plus the Data Store and File Store collaborators.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use recon_core::{ColumnProfile, PendingUpdate, RemoteKeys};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "recon-storage";

pub const SPREADSHEET_MIME: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Statuses worth another attempt; everything else fails immediately.
const TRANSIENT_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

const MAX_ERROR_BODY_CHARS: usize = 500;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("missing data store credentials (SUPABASE_URL / SUPABASE_KEY)")]
    MissingCredentials,
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: usize,
        last_error: String,
    },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("decoding response for {operation}: {message}")]
    Decode { operation: String, message: String },
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("object already exists: {bucket}/{key}")]
    AlreadyExists { bucket: String, key: String },
    #[error("invalid object key: {bucket}/{key}")]
    InvalidKey { bucket: String, key: String },
    #[error("{store} lock poisoned")]
    Poisoned { store: &'static str },
}

impl StoreError {
    /// Whether the failure is the retryable kind. Errors surfaced after the retry
    /// loop are final regardless of this classification.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => TRANSIENT_STATUSES.contains(status),
            Self::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if TRANSIENT_STATUSES.contains(&status.as_u16()) {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

/// reqwest client wrapped with bounded retry on transient statuses and timeouts.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl RestClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, StoreError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            backoff: config.backoff,
        })
    }

    /// Sends the request built by `build`, rebuilding it for every attempt.
    ///
    /// Success statuses return the body. Transient failures are retried with
    /// exponential backoff and become `RetriesExhausted` once the budget is spent;
    /// any other status fails immediately as `HttpStatus`.
    pub async fn execute<F>(&self, operation: &str, build: F) -> Result<HttpReply, StoreError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let span = info_span!("http_call", operation);
        async move {
            let mut last_error = String::new();

            for attempt in 0..=self.backoff.max_retries {
                match build(&self.client).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(HttpReply {
                                status: status.as_u16(),
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable {
                            last_error = format!("http status {status} for {url}");
                            if attempt < self.backoff.max_retries {
                                warn!(attempt, %status, "transient status; retrying");
                                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                                continue;
                            }
                            break;
                        }

                        let body = resp.text().await.unwrap_or_default();
                        return Err(StoreError::HttpStatus {
                            status: status.as_u16(),
                            url,
                            body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable {
                            last_error = err.to_string();
                            if attempt < self.backoff.max_retries {
                                warn!(attempt, error = %err, "request error; retrying");
                                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                                continue;
                            }
                            break;
                        }
                        return Err(StoreError::Request(err));
                    }
                }
            }

            Err(StoreError::RetriesExhausted {
                operation: operation.to_string(),
                attempts: self.backoff.max_retries + 1,
                last_error,
            })
        }
        .instrument(span)
        .await
    }
}

/// Base URL + service key for the hosted REST backend.
#[derive(Clone)]
pub struct ServiceCredentials {
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("base_url", &self.base_url)
            .field("api_key_len", &self.api_key.len())
            .finish()
    }
}

impl ServiceCredentials {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, StoreError> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        let api_key = api_key.into().trim().to_string();
        if base_url.is_empty() || api_key.is_empty() {
            return Err(StoreError::MissingCredentials);
        }
        Ok(Self { base_url, api_key })
    }

    pub fn from_env() -> Result<Self, StoreError> {
        Self::new(
            std::env::var("SUPABASE_URL").unwrap_or_default(),
            std::env::var("SUPABASE_KEY").unwrap_or_default(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }
}

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Pending updates not yet marked applied, projected to the tracked fields.
    async fn fetch_pending_updates(&self) -> Result<Vec<PendingUpdate>, StoreError>;

    /// Stamps the given update ids as applied. Re-marking is a no-op at the store.
    async fn mark_applied(
        &self,
        update_ids: &[String],
        applied_on: NaiveDate,
    ) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn download(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        upsert: bool,
    ) -> Result<(), StoreError>;

    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        ttl_seconds: u64,
    ) -> Result<Option<String>, StoreError>;
}

/// Pending-update table served through a PostgREST-style endpoint.
#[derive(Debug, Clone)]
pub struct RestDataStore {
    http: RestClient,
    credentials: ServiceCredentials,
    table: String,
    select: String,
    keys: RemoteKeys,
    chunk_size: usize,
}

impl RestDataStore {
    pub const DEFAULT_CHUNK_SIZE: usize = 300;

    pub fn new(
        http: RestClient,
        credentials: ServiceCredentials,
        table: impl Into<String>,
        profile: &ColumnProfile,
    ) -> Self {
        let keys = profile.remote_keys.clone();
        let mut fields = vec!["id".to_string(), keys.identifier.clone(), keys.email.clone()];
        fields.extend(profile.remote_fields.iter().map(|m| m.remote_key.clone()));

        Self {
            http,
            credentials,
            table: table.into(),
            select: fields.join(","),
            keys,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.credentials.base_url(), self.table)
    }
}

#[async_trait]
impl DataStore for RestDataStore {
    async fn fetch_pending_updates(&self) -> Result<Vec<PendingUpdate>, StoreError> {
        let url = self.table_url();
        let query = [
            ("select", self.select.clone()),
            (self.keys.applied_date.as_str(), "is.null".to_string()),
        ];
        info!(table = %self.table, select = %self.select, "fetching pending updates");

        let reply = self
            .http
            .execute("fetch_pending_updates", |client| {
                self.credentials.authorize(client.get(&url).query(&query))
            })
            .await?;

        let updates: Vec<PendingUpdate> =
            serde_json::from_slice(&reply.body).map_err(|e| StoreError::Decode {
                operation: "fetch_pending_updates".to_string(),
                message: e.to_string(),
            })?;
        info!(count = updates.len(), "pending updates fetched");
        Ok(updates)
    }

    async fn mark_applied(
        &self,
        update_ids: &[String],
        applied_on: NaiveDate,
    ) -> Result<usize, StoreError> {
        if update_ids.is_empty() {
            info!("mark_applied: no ids to update");
            return Ok(0);
        }

        let url = self.table_url();
        let mut fields = serde_json::Map::new();
        fields.insert(
            self.keys.applied_date.clone(),
            serde_json::Value::String(applied_on.format("%Y-%m-%d").to_string()),
        );
        fields.insert(
            self.keys.applied_flag.clone(),
            serde_json::Value::String(self.keys.applied_flag_value.clone()),
        );
        let body = serde_json::Value::Object(fields);
        let mut updated_total = 0usize;

        for chunk in update_ids.chunks(self.chunk_size) {
            let filter = format!("in.({})", join_ids_for_in(chunk));
            info!(ids = chunk.len(), "marking updates applied");
            let reply = self
                .http
                .execute("mark_applied", |client| {
                    self.credentials.authorize(
                        client
                            .patch(&url)
                            .query(&[("id", filter.as_str())])
                            .header("Prefer", "return=representation")
                            .json(&body),
                    )
                })
                .await?;

            updated_total += match serde_json::from_slice::<Vec<serde_json::Value>>(&reply.body) {
                Ok(rows) => rows.len(),
                Err(_) => chunk.len(),
            };
        }

        info!(updated_total, "mark_applied complete");
        Ok(updated_total)
    }
}

/// Formats ids for a PostgREST `in.(...)` filter: digits bare, anything else quoted.
pub fn join_ids_for_in(ids: &[String]) -> String {
    ids.iter()
        .map(|id| {
            if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
                id.clone()
            } else {
                format!("\"{}\"", id.replace('"', "\\\""))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Bucket/key object store behind the hosted storage REST API.
#[derive(Debug, Clone)]
pub struct RestFileStore {
    http: RestClient,
    credentials: ServiceCredentials,
    download_timeout: Duration,
}

impl RestFileStore {
    pub fn new(http: RestClient, credentials: ServiceCredentials) -> Self {
        Self {
            http,
            credentials,
            download_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{bucket}/{key}",
            self.credentials.base_url()
        )
    }
}

fn is_not_found(err: &StoreError) -> bool {
    match err {
        StoreError::HttpStatus { status: 404, .. } => true,
        // The storage API reports missing objects as 400 with a not_found body.
        StoreError::HttpStatus {
            status: 400, body, ..
        } => {
            let lower = body.to_ascii_lowercase();
            lower.contains("not_found") || lower.contains("not found")
        }
        _ => false,
    }
}

#[async_trait]
impl FileStore for RestFileStore {
    async fn download(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let url = self.object_url(bucket, key);
        info!(bucket, key, "downloading object");
        let result = self
            .http
            .execute("download_object", |client| {
                self.credentials
                    .authorize(client.get(&url).timeout(self.download_timeout))
            })
            .await;

        match result {
            Ok(reply) => {
                info!(bucket, key, bytes = reply.body.len(), "object downloaded");
                Ok(Some(reply.body))
            }
            Err(err) if is_not_found(&err) => {
                info!(bucket, key, "object not found");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        upsert: bool,
    ) -> Result<(), StoreError> {
        let url = self.object_url(bucket, key);
        let upsert_header = if upsert { "true" } else { "false" };
        info!(bucket, key, bytes = bytes.len(), upsert, "uploading object");
        self.http
            .execute("upload_object", |client| {
                self.credentials.authorize(
                    client
                        .post(&url)
                        .header("Content-Type", SPREADSHEET_MIME)
                        .header("x-upsert", upsert_header)
                        .body(bytes.to_vec()),
                )
            })
            .await?;
        Ok(())
    }

    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        ttl_seconds: u64,
    ) -> Result<Option<String>, StoreError> {
        let url = format!(
            "{}/storage/v1/object/sign/{bucket}/{key}",
            self.credentials.base_url()
        );
        let body = serde_json::json!({ "expiresIn": ttl_seconds });
        let result = self
            .http
            .execute("sign_object", |client| {
                self.credentials.authorize(client.post(&url).json(&body))
            })
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(err),
        };

        let value: serde_json::Value =
            serde_json::from_slice(&reply.body).map_err(|e| StoreError::Decode {
                operation: "sign_object".to_string(),
                message: e.to_string(),
            })?;
        let signed = value
            .get("signedURL")
            .or_else(|| value.get("signedUrl"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if signed.is_empty() {
            Ok(None)
        } else if signed.starts_with("http") {
            Ok(Some(signed.to_string()))
        } else {
            Ok(Some(format!(
                "{}/storage/v1{signed}",
                self.credentials.base_url()
            )))
        }
    }
}

/// Filesystem-backed object store: `<root>/<bucket>/<key>`, atomic temp-file writes.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        let safe = |part: &str| {
            !part.is_empty()
                && Path::new(part)
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)))
        };
        if !safe(bucket) || !safe(key) {
            return Err(StoreError::InvalidKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(self.root.join(bucket).join(key))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn download(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(&path, err)),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        upsert: bool,
    ) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;
        let exists = fs::try_exists(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        if exists && !upsert {
            return Err(StoreError::AlreadyExists {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| io_error(&parent, e))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| io_error(&temp_path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| io_error(&temp_path, e))?;
        file.flush().await.map_err(|e| io_error(&temp_path, e))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(&path, err));
        }

        info!(bucket, key, sha256 = %sha256_hex(bytes), "stored object");
        Ok(())
    }

    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        _ttl_seconds: u64,
    ) -> Result<Option<String>, StoreError> {
        let path = self.object_path(bucket, key)?;
        let exists = fs::try_exists(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        Ok(exists.then(|| format!("file://{}", path.display())))
    }
}

/// Stand-in used when no credentials are configured; every call fails with
/// `MissingCredentials` at the stage that needs the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredStore;

#[async_trait]
impl DataStore for UnconfiguredStore {
    async fn fetch_pending_updates(&self) -> Result<Vec<PendingUpdate>, StoreError> {
        Err(StoreError::MissingCredentials)
    }

    async fn mark_applied(
        &self,
        update_ids: &[String],
        _applied_on: NaiveDate,
    ) -> Result<usize, StoreError> {
        if update_ids.is_empty() {
            return Ok(0);
        }
        Err(StoreError::MissingCredentials)
    }
}

#[async_trait]
impl FileStore for UnconfiguredStore {
    async fn download(&self, _bucket: &str, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError::MissingCredentials)
    }

    async fn upload(
        &self,
        _bucket: &str,
        _key: &str,
        _bytes: &[u8],
        _upsert: bool,
    ) -> Result<(), StoreError> {
        Err(StoreError::MissingCredentials)
    }

    async fn signed_url(
        &self,
        _bucket: &str,
        _key: &str,
        _ttl_seconds: u64,
    ) -> Result<Option<String>, StoreError> {
        Err(StoreError::MissingCredentials)
    }
}

/// In-process data store. Fetch mirrors the server-side "not yet applied" filter.
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    updates: Mutex<Vec<PendingUpdate>>,
    applied: Mutex<BTreeMap<String, NaiveDate>>,
}

impl MemoryDataStore {
    pub fn new(updates: Vec<PendingUpdate>) -> Self {
        Self {
            updates: Mutex::new(updates),
            applied: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn applied(&self) -> BTreeMap<String, NaiveDate> {
        self.applied
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

fn poisoned<T>(store: &'static str) -> impl FnOnce(T) -> StoreError {
    move |_| StoreError::Poisoned { store }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn fetch_pending_updates(&self) -> Result<Vec<PendingUpdate>, StoreError> {
        let applied = self.applied.lock().map_err(poisoned("memory data store"))?.clone();
        let updates = self.updates.lock().map_err(poisoned("memory data store"))?.clone();
        Ok(updates
            .into_iter()
            .filter(|u| u.id.as_ref().map_or(true, |id| !applied.contains_key(id)))
            .collect())
    }

    async fn mark_applied(
        &self,
        update_ids: &[String],
        applied_on: NaiveDate,
    ) -> Result<usize, StoreError> {
        let known: Vec<String> = self
            .updates
            .lock()
            .map_err(poisoned("memory data store"))?
            .iter()
            .filter_map(|u| u.id.clone())
            .collect();
        let mut applied = self.applied.lock().map_err(poisoned("memory data store"))?;
        let mut updated = 0;
        for id in update_ids.iter().filter(|id| known.contains(id)) {
            applied.entry(id.clone()).or_insert(applied_on);
            updated += 1;
        }
        Ok(updated)
    }
}

/// In-process object store keyed by `(bucket, key)`.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .ok()
            .and_then(|g| g.get(&(bucket.to_string(), key.to_string())).cloned())
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn download(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let objects = self.objects.lock().map_err(poisoned("memory file store"))?;
        Ok(objects.get(&(bucket.to_string(), key.to_string())).cloned())
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        upsert: bool,
    ) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().map_err(poisoned("memory file store"))?;
        let entry_key = (bucket.to_string(), key.to_string());
        if !upsert && objects.contains_key(&entry_key) {
            return Err(StoreError::AlreadyExists {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        objects.insert(entry_key, bytes.to_vec());
        Ok(())
    }

    async fn signed_url(
        &self,
        bucket: &str,
        key: &str,
        ttl_seconds: u64,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .download(bucket, key)
            .await?
            .map(|_| format!("memory://{bucket}/{key}?ttl={ttl_seconds}")))
    }
}
