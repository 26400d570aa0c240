use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use recon_core::ColumnProfile;
use recon_storage::{
    BackoffPolicy, DataStore, FileStore, HttpClientConfig, LocalFileStore, RestClient,
    RestDataStore, RestFileStore, ServiceCredentials, StoreError, UnconfiguredStore,
};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ReconConfig {
    pub credentials: Option<ServiceCredentials>,
    pub updates_table: String,
    pub ge_bucket: String,
    pub ge_latest_key: String,
    pub reports_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub http_timeout_secs: u64,
    pub storage_timeout_secs: u64,
    pub utc_offset_hours: i32,
    pub profile_path: Option<PathBuf>,
    pub local_store_dir: Option<PathBuf>,
    pub web_port: u16,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            updates_table: "Hubspot_Leads_Updates".to_string(),
            ge_bucket: "google_earth_files".to_string(),
            ge_latest_key: "current/latest.xlsx".to_string(),
            reports_dir: PathBuf::from("./reports"),
            max_upload_bytes: 5 * 1024 * 1024,
            http_timeout_secs: 45,
            storage_timeout_secs: 120,
            utc_offset_hours: -6,
            profile_path: None,
            local_store_dir: None,
            web_port: 8000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl ReconConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let credentials = ServiceCredentials::from_env().ok();
        if credentials.is_none() {
            warn!("SUPABASE_URL / SUPABASE_KEY not set; remote stores are unavailable");
        }

        Self {
            credentials,
            updates_table: std::env::var("UPDATES_TABLE").unwrap_or(defaults.updates_table),
            ge_bucket: std::env::var("GE_BUCKET").unwrap_or(defaults.ge_bucket),
            ge_latest_key: std::env::var("GE_LATEST_KEY").unwrap_or(defaults.ge_latest_key),
            reports_dir: std::env::var("RECON_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            max_upload_bytes: env_parse::<usize>("RECON_MAX_UPLOAD_MB")
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.max_upload_bytes),
            http_timeout_secs: env_parse("RECON_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            storage_timeout_secs: env_parse("RECON_STORAGE_TIMEOUT_SECS")
                .unwrap_or(defaults.storage_timeout_secs),
            utc_offset_hours: env_parse("RECON_UTC_OFFSET_HOURS")
                .filter(|h: &i32| (-23..=23).contains(h))
                .unwrap_or(defaults.utc_offset_hours),
            profile_path: std::env::var("RECON_PROFILE").ok().map(PathBuf::from),
            local_store_dir: std::env::var("RECON_LOCAL_STORE_DIR").ok().map(PathBuf::from),
            web_port: env_parse("RECON_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }

    /// Today's date at the configured business offset from UTC.
    pub fn business_today(&self) -> NaiveDate {
        (Utc::now() + chrono::Duration::hours(i64::from(self.utc_offset_hours))).date_naive()
    }

    /// Built-in profile, or the YAML file at `profile_path` layered over it.
    pub fn load_profile(&self) -> Result<ColumnProfile> {
        match &self.profile_path {
            Some(path) => load_profile_file(path),
            None => Ok(ColumnProfile::default()),
        }
    }

    fn rest_client(&self) -> Result<RestClient, StoreError> {
        RestClient::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(format!("recon/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn data_store(&self, profile: &ColumnProfile) -> Result<Arc<dyn DataStore>, StoreError> {
        let Some(credentials) = self.credentials.clone() else {
            return Ok(Arc::new(UnconfiguredStore));
        };
        Ok(Arc::new(RestDataStore::new(
            self.rest_client()?,
            credentials,
            self.updates_table.clone(),
            profile,
        )))
    }

    pub fn file_store(&self) -> Result<Arc<dyn FileStore>, StoreError> {
        if let Some(dir) = &self.local_store_dir {
            info!(root = %dir.display(), "using local file store");
            return Ok(Arc::new(LocalFileStore::new(dir.clone())));
        }
        let Some(credentials) = self.credentials.clone() else {
            return Ok(Arc::new(UnconfiguredStore));
        };
        Ok(Arc::new(
            RestFileStore::new(self.rest_client()?, credentials)
                .with_download_timeout(Duration::from_secs(self.storage_timeout_secs)),
        ))
    }
}

pub fn load_profile_file(path: &Path) -> Result<ColumnProfile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let profile: ColumnProfile = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    info!(path = %path.display(), tracked = profile.tracked_columns().len(), "loaded column profile");
    Ok(profile)
}
