//! Upload configuration.
//!
//! Every field has a default, so an empty TOML table is a valid
//! configuration (apart from the URLs, which are checked when used).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sliceup_transfer::{DEFAULT_CHUNK_SIZE, HashAlgorithm};

use crate::error::UploadError;

/// Static settings for an uploader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Maximum chunk uploads in flight.
    #[serde(default = "default_concurrent_max")]
    pub concurrent_max: usize,

    /// Retries per chunk after its first attempt.
    #[serde(default = "default_concurrent_retry_max")]
    pub concurrent_retry_max: usize,

    /// Multipart field carrying the chunk bytes.
    #[serde(default = "default_name")]
    pub name: String,

    /// Merge form field carrying the file hash.
    #[serde(default = "default_merge_name")]
    pub merge_name: String,

    /// Send and store cookies.
    #[serde(default)]
    pub with_credentials: bool,

    #[serde(default)]
    pub upload_url: Option<String>,

    #[serde(default = "default_method")]
    pub upload_method: String,

    #[serde(default)]
    pub upload_headers: BTreeMap<String, String>,

    /// Extra multipart fields sent with every chunk.
    #[serde(default)]
    pub upload_fields: BTreeMap<String, String>,

    #[serde(default)]
    pub merge_url: Option<String>,

    #[serde(default = "default_method")]
    pub merge_method: String,

    #[serde(default)]
    pub merge_headers: BTreeMap<String, String>,

    /// Extra form fields sent with the merge request.
    #[serde(default)]
    pub merge_fields: BTreeMap<String, String>,

    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,

    /// Per-request timeout. `None` waits indefinitely.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_concurrent_max() -> usize {
    sliceup_concurrent::DEFAULT_MAX
}

fn default_concurrent_retry_max() -> usize {
    sliceup_concurrent::DEFAULT_RETRY_COUNT
}

fn default_name() -> String {
    "file".into()
}

fn default_merge_name() -> String {
    "fileHash".into()
}

fn default_method() -> String {
    "post".into()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            concurrent_max: default_concurrent_max(),
            concurrent_retry_max: default_concurrent_retry_max(),
            name: default_name(),
            merge_name: default_merge_name(),
            with_credentials: false,
            upload_url: None,
            upload_method: default_method(),
            upload_headers: BTreeMap::new(),
            upload_fields: BTreeMap::new(),
            merge_url: None,
            merge_method: default_method(),
            merge_headers: BTreeMap::new(),
            merge_fields: BTreeMap::new(),
            hash_algorithm: HashAlgorithm::default(),
            request_timeout_secs: None,
        }
    }
}

impl UploadConfig {
    /// Checks values that would make every run fail.
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size == 0 {
            return Err(UploadError::Configuration("chunk_size must be greater than zero".into()));
        }
        if self.concurrent_max == 0 {
            return Err(UploadError::Configuration(
                "concurrent_max must be at least 1".into(),
            ));
        }
        if self.name.is_empty() {
            return Err(UploadError::Configuration("name must not be empty".into()));
        }
        if self.merge_name.is_empty() {
            return Err(UploadError::Configuration("merge_name must not be empty".into()));
        }
        for (field, method) in [
            ("upload_method", &self.upload_method),
            ("merge_method", &self.merge_method),
        ] {
            if method.trim().is_empty() {
                return Err(UploadError::Configuration(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}
