//! Configuration types for vault-ingest

use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use utoipa::ToSchema;

/// Main configuration for [`JobManager`](crate::JobManager)
///
/// Sub-configs group related settings; every field has a default so an empty
/// JSON object is a valid configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct Config {
    /// Content-store layout and failure policy
    #[serde(default)]
    pub library: LibraryConfig,

    /// Page fetching
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Content mover worker pool
    #[serde(default)]
    pub mover: MoverConfig,

    /// Streaming cipher behavior
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// Best-effort deletes, trash fallback and ledger sweeps
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Finalization pipeline timing
    #[serde(default)]
    pub finalize: FinalizeConfig,

    /// Data storage and state management
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// API and external server integration
    #[serde(default)]
    pub server: ServerIntegrationConfig,
}

impl Config {
    /// Content-store root
    pub fn library_root(&self) -> &PathBuf {
        &self.library.library_root
    }
}

/// Content-store layout configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct LibraryConfig {
    /// Root of the content store; `tmp_*` and `comic_*` directories live here
    /// (default: "./library")
    #[serde(default = "default_library_root")]
    pub library_root: PathBuf,

    /// Purge temp and final directories when a job fails (default: true)
    #[serde(default = "default_true")]
    pub delete_on_fail: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            library_root: default_library_root(),
            delete_on_fail: true,
        }
    }
}

/// Page fetching configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct FetchConfig {
    /// User-Agent header sent with page requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Per-request timeout (default: 60 seconds)
    #[serde(default = "default_request_timeout", with = "duration_ms_serde")]
    #[schema(value_type = u64)]
    pub request_timeout: Duration,

    /// Temp pages smaller than this are treated as interrupted writes and
    /// re-fetched during finalization (default: 32 bytes)
    #[serde(default = "default_min_plausible_page_bytes")]
    pub min_plausible_page_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            request_timeout: default_request_timeout(),
            min_plausible_page_bytes: default_min_plausible_page_bytes(),
        }
    }
}

/// Content mover configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct MoverConfig {
    /// Worker pool width for the first move pass (default: 4)
    #[serde(default = "default_mover_concurrency")]
    pub concurrency: usize,

    /// Worker pool width for the retry pass (default: 1)
    #[serde(default = "default_retry_concurrency")]
    pub retry_concurrency: usize,

    /// How many sorted inputs are sniffed to decide between the plaintext and
    /// encrypted move variants (default: 8)
    #[serde(default = "default_plain_probe_limit")]
    pub plain_probe_limit: usize,
}

impl Default for MoverConfig {
    fn default() -> Self {
        Self {
            concurrency: default_mover_concurrency(),
            retry_concurrency: default_retry_concurrency(),
            plain_probe_limit: default_plain_probe_limit(),
        }
    }
}

/// Streaming cipher configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct CryptoConfig {
    /// Re-encrypt `random`-mode files under the vault key when they are read
    /// while the vault is unlocked (default: true)
    #[serde(default = "default_true")]
    pub upgrade_random_on_read: bool,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            upgrade_random_on_read: true,
        }
    }
}

/// Retry configuration for transient filesystem failures
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 150 ms)
    #[serde(default = "default_initial_delay", with = "duration_ms_serde")]
    #[schema(value_type = u64)]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 10 seconds)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
    #[schema(value_type = u64)]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// Cleanup configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct CleanupConfig {
    /// How long a recursive delete may run before falling back to
    /// rename-to-trash (default: 2500 ms)
    #[serde(default = "default_purge_timeout", with = "duration_ms_serde")]
    #[schema(value_type = u64)]
    pub purge_timeout: Duration,

    /// Attempts for single-file deletes outside of sweeps (default: 6)
    #[serde(default = "default_file_delete_attempts")]
    pub file_delete_attempts: u32,

    /// Attempts per ledger entry during a file sweep (default: 3)
    #[serde(default = "default_sweep_file_attempts")]
    pub sweep_file_attempts: u32,

    /// Backoff schedule shared by file delete retries
    #[serde(default)]
    pub delete_retry: RetryConfig,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            purge_timeout: default_purge_timeout(),
            file_delete_attempts: default_file_delete_attempts(),
            sweep_file_attempts: default_sweep_file_attempts(),
            delete_retry: RetryConfig::default(),
        }
    }
}

/// Finalization pipeline configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct FinalizeConfig {
    /// Pause after entering `finalizing` so in-flight writes settle
    /// (default: 400 ms)
    #[serde(default = "default_settle_delay", with = "duration_ms_serde")]
    #[schema(value_type = u64)]
    pub settle_delay: Duration,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            settle_delay: default_settle_delay(),
        }
    }
}

/// Data storage and state management configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct PersistenceConfig {
    /// Database path (default: "./vault-ingest.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// API and external server integration configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct ServerIntegrationConfig {
    /// REST API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// REST API configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiConfig {
    /// Address to bind to (default: 127.0.0.1:6790)
    #[serde(default = "default_bind_address")]
    #[schema(value_type = String)]
    pub bind_address: SocketAddr,

    /// Enable CORS for browser access (default: false)
    #[serde(default)]
    pub cors_enabled: bool,

    /// Allowed CORS origins; `"*"` allows any (default: none)
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Enable Swagger UI at /swagger-ui (default: true)
    #[serde(default = "default_true")]
    pub swagger_ui: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            cors_enabled: false,
            cors_origins: Vec::new(),
            swagger_ui: true,
        }
    }
}

// Durations are configured in milliseconds
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

fn default_library_root() -> PathBuf {
    PathBuf::from("library")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("vault-ingest.db")
}

fn default_user_agent() -> String {
    format!("vault-ingest/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_min_plausible_page_bytes() -> u64 {
    32
}

fn default_mover_concurrency() -> usize {
    4
}

fn default_retry_concurrency() -> usize {
    1
}

fn default_plain_probe_limit() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(150)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_purge_timeout() -> Duration {
    Duration::from_millis(2500)
}

fn default_file_delete_attempts() -> u32 {
    6
}

fn default_sweep_file_attempts() -> u32 {
    3
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(400)
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 6790))
}

fn default_true() -> bool {
    true
}
