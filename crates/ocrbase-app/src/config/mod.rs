//! Configuration loading and validation.
//!
//! Sources layer lowest to highest: built-in defaults, the system config
//! dir, the XDG config dir, a local `config/settings.toml`, an explicit
//! `OCRBASE_CONFIG_FILE` override, and finally `OCRBASE__`-prefixed
//! environment variables.

use std::{env, path::PathBuf};

use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

const LOCAL_CONFIG_PATH: &str = "config/settings.toml";
const ETC_CONFIG_ENV: &str = "OCRBASE_ETC_CONFIG_DIR";
const CONFIG_OVERRIDE_ENV: &str = "OCRBASE_CONFIG_FILE";
const ETC_CONFIG_DEFAULT: &str = "/etc/xdg";
const KEEPALIVE_CEILING_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub queue: QueueSettings,
    pub limits: LimitsConfig,
    pub ocr: OcrSettings,
    pub llm: LlmSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Externally reachable base URL, used to mint presigned upload URLs.
    pub public_base_url: String,
    #[serde(default = "ServerConfig::default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl ServerConfig {
    fn default_keepalive_secs() -> u64 {
        15
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory holding the LMDB stores and the blob tree.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Secret the presigned-upload MAC is derived from.
    pub presign_secret: String,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiKeyEntry {
    pub key: String,
    pub tenant_id: String,
    #[serde(default = "ApiKeyEntry::default_submitter")]
    pub submitter_id: String,
}

impl ApiKeyEntry {
    fn default_submitter() -> String {
        "api".to_string()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    #[serde(default = "QueueSettings::default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "QueueSettings::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "QueueSettings::default_backoff_base_ms")]
    pub backoff_base_ms: i64,
    #[serde(default = "QueueSettings::default_backoff_max_ms")]
    pub backoff_max_ms: i64,
    #[serde(default = "QueueSettings::default_lease_ttl_ms")]
    pub lease_ttl_ms: i64,
    #[serde(default = "QueueSettings::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "QueueSettings::default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

impl QueueSettings {
    fn default_concurrency() -> usize {
        4
    }

    fn default_max_attempts() -> u32 {
        3
    }

    fn default_backoff_base_ms() -> i64 {
        2_000
    }

    fn default_backoff_max_ms() -> i64 {
        60_000
    }

    fn default_lease_ttl_ms() -> i64 {
        300_000
    }

    fn default_poll_interval_ms() -> u64 {
        250
    }

    fn default_attempt_timeout_ms() -> u64 {
        300_000
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: Self::default_concurrency(),
            max_attempts: Self::default_max_attempts(),
            backoff_base_ms: Self::default_backoff_base_ms(),
            backoff_max_ms: Self::default_backoff_max_ms(),
            lease_ttl_ms: Self::default_lease_ttl_ms(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            attempt_timeout_ms: Self::default_attempt_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "LimitsConfig::default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    #[serde(default = "LimitsConfig::default_presign_ttl_secs")]
    pub presign_ttl_secs: u64,
}

impl LimitsConfig {
    fn default_max_file_size_bytes() -> u64 {
        50 * 1024 * 1024
    }

    fn default_presign_ttl_secs() -> u64 {
        900
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrSettings {
    pub base_url: String,
    pub model: String,
    #[serde(default = "OcrSettings::default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "OcrSettings::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl OcrSettings {
    fn default_max_tokens() -> u32 {
        8192
    }

    fn default_timeout_secs() -> u64 {
        120
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    #[serde(default = "LlmSettings::default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "LlmSettings::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl LlmSettings {
    fn default_max_tokens() -> u32 {
        8192
    }

    fn default_timeout_secs() -> u64 {
        120
    }
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let dirs = project_dirs()?;
    let default_storage = dirs.data_dir().to_path_buf();
    let mut builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default("server.public_base_url", "http://127.0.0.1:8080")?
        .set_default("server.keepalive_secs", 15)?
        .set_default(
            "storage.path",
            default_storage.to_string_lossy().to_string(),
        )?
        .set_default("auth.presign_secret", "dev-only-presign-secret")?
        .set_default("auth.api_keys", Vec::<String>::new())?
        .set_default("queue.concurrency", 4)?
        .set_default("queue.max_attempts", 3)?
        .set_default("queue.backoff_base_ms", 2_000)?
        .set_default("queue.backoff_max_ms", 60_000)?
        .set_default("queue.lease_ttl_ms", 300_000)?
        .set_default("queue.poll_interval_ms", 250)?
        .set_default("queue.attempt_timeout_ms", 300_000)?
        .set_default("limits.max_file_size_bytes", 50 * 1024 * 1024)?
        .set_default("limits.presign_ttl_secs", 900)?
        .set_default("ocr.base_url", "https://api.ocr.example")?
        .set_default("ocr.model", "document-ocr-2")?
        .set_default("llm.base_url", "https://api.llm.example/v1")?
        .set_default("llm.model", "extract-large")?;

    for path in base_config_paths(&dirs) {
        debug_assert!(!path.as_os_str().is_empty());
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
    }

    if let Some(override_path) = config_override_path()? {
        debug_assert!(!override_path.as_os_str().is_empty());
        builder = builder.add_source(
            File::from(override_path)
                .format(FileFormat::Toml)
                .required(true),
        );
    }

    builder = builder.add_source(Environment::with_prefix("OCRBASE").separator("__"));

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "ocrbase", "ocrbase").ok_or(AppConfigError::MissingProjectDirs)
}

fn base_config_paths(dirs: &ProjectDirs) -> [PathBuf; 3] {
    let etc_root = etc_config_dir();
    [
        etc_root.join("ocrbase").join("settings.toml"),
        dirs.config_dir().join("settings.toml"),
        PathBuf::from(LOCAL_CONFIG_PATH),
    ]
}

fn config_override_path() -> Result<Option<PathBuf>, AppConfigError> {
    match env::var_os(CONFIG_OVERRIDE_ENV) {
        None => Ok(None),
        Some(raw) => {
            let path = PathBuf::from(raw);
            if path.as_os_str().is_empty() {
                return Err(invalid_config("OCRBASE_CONFIG_FILE must not be empty"));
            }
            Ok(Some(path))
        }
    }
}

fn etc_config_dir() -> PathBuf {
    match env::var_os(ETC_CONFIG_ENV) {
        Some(raw) => {
            let path = PathBuf::from(&raw);
            if path.as_os_str().is_empty() {
                PathBuf::from(ETC_CONFIG_DEFAULT)
            } else {
                path
            }
        }
        None => PathBuf::from(ETC_CONFIG_DEFAULT),
    }
}

fn validate_config(config: &AppConfig) -> Result<(), AppConfigError> {
    if config.server.listen_addr.is_empty() {
        return Err(invalid_config("server.listen_addr must not be empty"));
    }
    validate_base_url(&config.server.public_base_url)?;
    if config.server.keepalive_secs == 0
        || config.server.keepalive_secs > KEEPALIVE_CEILING_SECS
    {
        return Err(invalid_config(format!(
            "server.keepalive_secs must be between 1 and {KEEPALIVE_CEILING_SECS}"
        )));
    }
    if config.auth.presign_secret.is_empty() {
        return Err(invalid_config("auth.presign_secret must not be empty"));
    }
    for entry in &config.auth.api_keys {
        if entry.key.is_empty() || entry.tenant_id.is_empty() {
            return Err(invalid_config(
                "auth.api_keys entries need both `key` and `tenant_id`",
            ));
        }
    }
    if config.queue.concurrency == 0 {
        return Err(invalid_config("queue.concurrency must be at least 1"));
    }
    if config.queue.max_attempts == 0 {
        return Err(invalid_config("queue.max_attempts must be at least 1"));
    }
    if config.queue.backoff_base_ms <= 0
        || config.queue.backoff_max_ms < config.queue.backoff_base_ms
    {
        return Err(invalid_config(
            "queue backoff bounds must satisfy 0 < base <= max",
        ));
    }
    if config.limits.max_file_size_bytes == 0 {
        return Err(invalid_config("limits.max_file_size_bytes must be positive"));
    }
    Ok(())
}

fn validate_base_url(raw: &str) -> Result<(), AppConfigError> {
    let url = Url::parse(raw)
        .map_err(|_| invalid_config(format!("invalid server.public_base_url `{raw}`")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(invalid_config(format!(
                "server.public_base_url must use http or https (found {other})"
            )));
        }
    }
    if url.host_str().is_none() {
        return Err(invalid_config("server.public_base_url must include a host"));
    }
    Ok(())
}

fn invalid_config<S: Into<String>>(message: S) -> AppConfigError {
    AppConfigError::Build(config::ConfigError::Message(message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                listen_addr: "127.0.0.1:8080".to_string(),
                public_base_url: "http://127.0.0.1:8080".to_string(),
                keepalive_secs: 15,
            },
            storage: StorageConfig {
                path: PathBuf::from("/tmp/ocrbase"),
            },
            auth: AuthConfig {
                presign_secret: "secret".to_string(),
                api_keys: vec![],
            },
            queue: QueueSettings::default(),
            limits: LimitsConfig {
                max_file_size_bytes: LimitsConfig::default_max_file_size_bytes(),
                presign_ttl_secs: 900,
            },
            ocr: OcrSettings {
                base_url: "https://api.ocr.example".to_string(),
                model: "document-ocr-2".to_string(),
                max_tokens: 8192,
                timeout_secs: 120,
            },
            llm: LlmSettings {
                base_url: "https://api.llm.example/v1".to_string(),
                model: "extract-large".to_string(),
                max_tokens: 8192,
                timeout_secs: 120,
            },
        }
    }

    #[test]
    fn minimal_config_validates() {
        validate_config(&minimal_config()).expect("valid");
    }

    #[test]
    fn keepalive_above_ceiling_is_rejected() {
        let mut config = minimal_config();
        config.server.keepalive_secs = 31;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn empty_presign_secret_is_rejected() {
        let mut config = minimal_config();
        config.auth.presign_secret.clear();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn backoff_bounds_are_checked() {
        let mut config = minimal_config();
        config.queue.backoff_max_ms = config.queue.backoff_base_ms - 1;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn non_http_public_base_url_is_rejected() {
        let mut config = minimal_config();
        config.server.public_base_url = "ftp://host".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn api_key_entries_require_key_and_tenant() {
        let mut config = minimal_config();
        config.auth.api_keys.push(ApiKeyEntry {
            key: String::new(),
            tenant_id: "org_a".to_string(),
            submitter_id: "api".to_string(),
        });
        assert!(validate_config(&config).is_err());
    }
}
