use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::cache;
use crate::error::{ConfigError, ConfigResult as Result};
use crate::http_client::HttpClientConfig;
use crate::libxml2::ParseOptions;
use crate::location;

/// Trait for abstracting environment variable access
pub trait EnvProvider {
    fn get(&self, key: &str) -> Option<String>;
}

/// System environment variable provider for production use
pub struct SystemEnvProvider;

impl EnvProvider for SystemEnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

const ENV_PREFIX: &str = "LABEL_VALIDATOR_";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Information model version selecting the bundled defaults
    pub model_version: Option<String>,
    /// Catalog files, earlier ones take precedence
    pub catalogs: Vec<PathBuf>,
    /// Explicit schema locations; when set they override every other source
    pub schema_sources: Vec<String>,
    /// Rule source locations evaluated against every document
    pub rule_sources: Vec<String>,
    /// Bundled defaults, one subdirectory per model version
    pub resources_dir: Option<PathBuf>,
    /// Fallback directory searched for schemas and rule sources
    pub schema_directory: Option<PathBuf>,
    pub schema_check: SchemaCheckConfig,
    pub rule_check: RuleCheckConfig,
    pub parser: ParserConfig,
    pub network: NetworkConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchemaCheckConfig {
    pub enabled: bool,
    /// Compile the schema each document declares instead of a shared one
    pub use_document_schema: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuleCheckConfig {
    pub enabled: bool,
    /// Evaluate the rule sources named by `xml-model` processing instructions
    pub use_document_rules: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ParserConfig {
    pub xinclude: bool,
    pub load_external_dtd: bool,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// HTTP request timeout in seconds
    pub timeout_seconds: u64,
    /// Number of retry attempts for failed downloads
    pub retry_attempts: u32,
    /// Retry delay in milliseconds
    pub retry_delay_ms: u64,
}

/// Download cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory path
    pub directory: PathBuf,
    /// Time-to-live for downloaded resources in hours
    pub ttl_hours: u64,
    /// Maximum number of entries in memory cache
    pub max_memory_entries: u64,
    /// Memory cache TTL in seconds
    pub memory_ttl_seconds: u64,
}

impl Default for SchemaCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_document_schema: false,
        }
    }
}

impl Default for RuleCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_document_rules: false,
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        let options = ParseOptions::default();
        Self {
            xinclude: options.xinclude,
            load_external_dtd: options.load_external_dtd,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            retry_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        let defaults = cache::CacheConfig::default();
        Self {
            directory: defaults.directory,
            ttl_hours: defaults.ttl_hours,
            max_memory_entries: defaults.max_memory_entries,
            memory_ttl_seconds: defaults.memory_ttl_seconds,
        }
    }
}

impl Config {
    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            xinclude: self.parser.xinclude,
            load_external_dtd: self.parser.load_external_dtd,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout_seconds: self.network.timeout_seconds,
            retry_attempts: self.network.retry_attempts,
            retry_delay_ms: self.network.retry_delay_ms,
            ..HttpClientConfig::default()
        }
    }

    pub fn cache_config(&self) -> cache::CacheConfig {
        cache::CacheConfig {
            directory: self.cache.directory.clone(),
            ttl_hours: self.cache.ttl_hours,
            max_memory_entries: self.cache.max_memory_entries,
            memory_ttl_seconds: self.cache.memory_ttl_seconds,
        }
    }

    /// Make relative paths in the configuration relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let rebase = |path: &mut PathBuf| {
            let expanded = expand_home(path);
            *path = if expanded.is_relative() {
                base.join(expanded)
            } else {
                expanded
            };
        };
        self.catalogs.iter_mut().for_each(rebase);
        self.resources_dir.iter_mut().for_each(rebase);
        self.schema_directory.iter_mut().for_each(rebase);
        rebase(&mut self.cache.directory);

        for source in self.schema_sources.iter_mut().chain(self.rule_sources.iter_mut()) {
            if !location::is_absolute_url(source) && Path::new(source.as_str()).is_relative() {
                *source = base.join(source.as_str()).to_string_lossy().into_owned();
            }
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

fn parse_env<T: std::str::FromStr>(env: &impl EnvProvider, name: &str) -> Result<Option<T>> {
    let key = format!("{ENV_PREFIX}{name}");
    match env.get(&key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Environment(format!("Invalid {} value: {}", key, value))),
    }
}

/// Configuration manager for loading and merging configurations
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration with precedence: defaults -> file -> environment.
    ///
    /// Without an explicit path the standard locations are searched.
    pub fn load_config(path: Option<&Path>) -> Result<Config> {
        Self::load_config_with(&SystemEnvProvider, path)
    }

    pub fn load_config_with(env: &impl EnvProvider, path: Option<&Path>) -> Result<Config> {
        let mut config = Config::default();

        let file_config = match path {
            Some(path) => Some(Self::load_from_file(path)?),
            None => Self::find_config_file()?,
        };
        if let Some(file_config) = file_config {
            config = Self::merge_configs(config, file_config);
        }

        config = Self::apply_environment_overrides_with(env, config)?;
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration from a file (TOML or JSON)
    pub fn load_from_file(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)?;

        let mut config: Config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            Some(ext) => return Err(ConfigError::UnsupportedFormat(ext.to_string())),
            None => match toml::from_str::<Config>(&content) {
                Ok(config) => config,
                Err(_) => serde_json::from_str(&content)?,
            },
        };

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        debug!(path = %path.display(), "loaded configuration file");
        Ok(config)
    }

    /// Find configuration file in standard locations
    pub fn find_config_file() -> Result<Option<Config>> {
        let config_names = [
            "label-validator.toml",
            "label-validator.json",
            ".label-validator.toml",
            ".label-validator.json",
        ];

        for name in &config_names {
            let path = PathBuf::from(name);
            if path.exists() {
                return Ok(Some(Self::load_from_file(&path)?));
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let app_config_dir = config_dir.join("label-validator");
            for name in &config_names {
                let path = app_config_dir.join(name);
                if path.exists() {
                    return Ok(Some(Self::load_from_file(&path)?));
                }
            }
        }

        Ok(None)
    }

    /// Apply environment variable overrides using the system environment
    pub fn apply_environment_overrides(config: Config) -> Result<Config> {
        Self::apply_environment_overrides_with(&SystemEnvProvider, config)
    }

    /// Apply environment variable overrides with a custom environment provider
    pub fn apply_environment_overrides_with(
        env: &impl EnvProvider,
        mut config: Config,
    ) -> Result<Config> {
        if let Some(version) = env.get(&format!("{ENV_PREFIX}MODEL_VERSION")) {
            let version = version.trim();
            config.model_version = (!version.is_empty()).then(|| version.to_string());
        }

        if let Some(catalogs) = env.get(&format!("{ENV_PREFIX}CATALOGS")) {
            config.catalogs = catalogs
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }

        if let Some(enabled) = parse_env(env, "SCHEMA_CHECK")? {
            config.schema_check.enabled = enabled;
        }
        if let Some(own) = parse_env(env, "USE_DOCUMENT_SCHEMA")? {
            config.schema_check.use_document_schema = own;
        }
        if let Some(enabled) = parse_env(env, "RULE_CHECK")? {
            config.rule_check.enabled = enabled;
        }
        if let Some(own) = parse_env(env, "USE_DOCUMENT_RULES")? {
            config.rule_check.use_document_rules = own;
        }

        if let Some(cache_dir) = env.get(&format!("{ENV_PREFIX}CACHE_DIR")) {
            config.cache.directory = expand_home(Path::new(&cache_dir));
        }
        if let Some(ttl) = parse_env(env, "CACHE_TTL")? {
            config.cache.ttl_hours = ttl;
        }
        if let Some(timeout) = parse_env(env, "TIMEOUT")? {
            config.network.timeout_seconds = timeout;
        }
        if let Some(retry_attempts) = parse_env(env, "RETRY_ATTEMPTS")? {
            config.network.retry_attempts = retry_attempts;
        }

        Ok(config)
    }

    /// Merge two configurations; lists and options from the override win
    /// when set, sections are taken from the override.
    pub fn merge_configs(mut base: Config, override_config: Config) -> Config {
        if override_config.model_version.is_some() {
            base.model_version = override_config.model_version;
        }
        if !override_config.catalogs.is_empty() {
            base.catalogs = override_config.catalogs;
        }
        if !override_config.schema_sources.is_empty() {
            base.schema_sources = override_config.schema_sources;
        }
        if !override_config.rule_sources.is_empty() {
            base.rule_sources = override_config.rule_sources;
        }
        if override_config.resources_dir.is_some() {
            base.resources_dir = override_config.resources_dir;
        }
        if override_config.schema_directory.is_some() {
            base.schema_directory = override_config.schema_directory;
        }

        base.schema_check = override_config.schema_check;
        base.rule_check = override_config.rule_check;
        base.parser = override_config.parser;
        base.network = override_config.network;
        base.cache = override_config.cache;

        base
    }

    /// Validate configuration values
    pub fn validate_config(config: &Config) -> Result<()> {
        if config.cache.ttl_hours == 0 {
            return Err(ConfigError::Validation(
                "Cache TTL must be greater than 0".to_string(),
            ));
        }

        if config.cache.max_memory_entries == 0 {
            return Err(ConfigError::Validation(
                "Memory cache must hold at least one entry".to_string(),
            ));
        }

        if config.network.timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "Timeout must be greater than 0".to_string(),
            ));
        }

        if config.network.retry_attempts > 10 {
            return Err(ConfigError::Validation(
                "Retry attempts cannot exceed 10".to_string(),
            ));
        }

        if let Some(version) = &config.model_version
            && version.trim().is_empty()
        {
            return Err(ConfigError::Validation(
                "Model version must not be blank".to_string(),
            ));
        }

        if config.rule_check.use_document_rules && !config.rule_check.enabled {
            warn!("use_document_rules has no effect while rule checking is disabled");
        }
        if config.schema_check.use_document_schema && !config.schema_sources.is_empty() {
            warn!("explicit schema sources take precedence over use_document_schema");
        }

        Ok(())
    }
}
