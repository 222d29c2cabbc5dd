/// Configuration management for the BPN directory server
use crate::{
    cache::CacheConfig,
    engine::{EngineConfig, RetryPolicy},
    error::{BdrsError, BdrsResult},
};
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf, str::FromStr, time::Duration};
use tracing_subscriber::EnvFilter;

/// Log filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "bdrs_server=info,tower_http=info";

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub cache: CacheSettings,
    pub limits: LimitsConfig,
    pub jobs: JobsConfig,
    pub authentication: AuthConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub directory_port: u16,
    pub management_port: u16,
    pub service_did: String,
    pub version: String,
}

/// Mapping store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    Sqlite,
    Memory,
}

impl FromStr for StoreBackendKind {
    type Err = BdrsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreBackendKind::Sqlite),
            "memory" => Ok(StoreBackendKind::Memory),
            other => Err(BdrsError::Validation(format!(
                "Unknown store backend '{}' (expected sqlite or memory)",
                other
            ))),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StoreBackendKind,
    pub database_path: PathBuf,
    pub max_connections: u32,
    pub migrations_enabled: bool,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

/// Resolution cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub enabled: bool,
    pub capacity: usize,
    pub shards: usize,
    /// 0 disables expiry
    pub ttl_secs: u64,
}

/// Request size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub batch_max_size: usize,
    pub page_size_default: usize,
    pub page_size_max: usize,
}

/// Background job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub directory_poll_period_secs: u64,
    /// Random 1-4 seconds when unset
    pub directory_poll_initial_delay_secs: Option<u64>,
    pub reconcile_period_secs: u64,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub trusted_issuers: Vec<String>,
    pub did_keys_file: Option<PathBuf>,
    pub expected_audience: Option<String>,
    pub membership_credential_type: String,
    pub management_credential_type: Option<String>,
    /// DIDs or BPNs granted the management scope
    pub management_principals: Vec<String>,
    #[serde(skip_serializing)]
    pub management_api_key: Option<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `bdrs_server=debug,tower_http=info`
    pub level: String,
    pub format: LogFormat,
}

impl LoggingConfig {
    /// Parse the configured level into a subscriber filter
    pub fn filter(&self) -> BdrsResult<EnvFilter> {
        EnvFilter::try_new(&self.level).map_err(|e| {
            BdrsError::Validation(format!("Invalid RUST_LOG filter {:?}: {}", self.level, e))
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> BdrsResult<T> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BdrsError::Validation(format!("Invalid value for {}: {}", key, raw))),
        None => Ok(default),
    }
}

fn list(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Vec<String> {
    lookup(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BdrsResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key/value source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BdrsResult<Self> {
        let hostname = lookup("BDRS_HOSTNAME").unwrap_or_else(|| "0.0.0.0".to_string());
        let directory_port = parse_or(&lookup, "BDRS_DIRECTORY_PORT", 8080u16)?;
        let management_port = parse_or(&lookup, "BDRS_MANAGEMENT_PORT", 8081u16)?;
        let service_did =
            lookup("BDRS_SERVICE_DID").unwrap_or_else(|| format!("did:web:{}", hostname));

        let backend = parse_or(&lookup, "BDRS_STORE_BACKEND", StoreBackendKind::Sqlite)?;
        let database_path = lookup("BDRS_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/bdrs.sqlite"));

        let log_format = match lookup("BDRS_LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(BdrsError::Validation(format!(
                    "Invalid value for BDRS_LOG_FORMAT: {}",
                    other
                )))
            }
        };

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                directory_port,
                management_port,
                service_did,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            storage: StorageConfig {
                backend,
                database_path,
                max_connections: parse_or(&lookup, "BDRS_DB_MAX_CONNECTIONS", 10)?,
                migrations_enabled: parse_or(&lookup, "BDRS_MIGRATIONS_ENABLED", true)?,
                retry_attempts: parse_or(&lookup, "BDRS_STORE_RETRY_ATTEMPTS", 3)?,
                retry_backoff_ms: parse_or(&lookup, "BDRS_STORE_RETRY_BACKOFF_MS", 50)?,
            },
            cache: CacheSettings {
                enabled: parse_or(&lookup, "BDRS_CACHE_ENABLED", true)?,
                capacity: parse_or(&lookup, "BDRS_CACHE_CAPACITY", 10_000)?,
                shards: parse_or(&lookup, "BDRS_CACHE_SHARDS", 16)?,
                ttl_secs: parse_or(&lookup, "BDRS_CACHE_TTL_SECS", 300)?,
            },
            limits: LimitsConfig {
                batch_max_size: parse_or(&lookup, "BDRS_BATCH_MAX_SIZE", 1000)?,
                page_size_default: parse_or(&lookup, "BDRS_PAGE_SIZE_DEFAULT", 100)?,
                page_size_max: parse_or(&lookup, "BDRS_PAGE_SIZE_MAX", 500)?,
            },
            jobs: JobsConfig {
                directory_poll_period_secs: parse_or(
                    &lookup,
                    "BDRS_DIRECTORY_POLL_PERIOD_SECS",
                    60,
                )?,
                directory_poll_initial_delay_secs: match lookup(
                    "BDRS_DIRECTORY_POLL_INITIAL_DELAY_SECS",
                ) {
                    Some(_) => Some(parse_or(&lookup, "BDRS_DIRECTORY_POLL_INITIAL_DELAY_SECS", 0)?),
                    None => None,
                },
                reconcile_period_secs: parse_or(&lookup, "BDRS_RECONCILE_PERIOD_SECS", 30)?,
            },
            authentication: AuthConfig {
                trusted_issuers: list(&lookup, "BDRS_TRUSTED_ISSUERS"),
                did_keys_file: non_empty(&lookup, "BDRS_DID_KEYS_FILE").map(PathBuf::from),
                expected_audience: non_empty(&lookup, "BDRS_EXPECTED_AUDIENCE"),
                membership_credential_type: lookup("BDRS_MEMBERSHIP_CREDENTIAL_TYPE")
                    .unwrap_or_else(|| "MembershipCredential".to_string()),
                management_credential_type: non_empty(&lookup, "BDRS_MANAGEMENT_CREDENTIAL_TYPE"),
                management_principals: list(&lookup, "BDRS_MANAGEMENT_PRINCIPALS"),
                management_api_key: non_empty(&lookup, "BDRS_MANAGEMENT_API_KEY"),
            },
            logging: LoggingConfig {
                level: non_empty(&lookup, "RUST_LOG")
                    .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
                format: log_format,
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> BdrsResult<()> {
        if self.service.hostname.is_empty() {
            return Err(BdrsError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.service.directory_port == self.service.management_port {
            return Err(BdrsError::Validation(
                "Directory and management APIs need distinct ports".to_string(),
            ));
        }

        if self.storage.max_connections == 0 {
            return Err(BdrsError::Validation(
                "BDRS_DB_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }

        if self.cache.enabled && (self.cache.capacity == 0 || self.cache.shards == 0) {
            return Err(BdrsError::Validation(
                "Cache capacity and shard count must be positive".to_string(),
            ));
        }

        if self.limits.batch_max_size == 0 {
            return Err(BdrsError::Validation(
                "BDRS_BATCH_MAX_SIZE must be positive".to_string(),
            ));
        }

        if self.limits.page_size_default == 0
            || self.limits.page_size_default > self.limits.page_size_max
        {
            return Err(BdrsError::Validation(
                "Default page size must be between 1 and the maximum page size".to_string(),
            ));
        }

        if self.jobs.directory_poll_period_secs == 0 || self.jobs.reconcile_period_secs == 0 {
            return Err(BdrsError::Validation(
                "Job periods must be positive".to_string(),
            ));
        }

        if self.authentication.membership_credential_type.is_empty() {
            return Err(BdrsError::Validation(
                "Membership credential type cannot be empty".to_string(),
            ));
        }

        self.logging.filter()?;

        if let Some(key) = &self.authentication.management_api_key {
            if key.len() < 16 {
                return Err(BdrsError::Validation(
                    "Management API key must be at least 16 characters".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Cache layer settings
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            enabled: self.cache.enabled,
            capacity: self.cache.capacity,
            shards: self.cache.shards,
            ttl: (self.cache.ttl_secs > 0).then(|| Duration::from_secs(self.cache.ttl_secs)),
        }
    }

    /// Resolution engine policy
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            batch_max_size: self.limits.batch_max_size,
            page_size_default: self.limits.page_size_default,
            page_size_max: self.limits.page_size_max,
            retry: RetryPolicy {
                attempts: self.storage.retry_attempts,
                base_backoff: Duration::from_millis(self.storage.retry_backoff_ms),
                ..RetryPolicy::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> BdrsResult<ServerConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        config.validate().unwrap();

        assert_eq!(config.service.directory_port, 8080);
        assert_eq!(config.service.management_port, 8081);
        assert_eq!(config.service.service_did, "did:web:0.0.0.0");
        assert_eq!(config.storage.backend, StoreBackendKind::Sqlite);
        assert!(config.storage.migrations_enabled);
        assert_eq!(config.cache_config().ttl, Some(Duration::from_secs(300)));
        assert_eq!(config.engine_config().batch_max_size, 1000);
        assert_eq!(config.jobs.directory_poll_initial_delay_secs, None);
        assert_eq!(
            config.authentication.membership_credential_type,
            "MembershipCredential"
        );
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.logging.level, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("BDRS_STORE_BACKEND", "memory"),
            ("BDRS_CACHE_TTL_SECS", "0"),
            ("BDRS_TRUSTED_ISSUERS", "did:web:a.example, did:web:b.example,"),
            ("BDRS_DIRECTORY_POLL_INITIAL_DELAY_SECS", "2"),
            ("BDRS_LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert_eq!(config.storage.backend, StoreBackendKind::Memory);
        assert_eq!(config.cache_config().ttl, None);
        assert_eq!(config.authentication.trusted_issuers.len(), 2);
        assert_eq!(config.jobs.directory_poll_initial_delay_secs, Some(2));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_log_level_drives_filter() {
        let config = config_from(&[("RUST_LOG", "bdrs_server=debug,tower_http=warn")]).unwrap();
        assert_eq!(config.logging.level, "bdrs_server=debug,tower_http=warn");
        let filter = config.logging.filter().unwrap();
        assert!(filter.to_string().contains("bdrs_server=debug"));

        let config = config_from(&[("RUST_LOG", "bdrs_server=loud")]).unwrap();
        assert!(config.logging.filter().is_err());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(config_from(&[("BDRS_DIRECTORY_PORT", "http")]).is_err());
        assert!(config_from(&[("BDRS_STORE_BACKEND", "postgres")]).is_err());
        assert!(config_from(&[("BDRS_LOG_FORMAT", "xml")]).is_err());

        let config = config_from(&[("BDRS_MANAGEMENT_API_KEY", "short")]).unwrap();
        assert!(config.validate().is_err());

        let config = config_from(&[("BDRS_MANAGEMENT_PORT", "8080")]).unwrap();
        assert!(config.validate().is_err());

        let config = config_from(&[("BDRS_PAGE_SIZE_DEFAULT", "600")]).unwrap();
        assert!(config.validate().is_err());
    }
}
