use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Application configuration
///
/// All settings load from environment variables (with `.env` support) so the
/// crawler can run unchanged in a container, a cron job, or a dev shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub crawler: CrawlerSettings,
    pub storage: StorageSettings,
    pub validation: ValidationSettings,
    pub scheduled: ScheduleSettings,
    pub bulk: BulkSettings,
}

/// Upstream portal access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerSettings {
    /// Portal root, e.g. `https://www.rechtsprechung-im-internet.de`
    pub base_url: String,
    /// User-Agent sent on every request
    pub user_agent: String,
    /// Minimum spacing between outbound requests per worker, in milliseconds
    pub rate_limit_ms: u64,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

/// Which backend(s) receive documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Archive,
    Search,
    Dual,
}

impl StorageType {
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "archive" => Some(Self::Archive),
            "search" => Some(Self::Search),
            "dual" => Some(Self::Dual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root directory of the filesystem archive (and campaign state)
    pub base_path: PathBuf,
    pub storage_type: StorageType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    pub schema_enabled: bool,
    pub legal_doc_ml_enabled: bool,
    pub ecli_enabled: bool,
    /// Strict mode: any validation error fails the document
    pub strict_mode: bool,
    /// Run validation off the download path and apply the report afterwards
    pub async_validation: bool,
    pub timeout_seconds: u64,
    /// Maximum accepted XML size in MiB
    pub max_size_mib: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    /// Single toggle for all cron jobs
    pub enabled: bool,
    /// How many dates (ending yesterday) the daily job covers
    pub days_back: u32,
    pub daily_cron: String,
    pub weekly_cron: String,
    pub retry_cron: String,
    pub health_cron: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSettings {
    pub max_concurrent_operations: usize,
    pub max_concurrent_checks: usize,
    pub default_rate_limit_ms: u64,
    pub default_max_concurrent_downloads: usize,
    pub discovery_timeout_hours: u64,
    pub stuck_operation_timeout_hours: u64,
    /// Minimum interval between periodic progress writes, in milliseconds
    pub progress_update_interval_ms: u64,
    /// Whether empty recent-discovery sampling falls back to a full range scan
    pub full_scan_fallback: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Ok(Config {
            crawler: CrawlerSettings {
                base_url: env_string(
                    "CRAWLER_BASE_URL",
                    "https://www.rechtsprechung-im-internet.de",
                ),
                user_agent: env_string("CRAWLER_USER_AGENT", "ecli-crawler/0.1"),
                rate_limit_ms: env_or("CRAWLER_RATE_LIMIT_MS", 1000),
                request_timeout_secs: env_or("CRAWLER_REQUEST_TIMEOUT_SECS", 30),
            },

            storage: StorageSettings {
                base_path: PathBuf::from(env_string("STORAGE_BASE_PATH", "./legal-documents")),
                storage_type: env::var("STORAGE_TYPE")
                    .ok()
                    .and_then(|v| StorageType::from_str_opt(&v))
                    .unwrap_or(StorageType::Dual),
            },

            validation: ValidationSettings {
                schema_enabled: env_or("VALIDATION_SCHEMA_ENABLED", true),
                legal_doc_ml_enabled: env_or("VALIDATION_LEGAL_DOC_ML_ENABLED", true),
                ecli_enabled: env_or("VALIDATION_ECLI_ENABLED", true),
                strict_mode: env_or("VALIDATION_STRICT_MODE", false),
                async_validation: env_or("VALIDATION_ASYNC", false),
                timeout_seconds: env_or("VALIDATION_TIMEOUT_SECONDS", 30),
                max_size_mib: env_or("VALIDATION_MAX_SIZE_MIB", 10),
            },

            scheduled: ScheduleSettings {
                enabled: env_or("SCHEDULED_ENABLED", true),
                days_back: env_or("SCHEDULED_DAYS_BACK", 7),
                daily_cron: env_string("SCHEDULED_DAILY_CRON", "0 0 6 * * *"),
                weekly_cron: env_string("SCHEDULED_WEEKLY_CRON", "0 0 2 * * Sun"),
                retry_cron: env_string("SCHEDULED_RETRY_CRON", "0 0 */6 * * *"),
                health_cron: env_string("SCHEDULED_HEALTH_CRON", "0 0 * * * *"),
            },

            bulk: BulkSettings {
                max_concurrent_operations: env_or("BULK_MAX_CONCURRENT_OPERATIONS", 3),
                max_concurrent_checks: env_or("BULK_MAX_CONCURRENT_CHECKS", 5),
                default_rate_limit_ms: env_or("BULK_DEFAULT_RATE_LIMIT_MS", 1000),
                default_max_concurrent_downloads: env_or("BULK_DEFAULT_MAX_CONCURRENT_DOWNLOADS", 1),
                discovery_timeout_hours: env_or("BULK_DISCOVERY_TIMEOUT_HOURS", 2),
                stuck_operation_timeout_hours: env_or("BULK_STUCK_OPERATION_TIMEOUT_HOURS", 24),
                progress_update_interval_ms: env_or("BULK_PROGRESS_UPDATE_INTERVAL_MS", 5000),
                full_scan_fallback: env_or("BULK_FULL_SCAN_FALLBACK", true),
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            crawler: CrawlerSettings {
                base_url: "https://www.rechtsprechung-im-internet.de".to_string(),
                user_agent: "ecli-crawler/0.1".to_string(),
                rate_limit_ms: 1000,
                request_timeout_secs: 30,
            },
            storage: StorageSettings {
                base_path: PathBuf::from("./legal-documents"),
                storage_type: StorageType::Dual,
            },
            validation: ValidationSettings {
                schema_enabled: true,
                legal_doc_ml_enabled: true,
                ecli_enabled: true,
                strict_mode: false,
                async_validation: false,
                timeout_seconds: 30,
                max_size_mib: 10,
            },
            scheduled: ScheduleSettings {
                enabled: true,
                days_back: 7,
                daily_cron: "0 0 6 * * *".to_string(),
                weekly_cron: "0 0 2 * * Sun".to_string(),
                retry_cron: "0 0 */6 * * *".to_string(),
                health_cron: "0 0 * * * *".to_string(),
            },
            bulk: BulkSettings {
                max_concurrent_operations: 3,
                max_concurrent_checks: 5,
                default_rate_limit_ms: 1000,
                default_max_concurrent_downloads: 1,
                discovery_timeout_hours: 2,
                stuck_operation_timeout_hours: 24,
                progress_update_interval_ms: 5000,
                full_scan_fallback: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_type_parses_case_insensitively() {
        assert_eq!(StorageType::from_str_opt("Archive"), Some(StorageType::Archive));
        assert_eq!(StorageType::from_str_opt("SEARCH"), Some(StorageType::Search));
        assert_eq!(StorageType::from_str_opt("dual"), Some(StorageType::Dual));
        assert_eq!(StorageType::from_str_opt("solr"), None);
    }

    #[test]
    fn defaults_are_polite() {
        let config = Config::default();
        assert!(config.crawler.rate_limit_ms >= 1000);
        assert_eq!(config.bulk.default_max_concurrent_downloads, 1);
        assert_eq!(config.validation.max_size_mib, 10);
    }
}
