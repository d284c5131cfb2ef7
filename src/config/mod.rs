use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub agent: AgentConfig,
    pub connection: ConnectionConfig,
    pub throttle: ThrottleConfig,
    pub breaker: BreakerConfig,
    pub investigation: InvestigationConfig,
    pub compression: CompressionConfig,
    pub llm: LlmConfig,
    pub request: RequestConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Remote agent endpoint configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub base_url: String,
}

/// Push connection timings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub stale_after_ms: u64,
    pub probe_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

/// Progress throttling windows
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub window_ms: u64,
    pub clear_after_ms: u64,
}

/// Per-tool circuit breaker settings
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

/// Investigation loop budget and timeouts
#[derive(Debug, Clone)]
pub struct InvestigationConfig {
    pub base_iterations: u32,
    pub max_iterations: u32,
    pub min_useful_results: usize,
    pub unproductive_limit: u32,
    pub tool_timeout_ms: u64,
    pub iteration_timeout_ms: u64,
    pub llm_timeout_ms: u64,
    pub total_timeout_ms: u64,
    /// Extra evidence patterns appended to the built-in rule set
    pub evidence_patterns: Vec<String>,
}

/// Tool history compression settings
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub keep_detailed: usize,
    pub max_summary_chars: usize,
}

/// LLM pipe configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub pipe: String,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let agent = AgentConfig {
            base_url: env::var("AGENT_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8765".to_string()),
        };
        validate_url("AGENT_BASE_URL", &agent.base_url)?;

        let connection = ConnectionConfig {
            connect_timeout_ms: env_or("CONNECT_TIMEOUT_MS", 20_000),
            health_check_interval_ms: env_or("HEALTH_CHECK_INTERVAL_MS", 10_000),
            stale_after_ms: env_or("STALE_AFTER_MS", 45_000),
            probe_timeout_ms: env_or("HEALTH_PROBE_TIMEOUT_MS", 3_000),
            backoff_initial_ms: env_or("BACKOFF_INITIAL_MS", 1_000),
            backoff_max_ms: env_or("BACKOFF_MAX_MS", 30_000),
        };

        let throttle = ThrottleConfig {
            window_ms: env_or("PROGRESS_WINDOW_MS", 500),
            clear_after_ms: env_or("PROGRESS_CLEAR_MS", 2_000),
        };
        for (key, value) in [
            ("HEALTH_CHECK_INTERVAL_MS", connection.health_check_interval_ms),
            ("BACKOFF_INITIAL_MS", connection.backoff_initial_ms),
            ("PROGRESS_WINDOW_MS", throttle.window_ms),
        ] {
            require_positive(key, value)?;
        }

        let breaker = BreakerConfig {
            failure_threshold: env_or("BREAKER_FAILURE_THRESHOLD", 3),
            cooldown_ms: env_or("BREAKER_COOLDOWN_MS", 30_000),
        };

        let investigation = InvestigationConfig {
            base_iterations: env_or("INVESTIGATION_BASE_ITERATIONS", 10),
            max_iterations: env_or("INVESTIGATION_MAX_ITERATIONS", 16),
            min_useful_results: env_or("INVESTIGATION_MIN_USEFUL", 2),
            unproductive_limit: env_or("INVESTIGATION_UNPRODUCTIVE_LIMIT", 3),
            tool_timeout_ms: env_or("TOOL_TIMEOUT_MS", 60_000),
            iteration_timeout_ms: env_or("ITERATION_TIMEOUT_MS", 180_000),
            llm_timeout_ms: env_or("LLM_TIMEOUT_MS", 120_000),
            total_timeout_ms: env_or("INVESTIGATION_TIMEOUT_MS", 600_000),
            evidence_patterns: env::var("EVIDENCE_PATTERNS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        };
        if investigation.base_iterations > investigation.max_iterations {
            return Err(AppError::Config {
                message: format!(
                    "INVESTIGATION_BASE_ITERATIONS ({}) exceeds INVESTIGATION_MAX_ITERATIONS ({})",
                    investigation.base_iterations, investigation.max_iterations
                ),
            });
        }

        let compression = CompressionConfig {
            keep_detailed: env_or("HISTORY_KEEP_DETAILED", 4),
            max_summary_chars: env_or("HISTORY_MAX_SUMMARY_CHARS", 200),
        };

        let llm = LlmConfig {
            base_url: env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
            api_key: env::var("LLM_API_KEY").ok().filter(|k| !k.is_empty()),
            pipe: env::var("LLM_PIPE").unwrap_or_else(|_| "cluster-triage-v1".to_string()),
        };
        validate_url("LLM_BASE_URL", &llm.base_url)?;

        let request = RequestConfig {
            timeout_ms: env_or("REQUEST_TIMEOUT_MS", 30_000),
            max_retries: env_or("MAX_RETRIES", 3),
            retry_delay_ms: env_or("RETRY_DELAY_MS", 1_000),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/triage.db".to_string()),
            ),
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        Ok(Config {
            agent,
            connection,
            throttle,
            breaker,
            investigation,
            compression,
            llm,
            request,
            database,
            logging,
        })
    }
}

fn require_positive(key: &str, value: u64) -> Result<(), AppError> {
    if value == 0 {
        return Err(AppError::Config {
            message: format!("{} must be greater than zero", key),
        });
    }
    Ok(())
}

fn validate_url(key: &str, url: &str) -> Result<(), AppError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(AppError::Config {
            message: format!("{} must be an http(s) URL, got '{}'", key, url),
        })
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 20_000,
            health_check_interval_ms: 10_000,
            stale_after_ms: 45_000,
            probe_timeout_ms: 3_000,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

impl ConnectionConfig {
    /// Establishment timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Health check period as Duration.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Silence threshold as Duration.
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Liveness probe timeout as Duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window_ms: 500,
            clear_after_ms: 2_000,
        }
    }
}

impl ThrottleConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn clear_after(&self) -> Duration {
        Duration::from_millis(self.clear_after_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    /// Cooldown as Duration.
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self {
            base_iterations: 10,
            max_iterations: 16,
            min_useful_results: 2,
            unproductive_limit: 3,
            tool_timeout_ms: 60_000,
            iteration_timeout_ms: 180_000,
            llm_timeout_ms: 120_000,
            total_timeout_ms: 600_000,
            evidence_patterns: Vec::new(),
        }
    }
}

impl InvestigationConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_millis(self.iteration_timeout_ms)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            keep_detailed: 4,
            max_summary_chars: 200,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(20));
        assert_eq!(config.health_check_interval(), Duration::from_secs(10));
        assert_eq!(config.stale_after(), Duration::from_secs(45));
        assert_eq!(config.probe_timeout(), Duration::from_secs(3));
        assert_eq!(config.backoff_initial(), Duration::from_secs(1));
        assert_eq!(config.backoff_max(), Duration::from_secs(30));
    }

    #[test]
    fn test_investigation_defaults() {
        let config = InvestigationConfig::default();
        assert_eq!(config.base_iterations, 10);
        assert_eq!(config.max_iterations, 16);
        assert_eq!(config.min_useful_results, 2);
        assert!(config.evidence_patterns.is_empty());
    }

    #[test]
    fn test_breaker_and_throttle_defaults() {
        assert_eq!(BreakerConfig::default().cooldown(), Duration::from_secs(30));
        assert_eq!(BreakerConfig::default().failure_threshold, 3);
        assert_eq!(ThrottleConfig::default().window(), Duration::from_millis(500));
        assert_eq!(ThrottleConfig::default().clear_after(), Duration::from_secs(2));
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("X", "http://localhost:8765").is_ok());
        assert!(validate_url("X", "https://agent.example.com").is_ok());
        let err = validate_url("X", "localhost:8765").unwrap_err();
        assert!(err.to_string().contains("X must be an http(s) URL"));
    }
}
