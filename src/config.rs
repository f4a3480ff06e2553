use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the enrollment gate
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EnrollmentGateConfig {
    /// Database settings, needed by store-backed commands
    pub database: Option<DatabaseConfig>,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Workflow engine tuning
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level, used when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkflowConfig {
    /// Bound of the outbound e-mail queue
    pub notification_queue_capacity: usize,
    /// Maximum categories kept in the chain cache
    pub chain_cache_capacity: u64,
    pub chain_cache_ttl_seconds: u64,
}

impl WorkflowConfig {
    pub fn chain_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.chain_cache_ttl_seconds)
    }
}

impl Default for EnrollmentGateConfig {
    fn default() -> Self {
        Self {
            database: Some(DatabaseConfig {
                url: "sqlite://enrollment-gate.db".to_string(),
                max_connections: 10,
                auto_migrate: true,
            }),
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: false,
            },
            workflow: WorkflowConfig {
                notification_queue_capacity: 256,
                chain_cache_capacity: 1_000,
                chain_cache_ttl_seconds: 300, // 5 minutes
            },
        }
    }
}

impl EnrollmentGateConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (enrollment-gate.toml)
    /// 3. Environment variables (ENROLLMENT_GATE__SECTION__KEY)
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Same as [`Self::load`], reading `path` instead of `enrollment-gate.toml`
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None => {
                if Path::new("enrollment-gate.toml").exists() {
                    builder = builder.add_source(File::with_name("enrollment-gate"));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("ENROLLMENT_GATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<EnrollmentGateConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = EnrollmentGateConfig::load_env_file();
        EnrollmentGateConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static EnrollmentGateConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}
