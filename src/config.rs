//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use serde::Deserialize;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0), // Bind to 0.0.0.0 for Docker
            port: 3000,
        }
    }
}

/// A PostgreSQL connection
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_pool_size: usize,
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// OpenAI-compatible generation endpoint
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Width of the per-node worker pool
    pub max_concurrency: usize,
    pub generation_timeout_secs: u64,
    /// Attempts per glossary term in the SQL repair loop
    pub glossary_max_attempts: u32,
    /// Results below this confidence raise a question
    pub question_confidence_threshold: f64,
    /// A node fails when more than this share of its items fail
    pub max_item_failure_ratio: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            generation_timeout_secs: 60,
            glossary_max_attempts: 3,
            question_confidence_threshold: 0.6,
            max_item_failure_ratio: 0.25,
        }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue("PIPELINE_MAX_CONCURRENCY must be at least 1".to_string()));
        }
        if self.glossary_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "PIPELINE_GLOSSARY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("PIPELINE_QUESTION_CONFIDENCE", self.question_confidence_threshold),
            ("PIPELINE_MAX_FAILURE_RATIO", self.max_item_failure_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue(format!("{} must be between 0 and 1", name)));
            }
        }
        Ok(())
    }
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    /// Metadata store; in-memory when absent
    pub database: Option<DatabaseConfig>,
    /// Database being described; read-only
    pub target: Option<DatabaseConfig>,
    pub cors: CorsConfig,
    pub generation: Option<GenerationConfig>,
    pub pipeline: PipelineConfig,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: env_parse("HOST").unwrap_or_else(|| ServerConfig::default().host),
            port: env_parse("PORT").unwrap_or_else(|| ServerConfig::default().port),
        };

        let max_pool_size = env_parse("DB_MAX_CONNECTIONS").unwrap_or(10);
        let database = std::env::var("DATABASE_URL")
            .ok()
            .map(|url| Self::parse_database_url(&url, max_pool_size))
            .transpose()?;
        let target = std::env::var("TARGET_DATABASE_URL")
            .ok()
            .map(|url| Self::parse_database_url(&url, max_pool_size))
            .transpose()?;

        let cors = CorsConfig {
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            max_concurrency: env_parse("PIPELINE_MAX_CONCURRENCY").unwrap_or(defaults.max_concurrency),
            generation_timeout_secs: env_parse("GENERATION_TIMEOUT_SECS")
                .unwrap_or(defaults.generation_timeout_secs),
            glossary_max_attempts: env_parse("PIPELINE_GLOSSARY_MAX_ATTEMPTS")
                .unwrap_or(defaults.glossary_max_attempts),
            question_confidence_threshold: env_parse("PIPELINE_QUESTION_CONFIDENCE")
                .unwrap_or(defaults.question_confidence_threshold),
            max_item_failure_ratio: env_parse("PIPELINE_MAX_FAILURE_RATIO")
                .unwrap_or(defaults.max_item_failure_ratio),
        };
        pipeline.validate()?;

        let generation = match std::env::var("GENERATION_BASE_URL") {
            Ok(base_url) => {
                url::Url::parse(&base_url).map_err(|_| {
                    ConfigError::InvalidValue("Invalid GENERATION_BASE_URL (expected http(s)://...)".to_string())
                })?;
                Some(GenerationConfig {
                    base_url,
                    api_key: std::env::var("GENERATION_API_KEY").ok(),
                    model: std::env::var("GENERATION_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                    timeout_secs: pipeline.generation_timeout_secs,
                })
            }
            Err(_) => None,
        };

        Ok(Self {
            server,
            database,
            target,
            cors,
            generation,
            pipeline,
        })
    }

    /// Check a connection string (postgresql://...)
    fn parse_database_url(url: &str, max_pool_size: usize) -> Result<DatabaseConfig, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue("Invalid database URL format (expected postgresql://...)".to_string())
        })?;
        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            return Err(ConfigError::InvalidValue(format!(
                "Unsupported database scheme: {}",
                parsed.scheme()
            )));
        }
        if parsed.host_str().is_none() {
            return Err(ConfigError::InvalidValue("Missing host in database URL".to_string()));
        }
        Ok(DatabaseConfig {
            url: url.to_string(),
            max_pool_size,
        })
    }
}
