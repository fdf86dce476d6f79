use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub predictor: PredictorConfig,
    #[serde(default)]
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictorConfig {
    /// Cap on markets evaluated per run
    #[serde(default = "default_max_markets")]
    pub max_markets: usize,
    /// Listing pages fetched when looking for sports markets
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Weight of the historical stage in the weighted-average hybrid
    #[serde(default = "default_hybrid_weight")]
    pub hybrid_weight: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScorerConfig {
    #[serde(default = "default_score_limit")]
    pub limit: usize,
    #[serde(default = "default_score_max_pages")]
    pub max_pages: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    #[serde(default = "default_prepared_dir")]
    pub prepared_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Attempts per request, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_api_cache_dir")]
    pub api_cache_dir: PathBuf,
}

fn default_max_markets() -> usize { 50 }
fn default_max_pages() -> usize { 3 }
fn default_hybrid_weight() -> f64 { 0.5 }
fn default_score_limit() -> usize { 100 }
fn default_score_max_pages() -> usize { 10 }
fn default_model_dir() -> PathBuf { PathBuf::from("artifacts/models") }
fn default_prepared_dir() -> PathBuf { PathBuf::from("artifacts/prepared_data") }
fn default_request_timeout() -> u64 { 30 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_base_delay() -> u64 { 1000 }
fn default_page_size() -> usize { 100 }
fn default_database_path() -> PathBuf { PathBuf::from("artifacts/local_db/predictions.db") }
fn default_api_cache_dir() -> PathBuf { PathBuf::from("artifacts/api_cache") }

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            max_markets: default_max_markets(),
            max_pages: default_max_pages(),
            hybrid_weight: default_hybrid_weight(),
        }
    }
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            limit: default_score_limit(),
            max_pages: default_score_max_pages(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            prepared_dir: default_prepared_dir(),
        }
    }
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            page_size: default_page_size(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { database_path: default_database_path() }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { api_cache_dir: default_api_cache_dir() }
    }
}

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub clob_api_url: String,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path` when it exists, otherwise run on built-in defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            tracing::info!("Config file {} not found, using defaults", path);
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        let w = self.predictor.hybrid_weight;
        if !(0.0..=1.0).contains(&w) {
            anyhow::bail!("predictor.hybrid_weight must be within [0, 1], got {}", w);
        }
        Ok(())
    }
}

impl EnvConfig {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            clob_api_url: std::env::var("CLOB_API_URL")
                .unwrap_or_else(|_| "https://clob.polymarket.com".to_string()),
            supabase_url: non_empty_var("SUPABASE_URL"),
            supabase_key: non_empty_var("SUPABASE_KEY"),
        })
    }

    /// Remote store credentials, if both are configured.
    pub fn supabase(&self) -> Option<(&str, &str)> {
        match (&self.supabase_url, &self.supabase_key) {
            (Some(url), Some(key)) => Some((url.as_str(), key.as_str())),
            _ => None,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
