//! Configuration for llama-supervisor
//!
//! The config file is shared with the web console, which writes some keys in
//! camelCase. Those keys are accepted through serde aliases; the supervisor
//! only ever reads the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// API listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Ceiling on simultaneously running models
    #[serde(default = "default_max_concurrent_models", alias = "maxConcurrentModels")]
    pub max_concurrent_models: usize,

    /// Managed llama-server settings
    #[serde(default, alias = "llamaServer")]
    pub llama: LlamaServerConfig,

    /// Directory scanned for the analytics `storageUsed` figure
    #[serde(default = "default_log_dir", alias = "logDir")]
    pub log_dir: PathBuf,

    /// Number of log entries kept in memory
    #[serde(default = "default_log_capacity", alias = "logCapacity")]
    pub log_capacity: usize,

    /// Interval of the analytics SSE stream
    #[serde(default = "default_analytics_interval_secs")]
    pub analytics_interval_secs: u64,

    /// Interval of the system metrics sampler (0 to disable)
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,

    /// Start llama-server when the supervisor boots
    #[serde(default, alias = "autoStart")]
    pub auto_start: bool,

    /// Restart a crashed llama-server automatically
    #[serde(default, alias = "autoRestart")]
    pub auto_restart: RestartConfig,
}

/// Launch configuration for llama-server.
///
/// Numeric tuning fields use negative values (or zero, for sizes) to mean
/// "let llama-server pick its own default"; string fields use the empty
/// string. Every tuning field defaults to unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlamaServerConfig {
    pub host: String,
    pub port: u16,

    /// Single model file, passed as `-m`
    #[serde(alias = "modelPath")]
    pub model_path: Option<String>,

    /// Models directory, passed as `--models-dir` when no model file is set
    #[serde(alias = "basePath", alias = "models_path", alias = "modelsPath")]
    pub base_path: Option<PathBuf>,

    /// llama-server binary
    #[serde(alias = "serverPath", alias = "llama_server_path", alias = "llamaServerPath")]
    pub server_path: String,

    // -- context / batching --
    pub ctx_size: Option<i64>,
    pub batch_size: Option<i64>,
    pub ubatch_size: Option<i64>,
    pub parallel: Option<i64>,
    pub cont_batching: Option<bool>,

    // -- threading / offload --
    pub threads: Option<i64>,
    pub threads_batch: Option<i64>,
    pub gpu_layers: Option<i64>,
    pub main_gpu: Option<i64>,
    pub split_mode: Option<String>,
    pub tensor_split: Option<String>,
    pub n_cpu_moe: Option<i64>,
    pub flash_attn: Option<FlashAttn>,
    pub no_mmap: Option<bool>,
    pub mlock: Option<bool>,
    pub cache_type_k: Option<String>,
    pub cache_type_v: Option<String>,

    // -- sampling --
    pub n_predict: Option<i64>,
    pub seed: Option<i64>,
    pub temperature: Option<f64>,
    pub top_k: Option<i64>,
    pub top_p: Option<f64>,
    pub min_p: Option<f64>,
    pub repeat_penalty: Option<f64>,
    pub repeat_last_n: Option<i64>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub rope_freq_base: Option<f64>,
    pub rope_freq_scale: Option<f64>,

    // -- server --
    pub embedding: Option<bool>,
    pub jinja: Option<bool>,
    pub chat_template: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Option<i64>,
    pub models_max: Option<i64>,

    /// Extra arguments appended verbatim
    #[serde(alias = "serverArgs", alias = "custom_args")]
    pub server_args: Vec<String>,

    // -- supervision --
    pub startup_timeout_secs: u64,
    pub health_timeout_ms: u64,
    pub health_poll_interval_ms: u64,
    pub stop_timeout_secs: u64,
}

/// Flash attention mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashAttn {
    On,
    Off,
    #[default]
    Auto,
}

/// Automatic restart of a crashed llama-server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Give up after this many consecutive attempts
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: u32,

    /// Delay before the first attempt; doubled on every further attempt
    #[serde(default = "default_backoff_ms", alias = "backoffMs")]
    pub backoff_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            metrics_port: default_metrics_port(),
            max_concurrent_models: default_max_concurrent_models(),
            llama: LlamaServerConfig::default(),
            log_dir: default_log_dir(),
            log_capacity: default_log_capacity(),
            analytics_interval_secs: default_analytics_interval_secs(),
            metrics_interval_secs: default_metrics_interval_secs(),
            auto_start: false,
            auto_restart: RestartConfig::default(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_metrics_port() -> u16 {
    0
}

fn default_max_concurrent_models() -> usize {
    1
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_capacity() -> usize {
    1000
}

fn default_analytics_interval_secs() -> u64 {
    5
}

fn default_metrics_interval_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Warn about common misconfigurations.
    pub fn validate(&self) {
        use tracing::warn;

        let llama = &self.llama;
        if llama.model_path.is_some() && llama.base_path.is_some() {
            warn!("Both model_path and base_path are set; base_path is ignored for launch");
        }

        if let Some(ref base) = llama.base_path
            && !base.is_dir()
        {
            warn!(path = %base.display(), "base_path is not a directory");
        }

        if llama.port == self.port {
            warn!(
                port = self.port,
                "llama-server port equals the supervisor port; one of them will fail to bind"
            );
        }
    }
}

impl LlamaServerConfig {
    /// Base URL of the managed process
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.connect_host(), self.port)
    }

    /// Host to connect to. A wildcard bind address is reached via loopback.
    fn connect_host(&self) -> &str {
        match self.host.as_str() {
            "" | "0.0.0.0" => "127.0.0.1",
            "::" => "[::1]",
            other => other,
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Default for LlamaServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            model_path: None,
            base_path: None,
            server_path: "llama-server".to_string(),
            ctx_size: None,
            batch_size: None,
            ubatch_size: None,
            parallel: None,
            cont_batching: None,
            threads: None,
            threads_batch: None,
            gpu_layers: None,
            main_gpu: None,
            split_mode: None,
            tensor_split: None,
            n_cpu_moe: None,
            flash_attn: None,
            no_mmap: None,
            mlock: None,
            cache_type_k: None,
            cache_type_v: None,
            n_predict: None,
            seed: None,
            temperature: None,
            top_k: None,
            top_p: None,
            min_p: None,
            repeat_penalty: None,
            repeat_last_n: None,
            presence_penalty: None,
            frequency_penalty: None,
            rope_freq_base: None,
            rope_freq_scale: None,
            embedding: None,
            jinja: None,
            chat_template: None,
            api_key: None,
            timeout: None,
            models_max: None,
            server_args: Vec::new(),
            startup_timeout_secs: 120,
            health_timeout_ms: 2000,
            health_poll_interval_ms: 500,
            stop_timeout_secs: crate::service::STOP_TIMEOUT.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let json = r#"{
            "port": 3100,
            "maxConcurrentModels": 2,
            "llama": {
                "host": "0.0.0.0",
                "port": 8081,
                "modelsPath": "/models",
                "llamaServerPath": "/opt/llama/llama-server",
                "threads": -1,
                "gpu_layers": 20,
                "flash_attn": "off",
                "serverArgs": ["--verbose"]
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 3100);
        assert_eq!(config.max_concurrent_models, 2);
        assert_eq!(config.llama.port, 8081);
        assert_eq!(config.llama.base_path, Some(PathBuf::from("/models")));
        assert_eq!(config.llama.server_path, "/opt/llama/llama-server");
        assert_eq!(config.llama.threads, Some(-1));
        assert_eq!(config.llama.flash_attn, Some(FlashAttn::Off));
        assert_eq!(config.llama.server_args, vec!["--verbose"]);
        assert_eq!(config.llama.base_url(), "http://127.0.0.1:8081");
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_concurrent_models, 1);
        assert_eq!(config.llama.host, "127.0.0.1");
        assert_eq!(config.llama.port, 8080);
        assert_eq!(config.llama.server_path, "llama-server");
        assert_eq!(config.llama.stop_timeout(), Duration::from_secs(5));
        assert_eq!(config.analytics_interval_secs, 5);
        assert!(!config.auto_restart.enabled);
        assert_eq!(config.auto_restart.max_retries, 3);
    }

    #[test]
    fn test_partial_llama_section_keeps_defaults() {
        let json = r#"{ "llama": { "port": 9000 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.llama.port, 9000);
        assert_eq!(config.llama.host, "127.0.0.1");
        assert_eq!(config.llama.startup_timeout(), Duration::from_secs(120));
    }
}
