use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use secrecy::SecretString;

use tome_core::context::GenerationOptions;
use tome_engine::config::EngineConfig;
use tome_engine::pacing::PacingPolicy;
use tome_llm::gemini::DEFAULT_MODEL;

pub const DEFAULT_PORT: u16 = 9092;

/// Process configuration, read from `TOME_*` environment variables.
pub struct AppConfig {
    pub api_key: Option<SecretString>,
    pub model: String,
    pub data_dir: PathBuf,
    pub jobs_root: PathBuf,
    pub port: u16,
    pub temperature: f64,
    pub pacing: PacingPolicy,
    pub streaming: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let data_dir = var("TOME_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".tome"));
        let jobs_root = var("TOME_JOBS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("jobs"));

        let port = match var("TOME_PORT") {
            Some(raw) => raw.parse().with_context(|| format!("TOME_PORT={raw}"))?,
            None => DEFAULT_PORT,
        };
        let temperature = match var("TOME_TEMPERATURE") {
            Some(raw) => raw.parse().with_context(|| format!("TOME_TEMPERATURE={raw}"))?,
            None => 1.0,
        };
        let pacing = match var("TOME_PACING") {
            Some(raw) => raw.parse().map_err(|e: String| anyhow!("TOME_PACING: {e}"))?,
            None => PacingPolicy::default(),
        };
        let streaming = match var("TOME_STREAMING") {
            Some(raw) => parse_bool(&raw).with_context(|| format!("TOME_STREAMING={raw}"))?,
            None => true,
        };

        Ok(Self {
            api_key: var("GOOGLE_API_KEY").map(SecretString::from),
            model: var("TOME_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            data_dir,
            jobs_root,
            port,
            temperature,
            pacing,
            streaming,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("tome.db")
    }

    pub fn log_db_path(&self) -> PathBuf {
        self.data_dir.join("logs.db")
    }

    pub fn require_api_key(&self) -> Result<SecretString> {
        self.api_key
            .clone()
            .ok_or_else(|| anyhow!("GOOGLE_API_KEY is not set"))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            options: GenerationOptions {
                temperature: Some(self.temperature),
                max_output_tokens: None,
            },
            pacing: self.pacing.clone(),
            streaming: self.streaming,
            ..EngineConfig::default()
        }
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("expected a boolean, got {other:?}")),
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
