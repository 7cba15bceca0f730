//! Batch run configuration
//!
//! CLI flags override environment variables; values are resolved once per
//! run and passed explicitly through the dispatcher so every call is
//! testable without ambient state.

use crate::error::{NominaError, Result};
use crate::resolve::MissingFieldPolicy;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-5";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_WORKERS: usize = 4;

/// Everything one batch run needs, resolved up front.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub input_schema: PathBuf,
    pub result_schema: PathBuf,
    pub model: String,
    pub base_url: String,
    pub api_key: String,
    pub workers: usize,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub policy: MissingFieldPolicy,
    pub deterministic: bool,
}

impl BatchConfig {
    /// Sampling temperature for the computation request. Deterministic mode
    /// pins it to zero for reproducible reruns.
    pub fn temperature(&self) -> f32 {
        if self.deterministic {
            0.0
        } else {
            0.2
        }
    }
}

/// Model id: explicit flag wins, then `NOMINA_MODEL`, then `OPENAI_MODEL`,
/// then the built-in default.
pub fn resolve_model(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("NOMINA_MODEL").ok())
        .or_else(|| std::env::var("OPENAI_MODEL").ok())
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_MODEL.to_string())
}

/// Endpoint base URL: flag, then `NOMINA_BASE_URL`, then the public default.
pub fn resolve_base_url(flag: Option<String>) -> String {
    let url = flag
        .or_else(|| std::env::var("NOMINA_BASE_URL").ok())
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    url.trim_end_matches('/').to_string()
}

/// API key comes from the environment only; a run without one cannot
/// proceed.
pub fn resolve_api_key() -> Result<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| NominaError::config("OPENAI_API_KEY is not set"))
}
