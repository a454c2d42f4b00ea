use std::env;
use std::path::PathBuf;

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Runtime configuration, sourced from .env / environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub driver_url: String,
    pub vision_url: String,
    /// Per-attempt retry budget for transient step operations.
    pub step_retries: u64,
    /// Fixed delay between step retry attempts.
    pub retry_delay_ms: u64,
    /// Probe window for IF_VISIBLE branches.
    pub if_visible_timeout_ms: u64,
    /// Window in which a human may complete a step manually.
    pub manual_window_ms: u64,
    /// Default wait budget for WAIT_TEXT / WAIT_OTP.
    pub wait_timeout_ms: u64,
    /// Interpreter cycle ceiling (guards unbounded GOTO loops).
    pub max_cycles: u64,
    /// Scroll attempts while validating visibility of a remembered element.
    pub visibility_scrolls: u64,
    pub store_dir: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl AgentConfig {
    pub fn load() -> Self {
        dotenv::dotenv().ok();

        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mobile_app_agent");

        Self {
            driver_url: env_str("AGENT_DRIVER_URL", "http://127.0.0.1:6790"),
            vision_url: env_str("AGENT_VISION_URL", "http://127.0.0.1:6791"),
            step_retries: env_u64("AGENT_STEP_RETRIES", 2),
            retry_delay_ms: env_u64("AGENT_RETRY_DELAY_MS", 500),
            if_visible_timeout_ms: env_u64("AGENT_IF_VISIBLE_TIMEOUT_MS", 2500),
            manual_window_ms: env_u64("AGENT_MANUAL_WINDOW_MS", 12_000),
            wait_timeout_ms: env_u64("AGENT_WAIT_TIMEOUT_MS", 15_000),
            max_cycles: env_u64("AGENT_MAX_CYCLES", 1000),
            visibility_scrolls: env_u64("AGENT_VISIBILITY_SCROLLS", 3),
            store_dir: env::var("AGENT_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| base.join("store")),
            artifacts_dir: env::var("AGENT_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| base.join("runs")),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::load()
    }
}
