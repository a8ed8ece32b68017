use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StrandError};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound on node executions in a single run.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Whether multi-call tool nodes dispatch their calls concurrently.
    #[serde(default = "default_parallel_tools")]
    pub parallel_tools: bool,
    /// Capacity of the broadcast event bus used by trace subscribers.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            parallel_tools: default_parallel_tools(),
            event_bus_capacity: default_event_bus_capacity(),
            system_prompt: None,
        }
    }
}

fn default_max_iterations() -> usize { 50 }
fn default_parallel_tools() -> bool { true }
fn default_event_bus_capacity() -> usize { 256 }

/// Model selection passed through to the `LlmClient`. The engine does not
/// validate these values; that is the client's concern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: "mock".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Timeout applied when a tool does not pick its own.
    #[serde(default = "default_tool_timeout")]
    pub default_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_tool_timeout(),
        }
    }
}

fn default_tool_timeout() -> u64 { 30 }

/// Trace feature configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory for JSONL run logs. Unset disables the file writer.
    #[serde(default)]
    pub jsonl_dir: Option<String>,
    /// Mirror trace messages into `tracing` at info level.
    #[serde(default = "default_log_messages")]
    pub log_messages: bool,
}

fn default_log_messages() -> bool { true }

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            jsonl_dir: None,
            log_messages: default_log_messages(),
        }
    }
}

impl TraceConfig {
    /// Resolve the JSONL directory (expand ~).
    pub fn jsonl_dir(&self) -> Option<PathBuf> {
        self.jsonl_dir.as_deref().map(expand_home)
    }
}

/// Persistence feature configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Save a checkpoint before every node execution.
    #[serde(default = "default_auto_checkpoint")]
    pub auto_checkpoint: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            auto_checkpoint: default_auto_checkpoint(),
        }
    }
}

fn default_auto_checkpoint() -> bool { true }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StrandError::ConfigNotFound(path.display().to_string()))?;
        debug!(path = %path.display(), "Loading engine config");
        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| StrandError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.agent.max_iterations == 0 {
            return Err(StrandError::Config(
                "agent.max_iterations must be at least 1".into(),
            ));
        }
        if self.agent.event_bus_capacity == 0 {
            return Err(StrandError::Config(
                "agent.event_bus_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    warn!(var = %var_name, "Config references unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
