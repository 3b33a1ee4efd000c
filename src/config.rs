//! Runtime configuration for the engine shim.
//!
//! Configuration is loaded from a JSON file or constructed programmatically;
//! missing fields fall back to defaults. Command-line arguments override the
//! file where both set the same knob.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::protocol::InitRequest;
use crate::transport::MockTiming;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "llm-rpc-shim", about = "Interactive shell over an LLM engine library")]
pub struct Cli {
    /// Path to the engine shared library (.so / .dylib / .dll).
    pub lib_path: Option<PathBuf>,

    /// Use the built-in stub engine instead of a shared library.
    #[arg(long, conflicts_with = "lib_path")]
    pub mock: bool,

    /// Shell commands to run after the library is loaded.
    #[arg(short, long)]
    pub bootstrap: Option<PathBuf>,

    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "rpcshell.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine library location.
    pub library: LibraryConfig,

    /// Defaults for model initialization.
    pub engine: EngineDefaults,

    /// Poll loop pacing and deadlines.
    pub polling: PollingConfig,

    /// Stub engine timing.
    pub mock: MockConfig,

    /// Interactive shell settings.
    pub shell: ShellConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Path to the engine shared library.
    pub path: Option<PathBuf>,
}

/// Knobs used to build an [`InitRequest`] when only a model path is given.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineDefaults {
    /// Context size in tokens.
    pub ctx_size: u32,

    /// Offload all layers to the GPU.
    pub gpu: bool,

    /// Flash attention (omitted from the request when unset).
    pub flash_attention: Option<bool>,

    /// Chat template identifier.
    pub chat_template: Option<String>,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            ctx_size: InitRequest::DEFAULT_CTX_SIZE,
            gpu: false,
            flash_attention: Some(false),
            chat_template: None,
        }
    }
}

impl EngineDefaults {
    pub fn init_request(&self, model: impl Into<PathBuf>) -> InitRequest {
        let request = InitRequest::new(model)
            .with_gpu(self.gpu)
            .with_ctx_size(self.ctx_size)
            .with_flash_attention(self.flash_attention);
        match &self.chat_template {
            Some(template) => request.with_chat_template(template.clone()),
            None => request,
        }
    }
}

/// Poll loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Sleep between polls in milliseconds.
    pub interval_ms: u64,

    /// Wall-clock deadline for a wait loop in seconds.
    pub timeout_secs: u64,

    /// Loading is considered failed when progress does not move for this long.
    pub stall_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            timeout_secs: 10,
            stall_secs: 5,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stall(&self) -> Duration {
        Duration::from_secs(self.stall_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    pub load_step_ms: u64,
    pub load_steps: u32,
    pub token_delay_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        let timing = MockTiming::default();
        Self {
            load_step_ms: timing.load_step.as_millis() as u64,
            load_steps: timing.load_steps,
            token_delay_ms: timing.token_delay.as_millis() as u64,
        }
    }
}

impl MockConfig {
    pub fn timing(&self) -> MockTiming {
        MockTiming {
            load_step: Duration::from_millis(self.load_step_ms),
            load_steps: self.load_steps,
            token_delay: Duration::from_millis(self.token_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// History file; defaults to `~/.rpcshell_history`.
    pub history_file: Option<PathBuf>,
}

pub const DEFAULT_HISTORY_FILE: &str = ".rpcshell_history";

impl ShellConfig {
    pub fn history_path(&self) -> Option<PathBuf> {
        self.history_file.clone().or_else(|| {
            BaseDirs::new().map(|dirs| dirs.home_dir().join(DEFAULT_HISTORY_FILE))
        })
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn merge_cli(mut self, cli: &Cli) -> Self {
        if let Some(path) = &cli.lib_path {
            self.library.path = Some(path.clone());
        }
        self
    }
}
