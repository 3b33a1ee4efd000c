//! Payloads exchanged across the engine boundary.
//!
//! Every foreign function takes and returns UTF-8 JSON text. This module gives
//! each operation a typed request/response pair:
//! - [`InitRequest`] / [`SystemStatus`]
//! - [`TokenizeRequest`] / [`TokenizeResult`]
//! - [`CompletionRequest`] / [`CompletionResult`]
//! - [`CompletionUpdate`] / [`AsyncPollResult`] for the async protocol
//! - [`RpcRequest`] for the generic passthrough
//! - [`StateRequest`] / [`StateResult`] for save/load
//!
//! - [`chatml`]: ChatML prompt helpers

pub mod chatml;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Model configuration sent to `init` / `init_async`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitRequest {
    /// Path to the GGUF model file.
    pub model: PathBuf,

    /// Number of layers to offload to the GPU.
    pub n_gpu_layers: i32,

    /// Memory-map the model file instead of reading it.
    pub use_mmap: bool,

    /// Context size in tokens.
    pub ctx_size: u32,

    /// Flash attention.
    #[serde(default, rename = "fa", skip_serializing_if = "Option::is_none")]
    pub flash_attention: Option<bool>,

    /// Chat template identifier (e.g. "chatml", "llama3").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<String>,
}

impl InitRequest {
    /// Layer count meaning "offload everything".
    pub const ALL_GPU_LAYERS: i32 = 1000;

    /// Default context size.
    pub const DEFAULT_CTX_SIZE: u32 = 8192;

    /// CPU-only parameters for the given model.
    pub fn new(model: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            n_gpu_layers: 0,
            use_mmap: false,
            ctx_size: Self::DEFAULT_CTX_SIZE,
            flash_attention: Some(false),
            chat_template: None,
        }
    }

    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.n_gpu_layers = if gpu { Self::ALL_GPU_LAYERS } else { 0 };
        self
    }

    pub fn with_ctx_size(mut self, ctx_size: u32) -> Self {
        self.ctx_size = ctx_size;
        self
    }

    pub fn with_flash_attention(mut self, enabled: Option<bool>) -> Self {
        self.flash_attention = enabled;
        self
    }

    pub fn with_chat_template(mut self, template: impl Into<String>) -> Self {
        self.chat_template = Some(template.into());
        self
    }

    /// Whether the model path refers to an existing file.
    pub fn model_exists(&self) -> bool {
        self.model.is_file()
    }
}

/// Snapshot returned by `poll_system_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// 1 once a model is fully loaded, 0 otherwise.
    pub init_success: i32,

    /// Load progress in [0, 1].
    #[serde(default)]
    pub loading_progress: f64,

    /// Model path, echoed back once loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<PathBuf>,

    /// Engine-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SystemStatus {
    pub fn unloaded() -> Self {
        Self {
            init_success: 0,
            loading_progress: 0.0,
            model: None,
            extra: Map::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.init_success == 1 && self.loading_progress >= 1.0
    }

    /// Ready and serving the given model file.
    pub fn is_serving(&self, model: &Path) -> bool {
        self.is_ready() && self.model.as_deref() == Some(model)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizeRequest {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizeResult {
    pub success: bool,
    pub length: usize,
    pub tokens: Vec<String>,
}

impl TokenizeResult {
    /// `length` agrees with the token list.
    pub fn is_consistent(&self) -> bool {
        self.length == self.tokens.len()
    }
}

/// Prompt plus sampling options.
///
/// Only the options this crate reads are named; everything else the engine
/// understands passes through `options` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,

    /// Maximum tokens to generate.
    #[serde(default, alias = "max_tokens", skip_serializing_if = "Option::is_none")]
    pub n_predict: Option<i32>,

    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Greedy sampling with a fixed seed.
    pub fn deterministic(mut self, seed: i64) -> Self {
        self.temperature = Some(0.0);
        self.seed = Some(seed);
        self
    }

    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop.push(stop.into());
        self
    }

    pub fn with_n_predict(mut self, n_predict: i32) -> Self {
        self.n_predict = Some(n_predict);
        self
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Eos,
    Limit,
    Word,
    /// No stop flag set; only legitimate after a cancel.
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Eos => write!(f, "eos"),
            StopReason::Limit => write!(f, "limit"),
            StopReason::Word => write!(f, "word"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Resolve the three stop flags into one reason.
///
/// Returns `None` when more than one flag is set.
fn stop_reason(eos: bool, limit: bool, word: bool) -> Option<StopReason> {
    match (eos, limit, word) {
        (true, false, false) => Some(StopReason::Eos),
        (false, true, false) => Some(StopReason::Limit),
        (false, false, true) => Some(StopReason::Word),
        (false, false, false) => Some(StopReason::Cancelled),
        _ => None,
    }
}

/// Full result of a blocking `get_completion`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub content: String,

    #[serde(default)]
    pub stop: bool,

    #[serde(default)]
    pub stopped_eos: bool,

    #[serde(default)]
    pub stopped_limit: bool,

    #[serde(default)]
    pub stopped_word: bool,

    #[serde(default)]
    pub stopping_word: String,

    #[serde(default)]
    pub tokens_predicted: usize,

    #[serde(default)]
    pub tokens_evaluated: usize,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CompletionResult {
    pub fn stop_reason(&self) -> Option<StopReason> {
        stop_reason(self.stopped_eos, self.stopped_limit, self.stopped_word)
    }
}

/// One incremental chunk of an async completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionUpdate {
    pub content: String,

    #[serde(default)]
    pub status: u16,

    #[serde(default)]
    pub stop: bool,

    #[serde(default)]
    pub stopped_eos: bool,

    #[serde(default)]
    pub stopped_limit: bool,

    #[serde(default)]
    pub stopped_word: bool,
}

impl CompletionUpdate {
    /// A content chunk.
    pub fn chunk(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: 200,
            ..Self::default()
        }
    }

    /// The empty terminal update for the given reason.
    pub fn terminal(reason: StopReason) -> Self {
        Self {
            content: String::new(),
            status: 200,
            stop: true,
            stopped_eos: reason == StopReason::Eos,
            stopped_limit: reason == StopReason::Limit,
            stopped_word: reason == StopReason::Word,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stop && self.content.is_empty()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        stop_reason(self.stopped_eos, self.stopped_limit, self.stopped_word)
    }
}

/// Result of one `async_completion_poll`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AsyncPollResult {
    #[serde(default)]
    pub completion_updates: Vec<CompletionUpdate>,

    #[serde(default)]
    pub finished: bool,

    /// Only present on the terminal poll.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// Acknowledgement of `async_completion_init` / `async_completion_cancel`.
///
/// The engine defines its shape; it is kept as an opaque object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AsyncAck(pub Map<String, Value>);

/// Generic `rpc_call` passthrough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub path: String,
    /// JSON-encoded inner body.
    pub body: String,
}

/// Chat message (OpenAI / ChatML shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionBody {
    pub messages: Vec<ChatMessage>,
}

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

impl RpcRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>, body: &Value) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            body: body.to_string(),
        }
    }

    /// `POST /v1/chat/completions` with the given messages.
    pub fn chat(messages: Vec<ChatMessage>) -> serde_json::Result<Self> {
        let body = serde_json::to_string(&ChatCompletionBody { messages })?;
        Ok(Self {
            method: "POST".to_string(),
            path: CHAT_COMPLETIONS_PATH.to_string(),
            body,
        })
    }
}

/// Request for `save_state` / `load_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRequest {
    pub filename: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateResult {
    pub success: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Engine-side failure carried as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineRejection {
    pub error: Value,
}

impl EngineRejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: Value::String(message.into()),
        }
    }

    /// Best-effort human-readable message.
    pub fn message(&self) -> String {
        match &self.error {
            Value::String(s) => s.clone(),
            Value::Object(obj) => obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| self.error.to_string()),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for EngineRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// A decoded engine response: either the expected payload or a rejection.
///
/// Rejections are tried first so that any object carrying an `error` key is
/// never mistaken for a (lenient) success payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Reply<T> {
    Rejected(EngineRejection),
    Ok(T),
}

impl<T> Reply<T> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Reply::Rejected(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Reply::Ok(v) => Some(v),
            Reply::Rejected(_) => None,
        }
    }

    pub fn into_result(self) -> Result<T, EngineRejection> {
        match self {
            Reply::Ok(v) => Ok(v),
            Reply::Rejected(r) => Err(r),
        }
    }
}
