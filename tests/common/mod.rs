//! Shared harness for the engine contract tests.
//!
//! Tests run against the in-process stub engine by default. Set
//! `LLM_ENGINE_LIB` to a compiled engine library to run them against the real
//! thing; the model is then taken from `TEST_MODEL` (a path, or "large"), or
//! looked up by name in `LLM_MODEL_DIR` and `local_test_llms/`.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use llm_rpc_shim::config::PollingConfig;
use llm_rpc_shim::protocol::InitRequest;
use llm_rpc_shim::transport::{EngineBackend, MockEngine, MockTiming, NativeLibrary};
use llm_rpc_shim::EngineSession;
use regex::Regex;

pub const MODEL_LARGE: &str = "openhermes-2.5-mistral-7b.Q4_K_M.gguf";
pub const MODEL_SMALL: &str = "tinyllama-1.1b-1t-openorca.Q4_K_M.gguf";
const LOCAL_MODEL_DIR: &str = "local_test_llms";

pub const HERMES_SYSMSG: &str = "You are a helpful, honest, reliable and smart AI assistant named Hermes doing your best at fulfilling user requests. You are cool and extremely loyal. You answer any user requests to the best of your ability.";

pub const COUNT_PROMPT: &str = "count from 1 to 3, output only the numbers";
pub const COUNT_PROMPT_ELI5: &str =
    "This is a test. Count from 1 to 3 like a kindergartener, output only the numbers";

/// The engine holds one model per process; tests take turns.
static ENGINE_LOCK: Mutex<()> = Mutex::new(());

pub struct Harness {
    pub session: EngineSession,
    pub model: PathBuf,
    pub polling: PollingConfig,
    _model_file: Option<tempfile::NamedTempFile>,
    // Declared last so the engine is released before the next test starts.
    _guard: MutexGuard<'static, ()>,
}

impl Harness {
    /// Session with nothing loaded.
    pub fn new() -> Self {
        let guard = ENGINE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

        match std::env::var_os("LLM_ENGINE_LIB") {
            Some(lib) => {
                let backend: Arc<dyn EngineBackend> =
                    Arc::new(NativeLibrary::open(PathBuf::from(lib)).unwrap());
                Self {
                    session: EngineSession::new(backend),
                    model: native_model(),
                    polling: PollingConfig {
                        interval_ms: 100,
                        timeout_secs: 10,
                        stall_secs: 30,
                    },
                    _model_file: None,
                    _guard: guard,
                }
            }
            None => {
                let file = tempfile::Builder::new()
                    .suffix(".gguf")
                    .tempfile()
                    .unwrap();
                Self {
                    session: EngineSession::new(Arc::new(MockEngine::new(MockTiming::fast()))),
                    model: file.path().to_path_buf(),
                    polling: PollingConfig {
                        interval_ms: 2,
                        timeout_secs: 10,
                        stall_secs: 5,
                    },
                    _model_file: Some(file),
                    _guard: guard,
                }
            }
        }
    }

    /// Session with the model under test loaded.
    pub fn loaded() -> Self {
        let mut h = Self::new();
        h.load_model(2048);
        h
    }

    pub fn init_request(&self, ctx_size: u32) -> InitRequest {
        InitRequest::new(&self.model).with_ctx_size(ctx_size)
    }

    /// Load synchronously and check the status echoes the model back.
    pub fn load_model(&mut self, ctx_size: u32) {
        let request = self.init_request(ctx_size);
        assert!(self.session.init(&request).unwrap());
        let status = self.session.poll_system_status().unwrap();
        assert_eq!(status.init_success, 1);
        assert_eq!(status.loading_progress, 1.0);
        assert_eq!(status.model.as_deref(), Some(self.model.as_path()));
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.session.deinit();
    }
}

fn native_model() -> PathBuf {
    let test_model = std::env::var("TEST_MODEL").unwrap_or_default();
    if Path::new(&test_model).is_file() {
        return PathBuf::from(test_model);
    }
    let wanted = if test_model.eq_ignore_ascii_case("large") {
        MODEL_LARGE
    } else {
        MODEL_SMALL
    };
    let model_dir = std::env::var("LLM_MODEL_DIR").unwrap_or_else(|_| "..".to_string());
    [PathBuf::from(model_dir), PathBuf::from(LOCAL_MODEL_DIR)]
        .iter()
        .map(|dir| dir.join(wanted))
        .find(|p| p.is_file())
        .unwrap_or_else(|| panic!("model {wanted} not found; set TEST_MODEL or LLM_MODEL_DIR"))
}

/// "1 2 3" or "1, 2, 3" somewhere in the text.
pub fn assert_counts_to_three(text: &str) {
    let re = Regex::new(r"1\s+2\s+3|1\s*,\s*2,\s*3").unwrap();
    assert!(re.is_match(text), "expected a count to three, got {text:?}");
}
