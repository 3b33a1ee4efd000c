//! In-process stub engine.
//!
//! Simulates the engine library's observable contract so the session layer,
//! the shell and the test suite can run without a compiled engine or a model:
//! background model loading with progress, whitespace tokenization,
//! deterministic generation, a single async completion slot with
//! cancellation, a chat-completions route for `rpc_call` and state files.
//!
//! Generation is scripted rather than sampled. An instruction like "count
//! from 1 to 3" yields `1 2 3` and stops on EOS; any other prompt yields
//! `token_0 token_1 ...` until the token limit.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{EngineBackend, TransportError};
use crate::protocol::chatml::{self, IM_END};
use crate::protocol::{
    AsyncPollResult, ChatCompletionBody, CompletionRequest, CompletionResult, CompletionUpdate,
    EngineRejection, InitRequest, RpcRequest, StateRequest, StopReason, SystemStatus,
    TokenizeRequest, TokenizeResult, CHAT_COMPLETIONS_PATH,
};

/// Tokens generated when the request sets no positive limit.
const DEFAULT_N_PREDICT: usize = 16;

/// Upper bound on how far the counting script will go.
const MAX_COUNT: u64 = 256;

/// Delays that make the stub behave like a slow native engine.
#[derive(Debug, Clone)]
pub struct MockTiming {
    /// Sleep between loading progress steps.
    pub load_step: Duration,

    /// Number of progress steps from 0.0 to 1.0.
    pub load_steps: u32,

    /// Sleep before each generated piece in async mode.
    pub token_delay: Duration,
}

impl Default for MockTiming {
    fn default() -> Self {
        Self {
            load_step: Duration::from_millis(50),
            load_steps: 10,
            token_delay: Duration::from_millis(20),
        }
    }
}

impl MockTiming {
    /// Short delays for tests.
    pub fn fast() -> Self {
        Self {
            load_step: Duration::from_millis(2),
            load_steps: 5,
            token_delay: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LoadPhase {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

struct AsyncJob {
    id: u64,
    pending: VecDeque<CompletionUpdate>,
    finished: bool,
    cancel: Arc<AtomicBool>,
}

struct EngineState {
    phase: LoadPhase,
    loading_progress: f64,
    model: Option<PathBuf>,
    ctx_size: u32,
    /// Bumped on every init/deinit so stale loader threads drop their results.
    load_generation: u64,
    job: Option<AsyncJob>,
    next_job_id: u64,
    /// Tokens evaluated by the last completion; what state files persist.
    n_past: usize,
}

impl EngineState {
    fn new() -> Self {
        Self {
            phase: LoadPhase::Unloaded,
            loading_progress: 0.0,
            model: None,
            ctx_size: 0,
            load_generation: 0,
            job: None,
            next_job_id: 0,
            n_past: 0,
        }
    }

    fn status(&self) -> SystemStatus {
        let mut status = SystemStatus::unloaded();
        status.loading_progress = self.loading_progress;
        if self.phase == LoadPhase::Ready {
            status.init_success = 1;
            status.model = self.model.clone();
            status.extra.insert("n_ctx".to_string(), json!(self.ctx_size));
        }
        status
    }

    fn require_ready(&self) -> Result<(), String> {
        match self.phase {
            LoadPhase::Ready => Ok(()),
            LoadPhase::Loading => Err("model is still loading".to_string()),
            _ => Err("model not loaded".to_string()),
        }
    }

    fn cancel_job(&mut self) {
        if let Some(job) = self.job.take() {
            job.cancel.store(true, Ordering::Release);
        }
    }
}

/// A completion worked out ahead of time, split into emitted pieces.
#[derive(Debug, Clone, PartialEq)]
struct Plan {
    pieces: Vec<String>,
    reason: StopReason,
    stopping_word: String,
    prompt_tokens: usize,
}

impl Plan {
    fn content(&self) -> String {
        self.pieces.concat()
    }

    fn into_result(self, model: Option<&Path>) -> CompletionResult {
        let mut result = CompletionResult {
            content: self.content(),
            stop: true,
            stopped_eos: self.reason == StopReason::Eos,
            stopped_limit: self.reason == StopReason::Limit,
            stopped_word: self.reason == StopReason::Word,
            stopping_word: self.stopping_word,
            tokens_predicted: self.pieces.len(),
            tokens_evaluated: self.prompt_tokens,
            ..CompletionResult::default()
        };
        if let Some(model) = model {
            result
                .extra
                .insert("model".to_string(), json!(model.display().to_string()));
        }
        result
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateSnapshot {
    model: PathBuf,
    n_past: usize,
}

/// Stub engine implementing [`EngineBackend`] in-process.
#[derive(Clone)]
pub struct MockEngine {
    state: Arc<Mutex<EngineState>>,
    timing: MockTiming,
    count_pattern: Regex,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new(MockTiming::default())
    }
}

impl MockEngine {
    pub fn new(timing: MockTiming) -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::new())),
            timing,
            count_pattern: Regex::new(r"(?i)count\s+from\s+(\d+)\s+to\s+(\d+)")
                .expect("count pattern is a valid regex"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Work out the full generation for a request.
    ///
    /// Generation never runs past the context window: prompt and output
    /// together stay within `ctx_size` tokens.
    fn plan(&self, request: &CompletionRequest, ctx_size: u32) -> Plan {
        let prompt_tokens = split_pieces(&request.prompt).len();
        let instruction = chatml::last_user_message(&request.prompt).unwrap_or(&request.prompt);

        let window = (ctx_size as usize).saturating_sub(prompt_tokens);
        let limit = request
            .n_predict
            .filter(|n| *n > 0)
            .map(|n| (n as usize).min(window))
            .unwrap_or(window);

        let (mut pieces, mut reason): (Vec<String>, StopReason) = match self.count_range(instruction) {
            Some((from, to)) => {
                let pieces = (from..=to)
                    .enumerate()
                    .map(|(i, n)| if i == 0 { n.to_string() } else { format!(" {n}") })
                    .collect();
                (pieces, StopReason::Eos)
            }
            None => {
                let n = match request.n_predict {
                    Some(n) if n > 0 => limit,
                    _ => limit.min(DEFAULT_N_PREDICT),
                };
                let pieces = (0..n)
                    .map(|i| if i == 0 { format!("token_{i}") } else { format!(" token_{i}") })
                    .collect();
                (pieces, StopReason::Limit)
            }
        };

        if pieces.len() > limit {
            pieces.truncate(limit);
            reason = StopReason::Limit;
        }

        let mut stopping_word = String::new();
        if let Some((cut, word)) = find_stop(&pieces, &request.stop) {
            pieces = truncate_pieces(pieces, cut);
            reason = StopReason::Word;
            stopping_word = word;
        }

        Plan {
            pieces,
            reason,
            stopping_word,
            prompt_tokens,
        }
    }

    fn count_range(&self, text: &str) -> Option<(u64, u64)> {
        let caps = self.count_pattern.captures(text)?;
        let from: u64 = caps.get(1)?.as_str().parse().ok()?;
        let to: u64 = caps.get(2)?.as_str().parse().ok()?;
        (from <= to).then(|| (from, to.min(from.saturating_add(MAX_COUNT))))
    }

    fn spawn_loader(&self, generation: u64, request: InitRequest) {
        let state = self.state.clone();
        let timing = self.timing.clone();

        thread::spawn(move || {
            let steps = timing.load_steps.max(1);
            let exists = request.model_exists();

            for step in 1..=steps {
                thread::sleep(timing.load_step);
                let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                if st.load_generation != generation {
                    return;
                }
                if !exists {
                    // Progress stalls where it is and init_success stays 0.
                    warn!(model = %request.model.display(), "Model file not found");
                    st.phase = LoadPhase::Failed;
                    return;
                }
                st.loading_progress = f64::from(step) / f64::from(steps);
                if step == steps {
                    st.phase = LoadPhase::Ready;
                    st.model = Some(request.model.clone());
                    st.ctx_size = request.ctx_size;
                    info!(model = %request.model.display(), "Model loaded");
                }
            }
        });
    }

    fn spawn_generator(&self, job_id: u64, plan: Plan, cancel: Arc<AtomicBool>) {
        let state = self.state.clone();
        let delay = self.timing.token_delay;

        thread::spawn(move || {
            let push = |update: CompletionUpdate, last: bool| -> bool {
                let mut st = state.lock().unwrap_or_else(PoisonError::into_inner);
                match st.job.as_mut() {
                    Some(job) if job.id == job_id => {
                        job.pending.push_back(update);
                        job.finished = last;
                        true
                    }
                    // Slot was cleared by deinit.
                    _ => false,
                }
            };

            for piece in &plan.pieces {
                thread::sleep(delay);
                if cancel.load(Ordering::Acquire) {
                    debug!(job_id, "Async completion cancelled");
                    push(CompletionUpdate::terminal(StopReason::Cancelled), true);
                    return;
                }
                if !push(CompletionUpdate::chunk(piece.clone()), false) {
                    return;
                }
            }

            thread::sleep(delay);
            let reason = if cancel.load(Ordering::Acquire) {
                StopReason::Cancelled
            } else {
                plan.reason
            };
            push(CompletionUpdate::terminal(reason), true);
            debug!(job_id, pieces = plan.pieces.len(), %reason, "Async completion done");
        });
    }

    fn chat_completion(&self, st: &EngineState, body: &str) -> Result<Value, String> {
        let body: ChatCompletionBody =
            serde_json::from_str(body).map_err(|e| format!("invalid chat body: {e}"))?;
        let request =
            CompletionRequest::new(chatml::format_chatml(&body.messages, true)).with_stop(IM_END);
        let plan = self.plan(&request, st.ctx_size);
        let finish_reason = if plan.reason == StopReason::Limit {
            "length"
        } else {
            "stop"
        };

        Ok(json!({
            "object": "chat.completion",
            "model": st.model.as_ref().map(|m| m.display().to_string()),
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": plan.content() },
                "finish_reason": finish_reason,
            }],
            "usage": {
                "prompt_tokens": plan.prompt_tokens,
                "completion_tokens": plan.pieces.len(),
                "total_tokens": plan.prompt_tokens + plan.pieces.len(),
            },
        }))
    }
}

/// Split text into pieces with leading whitespace attached to each word.
fn split_pieces(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut has_word = false;

    for ch in text.chars() {
        if ch.is_whitespace() && has_word {
            pieces.push(std::mem::take(&mut current));
            has_word = false;
        }
        if !ch.is_whitespace() {
            has_word = true;
        }
        current.push(ch);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Earliest byte offset in the joined pieces where a stop word begins.
fn find_stop(pieces: &[String], stops: &[String]) -> Option<(usize, String)> {
    let text = pieces.concat();
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()).map(|at| (at, s.clone())))
        .min_by_key(|(at, _)| *at)
}

/// Keep only the first `cut` bytes of the joined pieces.
fn truncate_pieces(pieces: Vec<String>, cut: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut used = 0;
    for piece in pieces {
        if used >= cut {
            break;
        }
        let take = (cut - used).min(piece.len());
        used += take;
        if take == piece.len() {
            out.push(piece);
        } else {
            out.push(piece[..take].to_string());
        }
    }
    out.retain(|p| !p.is_empty());
    out
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|e| rejection(format!("failed to encode response: {e}")))
}

fn rejection(message: impl Into<String>) -> String {
    json!({ "error": EngineRejection::new(message).error }).to_string()
}

fn parse<T: for<'de> Deserialize<'de>>(call: &str, text: &str) -> Result<T, String> {
    serde_json::from_str(text).map_err(|e| format!("{call}: invalid request: {e}"))
}

impl EngineBackend for MockEngine {
    fn init(&self, config: &str) -> Result<i32, TransportError> {
        let request: InitRequest = match parse("init", config) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Rejecting init");
                return Ok(0);
            }
        };

        let mut st = self.lock();
        st.cancel_job();
        st.load_generation += 1;
        st.model = None;
        st.n_past = 0;

        if !request.model_exists() {
            warn!(model = %request.model.display(), "Model file not found");
            st.phase = LoadPhase::Failed;
            st.loading_progress = 0.0;
            return Ok(0);
        }

        st.phase = LoadPhase::Ready;
        st.loading_progress = 1.0;
        st.model = Some(request.model.clone());
        st.ctx_size = request.ctx_size;
        info!(model = %request.model.display(), ctx_size = request.ctx_size, "Model loaded");
        Ok(1)
    }

    fn init_async(&self, config: &str) -> Result<(), TransportError> {
        let request: InitRequest = match parse("init_async", config) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Rejecting init_async");
                let mut st = self.lock();
                st.cancel_job();
                st.load_generation += 1;
                st.phase = LoadPhase::Failed;
                st.loading_progress = 0.0;
                st.model = None;
                st.n_past = 0;
                return Ok(());
            }
        };

        let generation = {
            let mut st = self.lock();
            st.cancel_job();
            st.load_generation += 1;
            st.phase = LoadPhase::Loading;
            st.loading_progress = 0.0;
            st.model = None;
            st.n_past = 0;
            st.load_generation
        };

        self.spawn_loader(generation, request);
        Ok(())
    }

    fn poll_system_status(&self) -> Result<String, TransportError> {
        Ok(to_json(&self.lock().status()))
    }

    fn tokenize(&self, request: &str) -> Result<String, TransportError> {
        let st = self.lock();
        if let Err(e) = st.require_ready() {
            return Ok(rejection(e));
        }
        let request: TokenizeRequest = match parse("tokenize", request) {
            Ok(r) => r,
            Err(e) => return Ok(rejection(e)),
        };
        let tokens = split_pieces(&request.text);
        Ok(to_json(&TokenizeResult {
            success: true,
            length: tokens.len(),
            tokens,
        }))
    }

    fn get_completion(&self, request: &str) -> Result<String, TransportError> {
        let mut st = self.lock();
        if let Err(e) = st.require_ready() {
            return Ok(rejection(e));
        }
        let request: CompletionRequest = match parse("get_completion", request) {
            Ok(r) => r,
            Err(e) => return Ok(rejection(e)),
        };
        let plan = self.plan(&request, st.ctx_size);
        st.n_past = plan.prompt_tokens + plan.pieces.len();
        Ok(to_json(&plan.into_result(st.model.as_deref())))
    }

    fn async_completion_init(&self, request: &str) -> Result<String, TransportError> {
        let mut st = self.lock();
        if let Err(e) = st.require_ready() {
            return Ok(rejection(e));
        }
        if st.job.is_some() {
            return Ok(rejection("an async completion is already running"));
        }
        let request: CompletionRequest = match parse("async_completion_init", request) {
            Ok(r) => r,
            Err(e) => return Ok(rejection(e)),
        };

        let plan = self.plan(&request, st.ctx_size);
        st.n_past = plan.prompt_tokens + plan.pieces.len();
        let id = st.next_job_id;
        st.next_job_id += 1;
        let cancel = Arc::new(AtomicBool::new(false));
        st.job = Some(AsyncJob {
            id,
            pending: VecDeque::new(),
            finished: false,
            cancel: cancel.clone(),
        });
        drop(st);

        self.spawn_generator(id, plan, cancel);
        Ok(json!({ "success": true }).to_string())
    }

    fn async_completion_poll(&self, _command: &str) -> Result<String, TransportError> {
        let mut st = self.lock();
        let Some(job) = st.job.as_mut() else {
            // Idle: nothing to report and nothing to wait for.
            return Ok(to_json(&AsyncPollResult {
                completion_updates: Vec::new(),
                finished: true,
                success: None,
            }));
        };

        let updates: Vec<CompletionUpdate> = job.pending.drain(..).collect();
        let finished = job.finished;
        if finished {
            st.job = None;
        }
        Ok(to_json(&AsyncPollResult {
            completion_updates: updates,
            finished,
            success: finished.then_some(true),
        }))
    }

    fn async_completion_cancel(&self, _command: &str) -> Result<String, TransportError> {
        let st = self.lock();
        let running = match st.job.as_ref() {
            Some(job) if !job.finished => {
                job.cancel.store(true, Ordering::Release);
                true
            }
            _ => false,
        };
        Ok(json!({ "success": running }).to_string())
    }

    fn save_state(&self, request: &str) -> Result<String, TransportError> {
        let st = self.lock();
        if let Err(e) = st.require_ready() {
            return Ok(rejection(e));
        }
        let request: StateRequest = match parse("save_state", request) {
            Ok(r) => r,
            Err(e) => return Ok(rejection(e)),
        };
        let Some(model) = st.model.clone() else {
            return Ok(rejection("model not loaded"));
        };
        let snapshot = StateSnapshot {
            model,
            n_past: st.n_past,
        };
        let written = serde_json::to_vec(&snapshot)
            .map_err(|e| e.to_string())
            .and_then(|bytes| std::fs::write(&request.filename, bytes).map_err(|e| e.to_string()));
        Ok(match written {
            Ok(()) => json!({ "success": true, "n_past": snapshot.n_past }).to_string(),
            Err(e) => rejection(format!("save_state: {e}")),
        })
    }

    fn load_state(&self, request: &str) -> Result<String, TransportError> {
        let mut st = self.lock();
        if let Err(e) = st.require_ready() {
            return Ok(rejection(e));
        }
        let request: StateRequest = match parse("load_state", request) {
            Ok(r) => r,
            Err(e) => return Ok(rejection(e)),
        };
        let snapshot: StateSnapshot = match std::fs::read(&request.filename)
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
        {
            Ok(s) => s,
            Err(e) => return Ok(rejection(format!("load_state: {e}"))),
        };
        if st.model.as_deref() != Some(snapshot.model.as_path()) {
            return Ok(rejection("load_state: state was saved with a different model"));
        }
        st.n_past = snapshot.n_past;
        Ok(json!({ "success": true, "n_past": snapshot.n_past }).to_string())
    }

    fn rpc_call(&self, request: &str) -> Result<String, TransportError> {
        let request: RpcRequest = match parse("rpc_call", request) {
            Ok(r) => r,
            Err(e) => return Ok(json!({ "error": { "code": 400, "message": e } }).to_string()),
        };
        let st = self.lock();
        let health = if st.phase == LoadPhase::Ready {
            "ok"
        } else {
            "loading model"
        };

        let response = match (request.method.to_ascii_uppercase().as_str(), request.path.as_str()) {
            ("GET", "/health") => Ok(json!({ "status": health })),
            ("POST", CHAT_COMPLETIONS_PATH) => match st.require_ready() {
                Ok(()) => self.chat_completion(&st, &request.body),
                Err(e) => Err(e),
            },
            (method, path) => {
                return Ok(json!({
                    "error": { "code": 404, "message": format!("no handler for {method} {path}") }
                })
                .to_string())
            }
        };

        Ok(match response {
            Ok(v) => v.to_string(),
            Err(e) => json!({ "error": { "code": 500, "message": e } }).to_string(),
        })
    }

    fn deinit(&self) -> Result<(), TransportError> {
        let mut st = self.lock();
        if st.phase != LoadPhase::Unloaded {
            info!("Model unloaded");
        }
        st.cancel_job();
        st.load_generation += 1;
        st.phase = LoadPhase::Unloaded;
        st.loading_progress = 0.0;
        st.model = None;
        st.n_past = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: u32 = InitRequest::DEFAULT_CTX_SIZE;

    fn loaded() -> (MockEngine, tempfile::NamedTempFile) {
        let model = tempfile::NamedTempFile::new().unwrap();
        let engine = MockEngine::new(MockTiming::fast());
        let req = serde_json::to_string(&InitRequest::new(model.path())).unwrap();
        assert_eq!(engine.init(&req).unwrap(), 1);
        (engine, model)
    }

    #[test]
    fn test_split_pieces_round_trips_text() {
        let text = "  hello world\nagain ";
        let pieces = split_pieces(text);
        assert_eq!(pieces.concat(), text);
        assert_eq!(pieces, vec!["  hello", " world", "\nagain", " "]);
        assert!(split_pieces("").is_empty());
    }

    #[test]
    fn test_plan_counting_stops_on_eos() {
        let engine = MockEngine::new(MockTiming::fast());
        let plan = engine.plan(&CompletionRequest::new("please count from 1 to 3"), CTX);
        assert_eq!(plan.content(), "1 2 3");
        assert_eq!(plan.reason, StopReason::Eos);
    }

    #[test]
    fn test_plan_counting_near_u64_max() {
        let engine = MockEngine::new(MockTiming::fast());
        let max = u64::MAX;
        let plan = engine.plan(&CompletionRequest::new(format!("count from {max} to {max}")), CTX);
        assert_eq!(plan.content(), max.to_string());
        assert_eq!(plan.reason, StopReason::Eos);

        let plan = engine.plan(
            &CompletionRequest::new(format!("count from {} to {max}", max - 2)),
            CTX,
        );
        assert_eq!(plan.pieces.len(), 3);
    }

    #[test]
    fn test_plan_stays_within_context() {
        let engine = MockEngine::new(MockTiming::fast());
        let plan = engine.plan(&CompletionRequest::new("hi").with_n_predict(2_000_000_000), 16);
        assert_eq!(plan.pieces.len(), 15);
        assert_eq!(plan.reason, StopReason::Limit);

        // Counting is cut at the window as well; the prompt takes five tokens.
        let plan = engine.plan(&CompletionRequest::new("count from 1 to 100"), 9);
        assert_eq!(plan.content(), "1 2 3 4");
        assert_eq!(plan.reason, StopReason::Limit);
    }

    #[test]
    fn test_completion_limited_by_ctx_size() {
        let model = tempfile::NamedTempFile::new().unwrap();
        let engine = MockEngine::new(MockTiming::fast());
        let req = serde_json::to_string(&InitRequest::new(model.path()).with_ctx_size(32)).unwrap();
        assert_eq!(engine.init(&req).unwrap(), 1);

        let out = engine
            .get_completion(r#"{"prompt":"hi","n_predict":2000000000}"#)
            .unwrap();
        let result: CompletionResult = serde_json::from_str(&out).unwrap();
        assert!(result.stopped_limit);
        assert!(result.tokens_predicted <= 32);
    }

    #[test]
    fn test_bad_init_async_discards_pending_load() {
        let model = tempfile::NamedTempFile::new().unwrap();
        let engine = MockEngine::new(MockTiming {
            load_step: Duration::from_millis(5),
            load_steps: 4,
            token_delay: Duration::from_millis(1),
        });
        let req = serde_json::to_string(&InitRequest::new(model.path())).unwrap();
        engine.init_async(&req).unwrap();
        engine.init_async("not json").unwrap();

        thread::sleep(Duration::from_millis(100));
        let status: SystemStatus =
            serde_json::from_str(&engine.poll_system_status().unwrap()).unwrap();
        assert_eq!(status.init_success, 0);
        assert!(status.model.is_none());
    }

    #[test]
    fn test_plan_limit_and_stop_word() {
        let engine = MockEngine::new(MockTiming::fast());

        let plan = engine.plan(&CompletionRequest::new("hi").with_n_predict(3), CTX);
        assert_eq!(plan.content(), "token_0 token_1 token_2");
        assert_eq!(plan.reason, StopReason::Limit);

        let plan = engine.plan(&CompletionRequest::new("hi").with_stop(" token_2"), CTX);
        assert_eq!(plan.content(), "token_0 token_1");
        assert_eq!(plan.reason, StopReason::Word);
        assert_eq!(plan.stopping_word, " token_2");

        // A stop word ending mid-piece trims that piece.
        let plan = engine.plan(&CompletionRequest::new("hi").with_stop("en_1"), CTX);
        assert_eq!(plan.content(), "token_0 tok");
    }

    #[test]
    fn test_init_missing_model_fails() {
        let engine = MockEngine::new(MockTiming::fast());
        let req = serde_json::to_string(&InitRequest::new("/no/such/model.gguf")).unwrap();
        assert_eq!(engine.init(&req).unwrap(), 0);
        let status: SystemStatus =
            serde_json::from_str(&engine.poll_system_status().unwrap()).unwrap();
        assert_eq!(status.init_success, 0);
        assert_eq!(engine.init("not json").unwrap(), 0);
    }

    #[test]
    fn test_calls_rejected_before_load() {
        let engine = MockEngine::new(MockTiming::fast());
        let out = engine.tokenize(r#"{"text":"hi"}"#).unwrap();
        assert!(out.contains("model not loaded"));
        let out = engine.async_completion_init(r#"{"prompt":"hi"}"#).unwrap();
        assert!(out.contains("error"));
    }

    #[test]
    fn test_second_async_init_rejected() {
        let (engine, _model) = loaded();
        let req = r#"{"prompt":"hi","n_predict":1000}"#;
        assert!(engine.async_completion_init(req).unwrap().contains("\"success\":true"));
        let second = engine.async_completion_init(req).unwrap();
        assert!(second.contains("already running"));
        engine.deinit().unwrap();
    }

    #[test]
    fn test_idle_poll_is_noop() {
        let (engine, _model) = loaded();
        let poll: AsyncPollResult =
            serde_json::from_str(&engine.async_completion_poll("").unwrap()).unwrap();
        assert!(poll.completion_updates.is_empty());
        assert!(poll.finished);
        assert_eq!(poll.success, None);
    }

    #[test]
    fn test_rpc_unknown_route() {
        let (engine, _model) = loaded();
        let req = RpcRequest::new("GET", "/nope", &Value::Null);
        let out: Value =
            serde_json::from_str(&engine.rpc_call(&serde_json::to_string(&req).unwrap()).unwrap())
                .unwrap();
        assert_eq!(out["error"]["code"], 404);
    }
}
