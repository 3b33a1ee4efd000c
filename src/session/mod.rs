//! Engine session: lifecycle of the one model the engine can hold.
//!
//! - [`calls`]: blocking request/response operations (tokenize, completion, rpc, state)
//! - [`async_completion`]: the init/poll/cancel protocol for streamed generation
//!
//! The session mirrors the engine's phase locally so callers can ask where
//! they are, but it never rejects a call on that basis: phase violations are
//! the engine's to reject, and its rejection comes back as data.
//!
//! Every call takes `&mut self`, so a session is driven by one caller at a
//! time. Sharing one across threads means wrapping it in a mutex.

pub mod async_completion;
pub mod calls;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PollingConfig;
use crate::protocol::{EngineRejection, InitRequest, Reply, SystemStatus};
use crate::transport::{EngineBackend, TransportError};

pub use async_completion::{AsyncOutcome, AsyncPhase};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Malformed response from `{call}`: {reason}")]
    MalformedResponse { call: &'static str, reason: String },

    #[error("Engine rejected the call: {0}")]
    Rejected(EngineRejection),

    #[error("Model failed to load (progress stalled at {progress:.2})")]
    LoadFailed { progress: f64 },

    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout { what: &'static str, waited: Duration },
}

impl From<EngineRejection> for SessionError {
    fn from(rejection: EngineRejection) -> Self {
        SessionError::Rejected(rejection)
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Model lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unloaded,
    Loading,
    Ready,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Unloaded => write!(f, "unloaded"),
            Phase::Loading => write!(f, "loading"),
            Phase::Ready => write!(f, "ready"),
        }
    }
}

/// Handle over an engine backend plus the locally mirrored phase.
pub struct EngineSession {
    backend: Arc<dyn EngineBackend>,
    phase: Phase,
    async_phase: AsyncPhase,
}

impl EngineSession {
    pub fn new(backend: Arc<dyn EngineBackend>) -> Self {
        Self {
            backend,
            phase: Phase::Unloaded,
            async_phase: AsyncPhase::Idle,
        }
    }

    /// Locally mirrored load phase.
    ///
    /// The status payload does not say whether a background load is still
    /// running, so a failed `init_async` keeps reporting `Loading` until
    /// [`wait_until_loaded`](Self::wait_until_loaded) sees progress stall,
    /// or until the next `init`/`deinit`.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn async_phase(&self) -> AsyncPhase {
        self.async_phase
    }

    /// Load a model, blocking until the engine finishes or fails.
    pub fn init(&mut self, request: &InitRequest) -> Result<bool> {
        let config = serde_json::to_string(request)?;
        Ok(self.init_raw(&config)? == 1)
    }

    /// `init` with a caller-supplied config text. Returns the engine's code.
    pub fn init_raw(&mut self, config: &str) -> Result<i32> {
        info!("Initializing model");
        let started = Instant::now();
        let rc = self.backend.init(config)?;

        self.async_phase = AsyncPhase::Idle;
        if rc == 1 {
            self.phase = Phase::Ready;
            info!(elapsed_ms = started.elapsed().as_millis() as u64, "Model ready");
        } else {
            self.phase = Phase::Unloaded;
            warn!(rc, "Model initialization failed");
        }
        Ok(rc)
    }

    /// Start loading a model and return immediately.
    pub fn init_async(&mut self, request: &InitRequest) -> Result<()> {
        let config = serde_json::to_string(request)?;
        self.init_async_raw(&config)
    }

    pub fn init_async_raw(&mut self, config: &str) -> Result<()> {
        info!("Starting asynchronous model load");
        self.backend.init_async(config)?;
        self.phase = Phase::Loading;
        self.async_phase = AsyncPhase::Idle;
        Ok(())
    }

    /// Current engine status, valid in every phase.
    pub fn poll_system_status(&mut self) -> Result<SystemStatus> {
        let text = self.poll_system_status_raw()?;
        let status: SystemStatus = decode("poll_system_status", &text)?;
        self.observe_status(&status);
        Ok(status)
    }

    pub fn poll_system_status_raw(&mut self) -> Result<String> {
        Ok(self.backend.poll_system_status()?)
    }

    fn observe_status(&mut self, status: &SystemStatus) {
        let next = if status.is_ready() {
            Phase::Ready
        } else if self.phase == Phase::Loading {
            Phase::Loading
        } else {
            Phase::Unloaded
        };
        if next != self.phase {
            debug!(from = %self.phase, to = %next, "Phase change observed");
            self.phase = next;
        }
    }

    /// Poll until the model is ready.
    ///
    /// Fails with [`SessionError::LoadFailed`] once `loading_progress` has not
    /// moved for `polling.stall()` while `init_success` is still 0, and with
    /// [`SessionError::Timeout`] past `polling.timeout()`.
    pub async fn wait_until_loaded(&mut self, polling: &PollingConfig) -> Result<SystemStatus> {
        let started = Instant::now();
        let mut last_progress = f64::NAN;
        let mut last_change = started;

        loop {
            let status = self.poll_system_status()?;
            if status.is_ready() {
                return Ok(status);
            }

            if status.loading_progress != last_progress {
                last_progress = status.loading_progress;
                last_change = Instant::now();
            } else if status.init_success == 0 && last_change.elapsed() >= polling.stall() {
                warn!(progress = status.loading_progress, "Model load stalled");
                self.phase = Phase::Unloaded;
                return Err(SessionError::LoadFailed {
                    progress: status.loading_progress,
                });
            }

            if started.elapsed() >= polling.timeout() {
                return Err(SessionError::Timeout {
                    what: "model load",
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(polling.interval()).await;
        }
    }

    /// Release the model. Safe to call in any phase, any number of times.
    pub fn deinit(&mut self) -> Result<()> {
        self.backend.deinit()?;
        if self.phase != Phase::Unloaded {
            info!("Model released");
        }
        self.phase = Phase::Unloaded;
        self.async_phase = AsyncPhase::Idle;
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(call: &'static str, text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| SessionError::MalformedResponse {
        call,
        reason: e.to_string(),
    })
}

fn decode_reply<T: DeserializeOwned>(call: &'static str, text: &str) -> Result<Reply<T>> {
    let reply: Reply<T> = decode(call, text)?;
    if let Reply::Rejected(rejection) = &reply {
        debug!(call, error = %rejection, "Engine rejected call");
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockEngine, MockTiming};

    fn session() -> EngineSession {
        EngineSession::new(Arc::new(MockEngine::new(MockTiming::fast())))
    }

    fn fast_polling() -> PollingConfig {
        PollingConfig {
            interval_ms: 1,
            timeout_secs: 5,
            stall_secs: 0,
        }
    }

    #[test]
    fn test_sync_init_and_deinit() {
        let model = tempfile::NamedTempFile::new().unwrap();
        let mut s = session();
        assert_eq!(s.phase(), Phase::Unloaded);

        assert!(s.init(&InitRequest::new(model.path())).unwrap());
        assert_eq!(s.phase(), Phase::Ready);

        let status = s.poll_system_status().unwrap();
        assert!(status.is_serving(model.path()));

        s.deinit().unwrap();
        s.deinit().unwrap();
        assert_eq!(s.phase(), Phase::Unloaded);
        assert_eq!(s.poll_system_status().unwrap().init_success, 0);
    }

    #[test]
    fn test_failed_init_stays_unloaded() {
        let mut s = session();
        assert!(!s.init(&InitRequest::new("/missing/model.gguf")).unwrap());
        assert_eq!(s.phase(), Phase::Unloaded);
    }

    #[tokio::test]
    async fn test_async_init_reaches_ready() {
        let model = tempfile::NamedTempFile::new().unwrap();
        let mut s = session();
        s.init_async(&InitRequest::new(model.path())).unwrap();
        assert_eq!(s.phase(), Phase::Loading);

        let polling = PollingConfig {
            stall_secs: 5,
            ..fast_polling()
        };
        let status = s.wait_until_loaded(&polling).await.unwrap();
        assert_eq!(status.loading_progress, 1.0);
        assert_eq!(s.phase(), Phase::Ready);
    }

    #[tokio::test]
    async fn test_async_init_missing_model_stalls() {
        let mut s = session();
        s.init_async(&InitRequest::new("/missing/model.gguf")).unwrap();

        let polling = PollingConfig {
            interval_ms: 20,
            ..fast_polling()
        };
        let err = s.wait_until_loaded(&polling).await.unwrap_err();
        assert!(matches!(err, SessionError::LoadFailed { .. }));
        assert_eq!(s.phase(), Phase::Unloaded);
    }

    #[tokio::test]
    async fn test_failed_async_load_reads_as_loading_until_waited() {
        let mut s = session();
        s.init_async(&InitRequest::new("/missing/model.gguf")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = s.poll_system_status().unwrap();
        assert_eq!(status.init_success, 0);
        assert_eq!(s.phase(), Phase::Loading);

        let err = s.wait_until_loaded(&fast_polling()).await.unwrap_err();
        assert!(matches!(err, SessionError::LoadFailed { .. }));
        assert_eq!(s.phase(), Phase::Unloaded);
    }

    /// Backend whose every call fails at the transport layer.
    struct BrokenTransport;

    impl EngineBackend for BrokenTransport {
        fn init(&self, _: &str) -> std::result::Result<i32, TransportError> {
            Err(TransportError::NullResponse("init"))
        }
        fn init_async(&self, _: &str) -> std::result::Result<(), TransportError> {
            Err(TransportError::NullResponse("init_async"))
        }
        fn poll_system_status(&self) -> std::result::Result<String, TransportError> {
            Err(TransportError::NullResponse("poll_system_status"))
        }
        fn tokenize(&self, _: &str) -> std::result::Result<String, TransportError> {
            Err(TransportError::NullResponse("tokenize"))
        }
        fn get_completion(&self, _: &str) -> std::result::Result<String, TransportError> {
            Err(TransportError::NullResponse("get_completion"))
        }
        fn async_completion_init(&self, _: &str) -> std::result::Result<String, TransportError> {
            Err(TransportError::NullResponse("async_completion_init"))
        }
        fn async_completion_poll(&self, _: &str) -> std::result::Result<String, TransportError> {
            Err(TransportError::NullResponse("async_completion_poll"))
        }
        fn async_completion_cancel(&self, _: &str) -> std::result::Result<String, TransportError> {
            Err(TransportError::NullResponse("async_completion_cancel"))
        }
        fn save_state(&self, _: &str) -> std::result::Result<String, TransportError> {
            Err(TransportError::MissingSymbol("save_state"))
        }
        fn load_state(&self, _: &str) -> std::result::Result<String, TransportError> {
            Err(TransportError::MissingSymbol("load_state"))
        }
        fn rpc_call(&self, _: &str) -> std::result::Result<String, TransportError> {
            Err(TransportError::NullResponse("rpc_call"))
        }
        fn deinit(&self) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn test_transport_failure_leaves_phase_alone() {
        let mut s = EngineSession::new(Arc::new(BrokenTransport));
        let err = s.init(&InitRequest::new("/m.gguf")).unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(s.phase(), Phase::Unloaded);

        assert!(s.init_async(&InitRequest::new("/m.gguf")).is_err());
        assert_eq!(s.phase(), Phase::Unloaded);
    }

    #[test]
    fn test_malformed_status_is_reported() {
        let err = decode::<SystemStatus>("poll_system_status", "not json").unwrap_err();
        assert!(matches!(
            err,
            SessionError::MalformedResponse { call: "poll_system_status", .. }
        ));
    }
}
