//! Transport adapter: raw text calls across the engine boundary.
//!
//! - [`native`]: the real engine, loaded from a shared library with `libloading`
//! - [`mock`]: an in-process stub that simulates the engine's contract
//!
//! Both implement [`EngineBackend`], one method per foreign function. The
//! adapter holds no state of its own: text goes in, text (or an integer)
//! comes out, and the only failures it reports are marshalling failures.

pub mod mock;
pub mod native;

use thiserror::Error;

pub use mock::{MockEngine, MockTiming};
pub use native::NativeLibrary;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to load engine library {path}: {reason}")]
    LibraryLoad { path: String, reason: String },

    #[error("Engine library does not export `{0}`")]
    MissingSymbol(&'static str),

    #[error("An engine library is already open in this process")]
    AlreadyOpen,

    #[error("Encoding error in `{call}`: {reason}")]
    Encoding { call: &'static str, reason: String },

    #[error("Engine returned a null response from `{0}`")]
    NullResponse(&'static str),
}

/// The fixed set of calls exported by an engine library.
///
/// Every call blocks until the engine returns. Implementations must not queue
/// or reorder work; the engine is the only source of asynchronous progress.
pub trait EngineBackend: Send + Sync {
    /// Load a model synchronously. Returns 1 on success, 0 on failure.
    fn init(&self, config: &str) -> Result<i32, TransportError>;

    /// Start loading a model and return immediately.
    fn init_async(&self, config: &str) -> Result<(), TransportError>;

    fn poll_system_status(&self) -> Result<String, TransportError>;

    fn tokenize(&self, request: &str) -> Result<String, TransportError>;

    fn get_completion(&self, request: &str) -> Result<String, TransportError>;

    fn async_completion_init(&self, request: &str) -> Result<String, TransportError>;

    fn async_completion_poll(&self, command: &str) -> Result<String, TransportError>;

    fn async_completion_cancel(&self, command: &str) -> Result<String, TransportError>;

    fn save_state(&self, request: &str) -> Result<String, TransportError>;

    fn load_state(&self, request: &str) -> Result<String, TransportError>;

    fn rpc_call(&self, request: &str) -> Result<String, TransportError>;

    /// Release the loaded model. Idempotent.
    fn deinit(&self) -> Result<(), TransportError>;
}
