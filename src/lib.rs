//! llm-rpc-shim: call/response shim over a dynamically loaded LLM engine.
//!
//! The engine library does the real work (model loading, tokenization,
//! generation). This crate loads it, marshals JSON text across its C
//! boundary, and tracks the model lifecycle and the async completion slot:
//!
//! - [`transport`]: raw calls into the engine (`libloading`) or an in-process stub
//! - [`protocol`]: typed request/response payloads
//! - [`session`]: lifecycle, blocking calls and the async completion protocol
//! - [`shell`]: interactive command shell
//! - [`config`]: CLI and file configuration

pub mod config;
pub mod protocol;
pub mod session;
pub mod shell;
pub mod transport;

pub use protocol::Reply;
pub use session::{EngineSession, Phase, SessionError};
pub use transport::{EngineBackend, MockEngine, NativeLibrary, TransportError};
