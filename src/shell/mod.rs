//! Interactive command shell over an [`EngineSession`].
//!
//! - [`commands`]: line parsing
//! - [`history`]: persisted input history

pub mod commands;
pub mod history;

use std::io::Write;
use std::path::Path;

use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::protocol::chatml;
use crate::protocol::{ChatMessage, CompletionRequest, InitRequest, Reply, StateRequest};
use crate::session::{EngineSession, SessionError};

pub use commands::{parse_line, Command, CommandError, Payload};
pub use history::History;

#[derive(Error, Debug)]
pub enum ShellError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Whether the shell should keep reading input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Shell {
    session: EngineSession,
    config: Config,
}

/// Pretty-print a JSON response, or return it unchanged if it is not JSON.
pub fn pretty(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| text.to_string())
}

fn pretty_value<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

impl Shell {
    pub fn new(session: EngineSession, config: Config) -> Self {
        Self { session, config }
    }

    /// Parse and run one input line.
    pub async fn run_line(&mut self, line: &str, out: &mut impl Write) -> Result<Flow, ShellError> {
        match parse_line(line)? {
            Some(cmd) => self.execute(cmd, out).await,
            None => Ok(Flow::Continue),
        }
    }

    /// Run every line of a bootstrap file, stopping at the first error.
    pub async fn run_script(&mut self, path: &Path, out: &mut impl Write) -> Result<Flow, ShellError> {
        let script = std::fs::read_to_string(path)?;
        for line in script.lines() {
            debug!(line, "Bootstrap");
            if self.run_line(line, out).await? == Flow::Quit {
                return Ok(Flow::Quit);
            }
        }
        Ok(Flow::Continue)
    }

    fn init_config(&self, payload: Payload) -> Result<String, ShellError> {
        Ok(match payload {
            Payload::Json(json) => json,
            Payload::Text(model) => {
                let request: InitRequest = self.config.engine.init_request(model);
                serde_json::to_string(&request)?
            }
        })
    }

    fn completion_request(payload: Payload) -> Result<String, ShellError> {
        Ok(match payload {
            Payload::Json(json) => json,
            Payload::Text(prompt) => {
                serde_json::to_string(&chatml::chat_request(None, Some(&prompt)))?
            }
        })
    }

    fn state_request(payload: Payload) -> Result<String, ShellError> {
        Ok(match payload {
            Payload::Json(json) => json,
            Payload::Text(path) => serde_json::to_string(&StateRequest {
                filename: path.into(),
            })?,
        })
    }

    pub async fn execute(&mut self, cmd: Command, out: &mut impl Write) -> Result<Flow, ShellError> {
        let polling = self.config.polling.clone();

        match cmd {
            Command::Init(payload) => {
                let config = self.init_config(payload)?;
                let rc = self.session.init_raw(&config)?;
                writeln!(out, "Result: {rc}")?;
            }
            Command::InitAsync(payload) => {
                let config = self.init_config(payload)?;
                self.session.init_async_raw(&config)?;
                writeln!(out, "Asynchronous initialization started.")?;
            }
            Command::Status => {
                let status = self.session.poll_system_status_raw()?;
                writeln!(out, "Status: {}", pretty(&status))?;
            }
            Command::Wait => {
                let status = self.session.wait_until_loaded(&polling).await?;
                writeln!(out, "Status: {}", pretty_value(&status))?;
            }
            Command::Tokenize(payload) => {
                let request = match payload {
                    Payload::Json(json) => json,
                    Payload::Text(text) => {
                        serde_json::to_string(&serde_json::json!({ "text": text }))?
                    }
                };
                let ret = self.session.tokenize_raw(&request)?;
                writeln!(out, "Ret: {}", pretty(&ret))?;
            }
            Command::Complete(payload) => {
                let request = Self::completion_request(payload)?;
                let ret = self.session.get_completion_raw(&request)?;
                writeln!(out, "Ret: {}", pretty(&ret))?;
            }
            Command::AsyncInit(payload) => {
                let request = Self::completion_request(payload)?;
                let ret = self.session.async_completion_init_raw(&request)?;
                writeln!(out, "Ret: {}", pretty(&ret))?;
            }
            Command::AsyncPoll => {
                let ret = self.session.async_completion_poll_raw("")?;
                writeln!(out, "Ret: {}", pretty(&ret))?;
            }
            Command::AsyncCancel => {
                let ret = self.session.async_completion_cancel_raw("")?;
                writeln!(out, "Ret: {}", pretty(&ret))?;
            }
            Command::AsyncWait => {
                let outcome = self.session.wait_for_finish(&polling).await?;
                writeln!(out, "{}", outcome.content())?;
                writeln!(
                    out,
                    "[{} updates, {} polls, success: {:?}]",
                    outcome.updates.len(),
                    outcome.polls,
                    outcome.success
                )?;
            }
            Command::Stream(payload) => {
                let request = Self::completion_request(payload)?;
                let request: CompletionRequest = serde_json::from_str(&request)?;
                self.stream(&request, out).await?;
            }
            Command::Chat(message) => {
                let reply = self.session.chat(vec![ChatMessage::user(message)])?;
                match reply {
                    Reply::Ok(response) => writeln!(out, "Response: {}", pretty_value(&response))?,
                    Reply::Rejected(rejection) => writeln!(out, "Error: {rejection}")?,
                }
            }
            Command::Rpc(json) => {
                let ret = self.session.rpc_call_raw(&json)?;
                writeln!(out, "Response: {}", pretty(&ret))?;
            }
            Command::SaveState(payload) => {
                let ret = self.session.save_state_raw(&Self::state_request(payload)?)?;
                writeln!(out, "Ret: {}", pretty(&ret))?;
            }
            Command::LoadState(payload) => {
                let ret = self.session.load_state_raw(&Self::state_request(payload)?)?;
                writeln!(out, "Ret: {}", pretty(&ret))?;
            }
            Command::Deinit => {
                self.session.deinit()?;
                writeln!(out, "System deinitialized.")?;
            }
            Command::Help => writeln!(out, "{}", commands::HELP)?,
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    async fn stream(
        &mut self,
        request: &CompletionRequest,
        out: &mut impl Write,
    ) -> Result<(), ShellError> {
        let interval = self.config.polling.interval();
        let timeout = self.config.polling.timeout();

        let reply = self.session.stream_completion(request, interval)?;
        let updates = match reply {
            Reply::Ok(updates) => updates,
            Reply::Rejected(rejection) => {
                writeln!(out, "Error: {rejection}")?;
                return Ok(());
            }
        };
        futures::pin_mut!(updates);

        let drained = tokio::time::timeout(timeout, async {
            let mut last = None;
            while let Some(update) = updates.next().await {
                let update = update?;
                write!(out, "{}", update.content)?;
                out.flush()?;
                if update.stop {
                    last = Some(update);
                }
            }
            Ok::<_, ShellError>(last)
        })
        .await;

        match drained {
            Ok(last) => {
                let reason = last?.and_then(|u| u.stop_reason());
                writeln!(out)?;
                let reason = reason.map_or_else(|| "unknown".to_string(), |r| r.to_string());
                writeln!(out, "[stop: {reason}]")?;
            }
            Err(_) => {
                writeln!(out)?;
                writeln!(
                    out,
                    "[timed out after {timeout:?}; async completion may still be running]"
                )?;
            }
        }
        Ok(())
    }
}
