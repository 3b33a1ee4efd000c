//! Asynchronous completion protocol.
//!
//! The engine runs at most one async completion. It is driven by three
//! blocking calls:
//!
//! ```text
//!   Idle ──init──▶ Running ──poll*──▶ Running ──poll (finished)──▶ Idle
//!                     │
//!                     └──cancel──▶ Cancelling ──poll (finished)──▶ Idle
//! ```
//!
//! Each poll returns the updates generated since the previous poll, in
//! generation order. The terminal poll carries `finished: true` and ends with
//! an empty update whose `stop` flag is set. Cancel only requests a stop; the
//! caller keeps polling until `finished` is observed.
//!
//! [`EngineSession::stream_completion`] wraps the poll loop in a
//! [`futures::Stream`] of updates.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use futures::stream::{self, Stream};
use tracing::{debug, info, warn};

use super::{decode_reply, EngineSession, Result, SessionError};
use crate::config::PollingConfig;
use crate::protocol::{AsyncAck, AsyncPollResult, CompletionRequest, CompletionUpdate, Reply};

/// Local view of the engine's single async slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncPhase {
    Idle,
    Running,
    Cancelling,
}

impl std::fmt::Display for AsyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AsyncPhase::Idle => write!(f, "idle"),
            AsyncPhase::Running => write!(f, "running"),
            AsyncPhase::Cancelling => write!(f, "cancelling"),
        }
    }
}

/// Everything observed between init and the terminal poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsyncOutcome {
    /// Updates across all polls, in poll order.
    pub updates: Vec<CompletionUpdate>,

    /// `success` from the terminal poll.
    pub success: Option<bool>,

    /// Number of poll calls made.
    pub polls: usize,
}

impl AsyncOutcome {
    /// Concatenated content of every update.
    pub fn content(&self) -> String {
        self.updates.iter().map(|u| u.content.as_str()).collect()
    }

    /// The final update, if it is a terminal one.
    pub fn terminal(&self) -> Option<&CompletionUpdate> {
        self.updates.last().filter(|u| u.is_terminal())
    }

    fn absorb(&mut self, poll: AsyncPollResult) {
        self.polls += 1;
        if poll.finished {
            self.success = poll.success;
        }
        self.updates.extend(poll.completion_updates);
    }
}

impl EngineSession {
    /// Start generation in the engine's async slot.
    ///
    /// A second init while one is running is the engine's to reject; the
    /// rejection is returned as data and the local phase is left alone.
    pub fn async_completion_init(&mut self, request: &CompletionRequest) -> Result<Reply<AsyncAck>> {
        let request = serde_json::to_string(request)?;
        let response = self.async_completion_init_raw(&request)?;
        decode_reply("async_completion_init", &response)
    }

    pub fn async_completion_init_raw(&mut self, request: &str) -> Result<String> {
        let response = self.backend.async_completion_init(request)?;
        let rejected = matches!(
            serde_json::from_str::<Reply<AsyncAck>>(&response),
            Ok(Reply::Rejected(_))
        );
        if rejected {
            warn!(phase = %self.async_phase, "Async completion init rejected");
        } else {
            info!("Async completion started");
            self.async_phase = AsyncPhase::Running;
        }
        Ok(response)
    }

    /// Collect the updates accumulated since the previous poll.
    ///
    /// Polling while idle is passed through like any other poll; the engine
    /// answers with an empty, finished result.
    pub fn async_completion_poll(&mut self) -> Result<Reply<AsyncPollResult>> {
        let response = self.async_completion_poll_raw("")?;
        decode_reply("async_completion_poll", &response)
    }

    pub fn async_completion_poll_raw(&mut self, command: &str) -> Result<String> {
        let response = self.backend.async_completion_poll(command)?;
        if let Ok(Reply::Ok(poll)) = serde_json::from_str::<Reply<AsyncPollResult>>(&response) {
            self.observe_poll(&poll);
        }
        Ok(response)
    }

    fn observe_poll(&mut self, poll: &AsyncPollResult) {
        debug!(
            updates = poll.completion_updates.len(),
            finished = poll.finished,
            "Async poll"
        );
        if poll.finished && self.async_phase != AsyncPhase::Idle {
            info!(success = ?poll.success, from = %self.async_phase, "Async completion finished");
            self.async_phase = AsyncPhase::Idle;
        }
    }

    /// Ask the engine to stop the running completion.
    pub fn async_completion_cancel(&mut self) -> Result<Reply<AsyncAck>> {
        let response = self.async_completion_cancel_raw("")?;
        decode_reply("async_completion_cancel", &response)
    }

    pub fn async_completion_cancel_raw(&mut self, command: &str) -> Result<String> {
        let response = self.backend.async_completion_cancel(command)?;
        if self.async_phase == AsyncPhase::Running {
            info!("Async completion cancel requested");
            self.async_phase = AsyncPhase::Cancelling;
        }
        Ok(response)
    }

    /// Poll until the engine reports `finished`, sleeping between empty polls.
    pub async fn wait_for_finish(&mut self, polling: &PollingConfig) -> Result<AsyncOutcome> {
        let started = Instant::now();
        let mut outcome = AsyncOutcome::default();

        loop {
            let poll = self.async_completion_poll()?.into_result()?;
            let finished = poll.finished;
            let empty = poll.completion_updates.is_empty();
            outcome.absorb(poll);
            if finished {
                return Ok(outcome);
            }
            if started.elapsed() >= polling.timeout() {
                return Err(SessionError::Timeout {
                    what: "async completion",
                    waited: started.elapsed(),
                });
            }
            if empty {
                tokio::time::sleep(polling.interval()).await;
            }
        }
    }

    /// Start an async completion and poll it to the end.
    pub async fn run_async_completion(
        &mut self,
        request: &CompletionRequest,
        polling: &PollingConfig,
    ) -> Result<Reply<AsyncOutcome>> {
        match self.async_completion_init(request)? {
            Reply::Rejected(rejection) => Ok(Reply::Rejected(rejection)),
            Reply::Ok(_) => Ok(Reply::Ok(self.wait_for_finish(polling).await?)),
        }
    }

    /// Start an async completion and stream its updates.
    ///
    /// The stream yields each update once, in generation order, and ends after
    /// the terminal poll. No deadline is applied; wrap the consumer in
    /// `tokio::time::timeout` if one is needed.
    pub fn stream_completion(
        &mut self,
        request: &CompletionRequest,
        interval: Duration,
    ) -> Result<Reply<impl Stream<Item = Result<CompletionUpdate>> + '_>> {
        match self.async_completion_init(request)? {
            Reply::Rejected(rejection) => Ok(Reply::Rejected(rejection)),
            Reply::Ok(_) => Ok(Reply::Ok(self.poll_stream(interval))),
        }
    }

    /// Stream the updates of whatever completion is currently running.
    pub fn poll_stream(
        &mut self,
        interval: Duration,
    ) -> impl Stream<Item = Result<CompletionUpdate>> + '_ {
        struct PollState<'a> {
            session: &'a mut EngineSession,
            buffered: VecDeque<CompletionUpdate>,
            done: bool,
        }

        let state = PollState {
            session: self,
            buffered: VecDeque::new(),
            done: false,
        };

        stream::unfold(state, move |mut st| async move {
            loop {
                if let Some(update) = st.buffered.pop_front() {
                    return Some((Ok(update), st));
                }
                if st.done {
                    return None;
                }
                match st.session.async_completion_poll() {
                    Ok(Reply::Ok(poll)) => {
                        st.done = poll.finished;
                        if poll.completion_updates.is_empty() && !st.done {
                            tokio::time::sleep(interval).await;
                        }
                        st.buffered.extend(poll.completion_updates);
                    }
                    Ok(Reply::Rejected(rejection)) => {
                        st.done = true;
                        return Some((Err(SessionError::Rejected(rejection)), st));
                    }
                    Err(e) => {
                        st.done = true;
                        return Some((Err(e), st));
                    }
                }
            }
        })
    }
}
