//! Blocking request/response calls.
//!
//! Each call has a typed form, which encodes the request and decodes the
//! engine's answer into a [`Reply`], and a `_raw` form that passes text
//! through untouched for the shell.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use super::{decode_reply, EngineSession, Result};
use crate::protocol::{
    ChatMessage, CompletionRequest, CompletionResult, Reply, RpcRequest, StateRequest,
    StateResult, TokenizeRequest, TokenizeResult,
};

impl EngineSession {
    pub fn tokenize(&mut self, text: &str) -> Result<Reply<TokenizeResult>> {
        let request = serde_json::to_string(&TokenizeRequest {
            text: text.to_string(),
        })?;
        let response = self.tokenize_raw(&request)?;
        decode_reply("tokenize", &response)
    }

    pub fn tokenize_raw(&mut self, request: &str) -> Result<String> {
        Ok(self.backend.tokenize(request)?)
    }

    /// Run a completion to the end. No partial output is observable.
    pub fn get_completion(&mut self, request: &CompletionRequest) -> Result<Reply<CompletionResult>> {
        let request = serde_json::to_string(request)?;
        let response = self.get_completion_raw(&request)?;
        let reply: Reply<CompletionResult> = decode_reply("get_completion", &response)?;
        if let Reply::Ok(result) = &reply {
            debug!(
                tokens_predicted = result.tokens_predicted,
                stop_reason = ?result.stop_reason(),
                "Completion finished"
            );
        }
        Ok(reply)
    }

    pub fn get_completion_raw(&mut self, request: &str) -> Result<String> {
        Ok(self.backend.get_completion(request)?)
    }

    /// Generic `{method, path, body}` passthrough to an engine route.
    pub fn rpc_call(&mut self, request: &RpcRequest) -> Result<Reply<Value>> {
        debug!(method = %request.method, path = %request.path, "RPC call");
        let request = serde_json::to_string(request)?;
        let response = self.rpc_call_raw(&request)?;
        decode_reply("rpc_call", &response)
    }

    pub fn rpc_call_raw(&mut self, request: &str) -> Result<String> {
        Ok(self.backend.rpc_call(request)?)
    }

    /// `POST /v1/chat/completions` with the given messages.
    pub fn chat(&mut self, messages: Vec<ChatMessage>) -> Result<Reply<Value>> {
        let request = RpcRequest::chat(messages)?;
        self.rpc_call(&request)
    }

    /// Persist the engine's evaluation state to a file.
    pub fn save_state(&mut self, filename: &Path) -> Result<Reply<StateResult>> {
        let request = serde_json::to_string(&StateRequest {
            filename: filename.to_path_buf(),
        })?;
        let response = self.save_state_raw(&request)?;
        decode_reply("save_state", &response)
    }

    pub fn save_state_raw(&mut self, request: &str) -> Result<String> {
        Ok(self.backend.save_state(request)?)
    }

    /// Restore evaluation state written by [`save_state`](Self::save_state).
    pub fn load_state(&mut self, filename: &Path) -> Result<Reply<StateResult>> {
        let request = serde_json::to_string(&StateRequest {
            filename: filename.to_path_buf(),
        })?;
        let response = self.load_state_raw(&request)?;
        decode_reply("load_state", &response)
    }

    pub fn load_state_raw(&mut self, request: &str) -> Result<String> {
        Ok(self.backend.load_state(request)?)
    }
}

/// Assistant text from an OpenAI-style chat completion response.
pub fn chat_content(response: &Value) -> Option<&str> {
    response
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}
