//! Shell command parsing.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("Unknown command `{0}` (try `help`)")]
    Unknown(String),

    #[error("`{0}` needs an argument")]
    MissingArgument(&'static str),

    #[error("`{0}` takes no argument")]
    UnexpectedArgument(&'static str),
}

/// A command argument: either a literal JSON request or plain text that the
/// shell turns into one.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(String),
    Text(String),
}

impl Payload {
    fn parse(arg: &str) -> Self {
        let arg = arg.trim();
        if arg.starts_with('{') {
            Payload::Json(arg.to_string())
        } else {
            Payload::Text(arg.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Load a model; text is a model path.
    Init(Payload),
    InitAsync(Payload),
    Status,
    /// Poll until the model is loaded.
    Wait,
    /// Text is tokenized as-is.
    Tokenize(Payload),
    /// Text is wrapped as a ChatML user turn.
    Complete(Payload),
    AsyncInit(Payload),
    AsyncPoll,
    AsyncCancel,
    /// Poll until the running async completion finishes.
    AsyncWait,
    /// Start an async completion and print it as it arrives.
    Stream(Payload),
    Chat(String),
    Rpc(String),
    /// Text is a state file path.
    SaveState(Payload),
    LoadState(Payload),
    Deinit,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands (JSON arguments are sent verbatim):
  init <model-path | json>        load a model and block until done
  init_async <model-path | json>  start loading a model
  status                          poll system status
  wait                            poll status until the model is loaded
  tokenize <text | json>          tokenize text
  complete <prompt | json>        blocking completion (prompt becomes a ChatML user turn)
  async_init <prompt | json>      start an async completion
  async_poll                      fetch pending completion updates
  async_cancel                    cancel the running async completion
  async_wait                      poll until the async completion finishes
  stream <prompt | json>          async completion printed as it is generated
  chat <message>                  POST /v1/chat/completions through rpc_call
  rpc <json>                      raw rpc_call with {method, path, body}
  save_state <path | json>        save engine state
  load_state <path | json>        load engine state
  deinit                          release the model
  help                            show this text
  quit                            leave the shell";

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (verb, arg) = match line.split_once(char::is_whitespace) {
        Some((verb, arg)) => (verb, arg.trim()),
        None => (line, ""),
    };

    let need = |name: &'static str| required(arg, name);
    let none = |name: &'static str, cmd: Command| no_argument(arg, name, cmd);

    let cmd = match verb {
        "init" => Command::Init(Payload::parse(need("init")?)),
        "init_async" => Command::InitAsync(Payload::parse(need("init_async")?)),
        "status" => none("status", Command::Status)?,
        "wait" => none("wait", Command::Wait)?,
        "tokenize" => Command::Tokenize(Payload::parse(need("tokenize")?)),
        "complete" => Command::Complete(Payload::parse(need("complete")?)),
        "async_init" => Command::AsyncInit(Payload::parse(need("async_init")?)),
        "async_poll" => none("async_poll", Command::AsyncPoll)?,
        "async_cancel" => none("async_cancel", Command::AsyncCancel)?,
        "async_wait" => none("async_wait", Command::AsyncWait)?,
        "stream" => Command::Stream(Payload::parse(need("stream")?)),
        "chat" => Command::Chat(need("chat")?.to_string()),
        "rpc" => Command::Rpc(need("rpc")?.to_string()),
        "save_state" => Command::SaveState(Payload::parse(need("save_state")?)),
        "load_state" => Command::LoadState(Payload::parse(need("load_state")?)),
        "deinit" => none("deinit", Command::Deinit)?,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(cmd))
}

fn required<'a>(arg: &'a str, name: &'static str) -> Result<&'a str, CommandError> {
    if arg.is_empty() {
        Err(CommandError::MissingArgument(name))
    } else {
        Ok(arg)
    }
}

fn no_argument(arg: &str, name: &'static str, cmd: Command) -> Result<Command, CommandError> {
    if arg.is_empty() {
        Ok(cmd)
    } else {
        Err(CommandError::UnexpectedArgument(name))
    }
}
