//! Engine library loaded at runtime.
//!
//! The library exports plain C functions that take and return NUL-terminated
//! UTF-8 strings:
//!
//! ```text
//! int         init(const char *config);
//! void        init_async(const char *config);
//! const char *poll_system_status(void);
//! const char *tokenize(const char *req);
//! const char *get_completion(const char *req);
//! const char *async_completion_init(const char *req);
//! const char *async_completion_poll(const char *cmd);
//! const char *async_completion_cancel(const char *cmd);
//! const char *save_state(const char *req);      // optional
//! const char *load_state(const char *req);      // optional
//! const char *rpc_call(const char *req);
//! void        deinit(void);
//! ```
//!
//! Returned strings are owned by the library and stay valid until the next
//! call; they are copied out immediately and never freed here.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use libloading::{Library, Symbol};
use tracing::{debug, info};

use super::{EngineBackend, TransportError};

type InitFn = unsafe extern "C" fn(*const c_char) -> c_int;
type InitAsyncFn = unsafe extern "C" fn(*const c_char);
type StatusFn = unsafe extern "C" fn() -> *const c_char;
type TextFn = unsafe extern "C" fn(*const c_char) -> *const c_char;
type VoidFn = unsafe extern "C" fn();

/// Set while a [`NativeLibrary`] is alive. The engine keeps one model per
/// process, so at most one handle may own it.
static LIBRARY_OPEN: AtomicBool = AtomicBool::new(false);

struct ProcessClaim;

impl ProcessClaim {
    fn acquire() -> Result<Self, TransportError> {
        LIBRARY_OPEN
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ProcessClaim)
            .map_err(|_| TransportError::AlreadyOpen)
    }
}

impl Drop for ProcessClaim {
    fn drop(&mut self) {
        LIBRARY_OPEN.store(false, Ordering::Release);
    }
}

struct Functions {
    init: InitFn,
    init_async: InitAsyncFn,
    poll_system_status: StatusFn,
    tokenize: TextFn,
    get_completion: TextFn,
    async_completion_init: TextFn,
    async_completion_poll: TextFn,
    async_completion_cancel: TextFn,
    save_state: Option<TextFn>,
    load_state: Option<TextFn>,
    rpc_call: TextFn,
    deinit: VoidFn,
}

/// Exclusive handle to the engine library.
pub struct NativeLibrary {
    functions: Functions,
    // Field order matters: the library is unloaded before the claim is released.
    _library: Library,
    _claim: ProcessClaim,
}

impl NativeLibrary {
    /// Load the library and resolve its exported calls.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let claim = ProcessClaim::acquire()?;

        // SAFETY: loading runs the library's initializers; the engine library
        // is trusted.
        let library = unsafe { Library::new(path) }.map_err(|e| TransportError::LibraryLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let functions = Self::load_functions(&library)?;

        info!(
            path = %path.display(),
            save_state = functions.save_state.is_some(),
            load_state = functions.load_state.is_some(),
            "Engine library loaded"
        );

        Ok(Self {
            functions,
            _library: library,
            _claim: claim,
        })
    }

    fn load_functions(library: &Library) -> Result<Functions, TransportError> {
        // SAFETY: the signatures below match the engine's C API. The copied
        // function pointers stay valid while `library` is loaded, and
        // `NativeLibrary` keeps it loaded for as long as it holds them.
        unsafe {
            Ok(Functions {
                init: required::<InitFn>(library, "init", b"init\0")?,
                init_async: required::<InitAsyncFn>(library, "init_async", b"init_async\0")?,
                poll_system_status: required::<StatusFn>(
                    library,
                    "poll_system_status",
                    b"poll_system_status\0",
                )?,
                tokenize: required::<TextFn>(library, "tokenize", b"tokenize\0")?,
                get_completion: required::<TextFn>(library, "get_completion", b"get_completion\0")?,
                async_completion_init: required::<TextFn>(
                    library,
                    "async_completion_init",
                    b"async_completion_init\0",
                )?,
                async_completion_poll: required::<TextFn>(
                    library,
                    "async_completion_poll",
                    b"async_completion_poll\0",
                )?,
                async_completion_cancel: required::<TextFn>(
                    library,
                    "async_completion_cancel",
                    b"async_completion_cancel\0",
                )?,
                save_state: optional::<TextFn>(library, b"save_state\0"),
                load_state: optional::<TextFn>(library, b"load_state\0"),
                rpc_call: required::<TextFn>(library, "rpc_call", b"rpc_call\0")?,
                deinit: required::<VoidFn>(library, "deinit", b"deinit\0")?,
            })
        }
    }

    fn text_call(
        &self,
        call: &'static str,
        f: TextFn,
        input: &str,
    ) -> Result<String, TransportError> {
        let arg = encode(call, input)?;
        debug!(call, request_len = input.len(), "Engine call");
        // SAFETY: `arg` outlives the call and `f` was resolved from the live library.
        let ptr = unsafe { f(arg.as_ptr()) };
        let out = decode(call, ptr)?;
        debug!(call, response_len = out.len(), "Engine returned");
        Ok(out)
    }
}

unsafe fn required<T: Copy>(
    library: &Library,
    name: &'static str,
    symbol: &[u8],
) -> Result<T, TransportError> {
    let sym: Symbol<T> = library
        .get(symbol)
        .map_err(|_| TransportError::MissingSymbol(name))?;
    Ok(*sym)
}

unsafe fn optional<T: Copy>(library: &Library, symbol: &[u8]) -> Option<T> {
    library.get::<T>(symbol).ok().map(|sym| *sym)
}

fn encode(call: &'static str, text: &str) -> Result<CString, TransportError> {
    CString::new(text).map_err(|e| TransportError::Encoding {
        call,
        reason: e.to_string(),
    })
}

fn decode(call: &'static str, ptr: *const c_char) -> Result<String, TransportError> {
    if ptr.is_null() {
        return Err(TransportError::NullResponse(call));
    }
    // SAFETY: non-null and NUL-terminated per the engine's contract.
    let raw = unsafe { CStr::from_ptr(ptr) };
    raw.to_str()
        .map(str::to_owned)
        .map_err(|e| TransportError::Encoding {
            call,
            reason: e.to_string(),
        })
}

impl EngineBackend for NativeLibrary {
    fn init(&self, config: &str) -> Result<i32, TransportError> {
        let arg = encode("init", config)?;
        debug!(call = "init", request_len = config.len(), "Engine call");
        // SAFETY: see `text_call`.
        let rc = unsafe { (self.functions.init)(arg.as_ptr()) };
        Ok(rc)
    }

    fn init_async(&self, config: &str) -> Result<(), TransportError> {
        let arg = encode("init_async", config)?;
        debug!(call = "init_async", request_len = config.len(), "Engine call");
        // SAFETY: see `text_call`.
        unsafe { (self.functions.init_async)(arg.as_ptr()) };
        Ok(())
    }

    fn poll_system_status(&self) -> Result<String, TransportError> {
        // SAFETY: no arguments; the pointer is checked by `decode`.
        let ptr = unsafe { (self.functions.poll_system_status)() };
        decode("poll_system_status", ptr)
    }

    fn tokenize(&self, request: &str) -> Result<String, TransportError> {
        self.text_call("tokenize", self.functions.tokenize, request)
    }

    fn get_completion(&self, request: &str) -> Result<String, TransportError> {
        self.text_call("get_completion", self.functions.get_completion, request)
    }

    fn async_completion_init(&self, request: &str) -> Result<String, TransportError> {
        self.text_call(
            "async_completion_init",
            self.functions.async_completion_init,
            request,
        )
    }

    fn async_completion_poll(&self, command: &str) -> Result<String, TransportError> {
        self.text_call(
            "async_completion_poll",
            self.functions.async_completion_poll,
            command,
        )
    }

    fn async_completion_cancel(&self, command: &str) -> Result<String, TransportError> {
        self.text_call(
            "async_completion_cancel",
            self.functions.async_completion_cancel,
            command,
        )
    }

    fn save_state(&self, request: &str) -> Result<String, TransportError> {
        let f = self
            .functions
            .save_state
            .ok_or(TransportError::MissingSymbol("save_state"))?;
        self.text_call("save_state", f, request)
    }

    fn load_state(&self, request: &str) -> Result<String, TransportError> {
        let f = self
            .functions
            .load_state
            .ok_or(TransportError::MissingSymbol("load_state"))?;
        self.text_call("load_state", f, request)
    }

    fn rpc_call(&self, request: &str) -> Result<String, TransportError> {
        self.text_call("rpc_call", self.functions.rpc_call, request)
    }

    fn deinit(&self) -> Result<(), TransportError> {
        debug!(call = "deinit", "Engine call");
        // SAFETY: no arguments; the engine treats repeated deinit as a no-op.
        unsafe { (self.functions.deinit)() };
        Ok(())
    }
}
