//! # telcon-core
//!
//! Single-connection Telnet command console with live log redirection.
//!
//! This crate contains:
//! - **Telnet**: `TelnetFilter`, the IAC control sequence stripper
//! - **Codec**: `LineAssembler` and `ConsoleCodec`, bounded CR/LF line framing
//! - **Sink**: `SinkRegistry`, the swappable process-wide log output slot,
//!   and `ConnectionSink` which mirrors log records onto the connection
//! - **Session**: `Session` / `Console`, built-in command dispatch and the
//!   per-connection loop
//! - **Server**: `Acceptor`, bind / listen / accept one peer
//! - **Error**: `TelconError`: typed, `thiserror`-based error hierarchy

pub mod codec;
pub mod error;
pub mod server;
pub mod session;
pub mod sink;
pub mod telnet;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{ConsoleCodec, ConsoleFrame, DEFAULT_MAX_LINE_LEN, LineAssembler};
pub use error::TelconError;
pub use server::{Acceptor, DEFAULT_PORT, LISTEN_BACKLOG, serve_once};
pub use session::{
    CommandHandler, Console, ConsoleMode, DEFAULT_PROMPT, Dispatch, QUIT_CONSOLE, QUIT_TELNET,
    ReadErrorPolicy, START_CONSOLE, Session, SessionConfig, SessionEnd, SessionReport,
    SessionStats, SharedHandler,
};
pub use sink::{
    ConnectionSink, ConsoleClaim, DEFAULT_LOG_BUFFER_SIZE, DEFAULT_OUTBOUND_QUEUE_LEN, LogSink,
    MemorySink, Outbound, SharedSink, SinkRegistry, StderrSink,
};
pub use telnet::{FilterState, TelnetFilter};
