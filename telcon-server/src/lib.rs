//! # telcon-server: Telnet command console service
//!
//! Listens for a single Telnet client, strips the option negotiation the
//! client sends, and runs its command lines against the application command
//! set. `start_console` mirrors the server's own log onto the connection.
//!
//! ## Built-in commands
//!
//! - `start_console`: mirror the log to this client, prompt after each command
//! - `quit_console`: stop mirroring
//! - `quit_telnet`: end the session

pub mod commands;
pub mod config;
