//! prise - a scriptable terminal multiplexer.
//!
//! A background server owns pseudo-terminals and drives layout and
//! input-routing policy through a user Lua script; clients attach over a
//! unix socket speaking MessagePack-RPC and receive screen frames.
//!
//! # Architecture
//!
//! - **Server** - single-threaded reactor core: owns sessions, clients,
//!   render scheduling, script dispatch
//! - **Reactor** - submit-and-callback I/O over readiness polling, with
//!   a mock backend for tests
//! - **PTY** - session plumbing: master handle, per-session reader
//!   worker, dirty-pipe signalling
//! - **RPC** - MessagePack-RPC codec and per-client session state
//! - **Script** - the mlua bridge: events in, deferred actions out
//!
//! # Modules
//!
//! - [`server`] - event core, session manager, frame scheduler
//! - [`reactor`] - the uniform async op interface and its backends
//! - [`rpc`] - wire codec and client session state
//! - [`pty`] / [`term`] - PTY handling and terminal emulation
//! - [`script`] - Lua runtime and primitives
//! - [`keys`] - structured key events and their byte encoding
//! - [`config`] - configuration loading

pub mod config;
pub mod keys;
pub mod pty;
pub mod reactor;
pub mod rpc;
pub mod script;
pub mod server;
pub mod term;

// Re-export commonly used types
pub use config::Config;
pub use keys::KeyEvent;
pub use pty::SpawnOptions;
pub use rpc::{Message, MessageDecoder};
pub use server::Server;
pub use term::Frame;
