//! Asynchronous, extensible SMTP and LMTP server engine.
//!
//! The engine drives one [`server::session::Session`] per accepted
//! connection: it frames commands, tracks protocol state, reads message
//! payloads, performs STARTTLS upgrades and SASL exchanges, and calls back
//! into an application [`Handler`] at every protocol checkpoint.

#![warn(clippy::pedantic)]

pub mod command;
pub mod ehlo;
pub mod handler;
pub mod message;
pub mod proxy;
pub mod server;

pub use handler::Handler;
pub use message::Envelope;
pub use server::{Config, Server};

mod io;

/// Default maximum number of octets in a command line, CRLF included
/// (RFC 5321 section 4.5.3.1.6 plus room for the terminator).
pub const LINE_LIMIT: usize = 1001;

/// Default maximum message size in octets, advertised via SIZE.
pub const DATA_SIZE_LIMIT: usize = 33_554_432;

/// Call limit for commands without an explicit entry in a per-command
/// limit table.
pub(crate) const CALL_LIMIT_DEFAULT: usize = 20;

/// Unrecognized commands tolerated before a successful greeting.
pub(crate) const UNRECOGNIZED_LIMIT: usize = 25;
