use crate::Credentials;

pub mod login;
pub mod plain;

pub use login::Login;
pub use plain::Plain;

/// Mechanism names served without registration.
pub const BUILTINS: &[&str] = &["LOGIN", "PLAIN"];

/// Constructor for a pluggable mechanism, keyed by mechanism name in the
/// server configuration.
pub type Factory = fn() -> Box<dyn Exchange>;

/// Next move of a mechanism after eating a client response.
pub enum Step {
    /// Send another challenge (raw, not yet base64-encoded).
    Challenge(Vec<u8>),
    /// The exchange is complete; validate these credentials.
    Done(Credentials),
}

#[derive(Debug, thiserror::Error)]
pub enum MechanismError {
    #[error("can't decode response")]
    Decode,
}

/// One server-side SASL exchange.
///
/// The transport, base64 framing, and `*` cancellation live in the server;
/// a mechanism only sees decoded client responses.
pub trait Exchange: Send {
    /// Challenge sent before any client response has been read. Empty for
    /// client-first mechanisms such as PLAIN.
    fn initial(&self) -> Vec<u8> {
        Vec::new()
    }

    fn eat(&mut self, response: &[u8]) -> Result<Step, MechanismError>;
}

/// Instantiate a built-in mechanism by name.
pub fn builtin(name: &str) -> Option<Box<dyn Exchange>> {
    match name {
        "PLAIN" => Some(Box::new(Plain::default())),
        "LOGIN" => Some(Box::new(Login::default())),
        _ => None,
    }
}
