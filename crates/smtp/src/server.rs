use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use auth::{sasl, Authenticator};
use line::stream::MaybeTls;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};
use tokio_rustls::rustls;

use crate::handler::Handler;

use self::session::Session;

pub mod session;

/// Whether the engine speaks SMTP (RFC 5321) or LMTP (RFC 2033).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Smtp,
    /// LHLO replaces HELO/EHLO and DATA answers once per recipient.
    Lmtp,
}

/// Per-session cap on command invocations. Exceeding a limit answers 421
/// and closes the connection.
#[derive(Debug, Clone)]
pub enum CallLimit {
    /// The same cap for every command.
    Uniform(usize),
    /// Per-verb caps; the `"*"` entry applies to unlisted verbs, falling
    /// back to a built-in default without one.
    PerCommand(HashMap<String, usize>),
}

impl CallLimit {
    pub(crate) fn for_verb(&self, verb: &str) -> usize {
        match self {
            Self::Uniform(limit) => *limit,
            Self::PerCommand(limits) => limits
                .get(verb)
                .or_else(|| limits.get("*"))
                .copied()
                .unwrap_or(crate::CALL_LIMIT_DEFAULT),
        }
    }
}

/// Engine options, shared by every session of a [`Server`].
#[derive(Clone)]
pub struct Config {
    /// Name used in the greeting and error replies.
    pub hostname: String,
    /// Product string appended to the greeting.
    pub ident: String,
    /// Maximum message size in octets, advertised via SIZE.
    pub data_size_limit: usize,
    /// Maximum command or payload line length, CRLF included.
    pub line_length_limit: usize,
    /// Advertise SMTPUTF8 and allow UTF-8 in commands and replies.
    pub enable_smtputf8: bool,
    /// Decode `envelope.content` to text instead of keeping raw bytes.
    pub decode_data: bool,
    /// TLS configuration; STARTTLS is only advertised when present.
    pub tls: Option<Arc<rustls::ServerConfig>>,
    /// Answer 530 to most commands until STARTTLS succeeds.
    pub require_starttls: bool,
    /// Idle time allowed between commands.
    pub timeout: Duration,
    /// Gate MAIL/RCPT/DATA and friends on authentication.
    pub auth_required: bool,
    /// Refuse AUTH on unencrypted connections.
    pub auth_require_tls: bool,
    /// Mechanism names never advertised or accepted.
    pub auth_exclude_mechanism: HashSet<String>,
    /// Credential validation; AUTH is only advertised when present.
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Additional SASL mechanisms, keyed by name.
    pub mechanisms: HashMap<String, sasl::Factory>,
    /// Per-session command caps; `None` is unlimited.
    pub command_call_limit: Option<CallLimit>,
    /// Consecutive AUTH failures tolerated before a 421.
    pub auth_max_failures: usize,
    /// Await a PROXY protocol preamble before greeting.
    pub proxy_protocol_timeout: Option<Duration>,
    pub protocol: Protocol,
    /// Flipping the channel to `true` ends every session at its next
    /// command boundary with a 421.
    pub shutdown: Option<watch::Receiver<bool>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_owned(),
            ident: concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")).to_owned(),
            data_size_limit: crate::DATA_SIZE_LIMIT,
            line_length_limit: crate::LINE_LIMIT,
            enable_smtputf8: false,
            decode_data: false,
            tls: None,
            require_starttls: false,
            timeout: Duration::from_secs(300),
            auth_required: false,
            auth_require_tls: true,
            auth_exclude_mechanism: HashSet::new(),
            authenticator: None,
            mechanisms: HashMap::new(),
            command_call_limit: None,
            auth_max_failures: 3,
            proxy_protocol_timeout: None,
            protocol: Protocol::Smtp,
            shutdown: None,
        }
    }
}

impl Config {
    /// Mechanism names to advertise, built-ins and registered ones minus
    /// the excluded set.
    pub(crate) fn mechanism_names(&self) -> Vec<String> {
        let mut names: Vec<String> = sasl::BUILTINS
            .iter()
            .map(|name| (*name).to_owned())
            .chain(self.mechanisms.keys().cloned())
            .filter(|name| !self.auth_exclude_mechanism.contains(name))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub(crate) fn make_mechanism(&self, name: &str) -> Option<Box<dyn sasl::Exchange>> {
        if self.auth_exclude_mechanism.contains(name) {
            return None;
        }
        match self.mechanisms.get(name) {
            Some(factory) => Some(factory()),
            None => sasl::builtin(name),
        }
    }
}

pub struct Server<H> {
    config: Config,
    handler: Arc<H>,
}

impl<H: Handler> Server<H> {
    pub fn new(config: Config, handler: H) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
        }
    }

    /// Start a session on an accepted connection. `peer` is only used for
    /// logging and the session state.
    pub fn accept<IO: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: impl Into<MaybeTls<IO>>,
        peer: impl Into<String>,
    ) -> Session<IO, H> {
        Session::new(stream, peer.into(), self.config.clone(), self.handler.clone())
    }
}
