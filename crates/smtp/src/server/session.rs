use std::{collections::HashMap, sync::Arc};

use auth::{sasl, AuthData, Verdict};
use base64::Engine;
use line::{read_line, stream::MaybeTls, Connection, ReadLineError};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, instrument, warn};

use crate::{
    command::{self, Command, Error as CommandError},
    ehlo::{self, Extensions},
    handler::{Handler, HookError},
    io::bye,
    message::{
        bdat::{discard_chunk, read_chunk},
        data::read_data,
        Body, Envelope,
    },
    proxy::{self, ProxyInfo},
    server::{Config, Protocol},
};

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Longest reply line the engine will emit, CRLF excluded.
const REPLY_LIMIT: usize = 510;

/// Per-connection state that outlives individual messages. Handed to
/// every hook; reset by STARTTLS, partially reset by HELO/EHLO.
#[derive(Default)]
pub struct SessionState {
    /// Peer address as reported by the listener.
    pub peer: String,
    /// Name the client announced in HELO/EHLO/LHLO.
    pub host_name: Option<String>,
    /// The greeting was EHLO or LHLO rather than HELO.
    pub extended: bool,
    /// TLS is established, either implicitly or via STARTTLS.
    pub tls: bool,
    pub authenticated: bool,
    /// Whatever a successful authenticator attached.
    pub auth_data: Option<AuthData>,
    /// Decoded PROXY preamble, when enabled.
    pub proxy_data: Option<ProxyInfo>,
    pub(crate) command_calls: HashMap<String, usize>,
    pub(crate) unrecognized: usize,
    pub(crate) auth_failures: usize,
}

impl SessionState {
    fn new(peer: String, tls: bool) -> Self {
        Self {
            peer,
            tls,
            ..Self::default()
        }
    }

    /// Times `verb` has been invoked this session.
    pub fn calls(&self, verb: &str) -> usize {
        self.command_calls.get(verb).copied().unwrap_or(0)
    }
}

enum Flow {
    Continue,
    Close,
}

enum Input {
    /// A complete line is in the caller's buffer.
    Line,
    Eof,
    TooLong,
    TimedOut,
    Shutdown,
}

/// One SMTP/LMTP session over an accepted connection.
pub struct Session<IO: AsyncRead + AsyncWrite + Unpin, H: Handler> {
    connection: Connection<IO>,
    state: SessionState,
    envelope: Envelope,
    config: Config,
    handler: Arc<H>,
}

impl<IO: AsyncRead + AsyncWrite + Unpin, H: Handler> Session<IO, H> {
    pub fn new(
        stream: impl Into<MaybeTls<IO>>,
        peer: String,
        config: Config,
        handler: Arc<H>,
    ) -> Self {
        let connection = Connection::new(stream);
        let tls = connection.is_tls();
        Self {
            connection,
            state: SessionState::new(peer, tls),
            envelope: Envelope::default(),
            config,
            handler,
        }
    }

    /// Run the protocol engine until the connection ends.
    ///
    /// Errors are transport failures; the peer gets no goodbye for those.
    #[instrument(skip_all, fields(peer = %self.state.peer))]
    pub async fn serve(mut self) -> std::io::Result<()> {
        if let Some(wait) = self.config.proxy_protocol_timeout {
            let preamble = timeout(wait, proxy::read_preamble(self.connection.stream_mut()));
            match preamble.await {
                Ok(Ok(info)) => {
                    debug!(?info, "proxy preamble");
                    self.state.proxy_data = Some(info);
                }
                Ok(Err(e)) => {
                    warn!(%e, "rejecting connection: bad proxy preamble");
                    return Ok(());
                }
                Err(_) => {
                    warn!("rejecting connection: no proxy preamble");
                    return Ok(());
                }
            }
        }

        let greeting = format!("220 {} {}", self.config.hostname, self.config.ident);
        self.push(greeting).await?;

        loop {
            match self.step().await? {
                Flow::Continue => {}
                Flow::Close => return Ok(()),
            }
        }
    }

    async fn step(&mut self) -> std::io::Result<Flow> {
        let mut buf = Vec::new();
        match self.next_line(&mut buf).await? {
            Input::Line => {}
            Input::Eof => return Ok(Flow::Close),
            Input::TooLong => return self.finish("500 Command line too long").await,
            Input::TimedOut => return self.timed_out().await,
            Input::Shutdown => return self.shutting_down().await,
        }

        let cmd = match Command::parse(&buf, self.config.enable_smtputf8) {
            Ok(cmd) => cmd,
            Err(CommandError::NonAscii) => {
                return self.finish("500 Error: strict ASCII required").await;
            }
            Err(CommandError::Syntax { verb, usage }) => {
                if let Some(flow) = self.count_call(verb).await? {
                    return Ok(flow);
                }
                return self.finish(format!("501 Syntax: {usage}")).await;
            }
            Err(CommandError::Unrecognized { verb, args }) => {
                return self.unrecognized(&verb, &args).await;
            }
        };

        self.dispatch(cmd).await
    }

    async fn dispatch(&mut self, cmd: Command) -> std::io::Result<Flow> {
        let verb = cmd.verb();
        if let Some(flow) = self.count_call(verb).await? {
            return Ok(flow);
        }

        // LMTP swaps the greeting verbs (RFC 2033 section 4.1)
        match (self.config.protocol, &cmd) {
            (Protocol::Lmtp, Command::Helo { .. } | Command::Ehlo { .. }) => {
                let status = format!("500 Error: command \"{verb}\" not recognized (send LHLO)");
                return self.finish(status).await;
            }
            (Protocol::Smtp, Command::Lhlo { domain }) => {
                let domain = domain.clone();
                return self.unrecognized("LHLO", &domain).await;
            }
            _ => {}
        }

        if self.state.host_name.is_none()
            && !matches!(
                cmd,
                Command::Helo { .. }
                    | Command::Ehlo { .. }
                    | Command::Lhlo { .. }
                    | Command::Noop { .. }
                    | Command::Quit
                    | Command::Rset
                    | Command::Help { .. }
            )
        {
            return self.finish("503 Error: send HELO first").await;
        }

        if self.config.require_starttls
            && !self.state.tls
            && !matches!(
                cmd,
                Command::Ehlo { .. }
                    | Command::Lhlo { .. }
                    | Command::Noop { .. }
                    | Command::Quit
                    | Command::Rset
                    | Command::Starttls
            )
        {
            return self.finish("530 Must issue a STARTTLS command first").await;
        }

        if self.config.auth_required
            && !self.state.authenticated
            && matches!(
                cmd,
                Command::Help { .. }
                    | Command::Mail { .. }
                    | Command::Rcpt { .. }
                    | Command::Data
                    | Command::Bdat { .. }
                    | Command::Vrfy { .. }
                    | Command::Expn { .. }
            )
        {
            return self.finish("530 5.7.0 Authentication required").await;
        }

        match cmd {
            Command::Helo { domain } => self.helo(domain).await,
            Command::Ehlo { domain } | Command::Lhlo { domain } => self.ehlo(domain).await,
            Command::Mail { from, params } => self.mail(from, params).await,
            Command::Rcpt { to, params } => self.rcpt(to, params).await,
            Command::Data => self.data().await,
            Command::Bdat { size, last } => self.bdat(size, last).await,
            Command::Rset => self.rset().await,
            Command::Noop { arg } => {
                let result = self.handler.noop(&mut self.state, &arg).await;
                self.settle(result, "250 OK").await
            }
            Command::Quit => self.quit().await,
            Command::Help { arg } => self.help(&arg).await,
            Command::Vrfy { arg } => {
                let result = self.handler.vrfy(&mut self.state, &arg).await;
                self.settle(result, "252 Cannot VRFY user, but will accept message")
                    .await
            }
            Command::Expn { arg } => {
                let result = self.handler.expn(&mut self.state, &arg).await;
                self.settle(result, "502 EXPN not implemented").await
            }
            Command::Starttls => self.starttls().await,
            Command::Auth {
                mechanism,
                initial_response,
            } => self.auth(mechanism, initial_response).await,
        }
    }

    async fn helo(&mut self, domain: String) -> std::io::Result<Flow> {
        self.envelope.clear();
        match self.handler.helo(&mut self.state, &domain).await {
            Err(e) => self.hook_failed(e).await,
            Ok(Some(status)) => self.finish(status).await,
            Ok(None) => {
                self.state.host_name = Some(domain);
                self.state.extended = false;
                let status = format!("250 {}", self.config.hostname);
                self.finish(status).await
            }
        }
    }

    async fn ehlo(&mut self, domain: String) -> std::io::Result<Flow> {
        self.envelope.clear();
        self.state.host_name = Some(domain.clone());
        self.state.extended = true;

        let mut extensions = Extensions::_8BITMIME | Extensions::CHUNKING;
        if self.config.enable_smtputf8 {
            extensions |= Extensions::SMTPUTF8;
        }
        if self.config.tls.is_some() && !self.state.tls {
            extensions |= Extensions::STARTTLS;
        }

        let mut lines = ehlo::Response {
            domain: self.config.hostname.clone(),
            extensions,
            size: self.config.data_size_limit,
            auth: if self.auth_permitted() {
                self.config.mechanism_names()
            } else {
                Vec::new()
            },
        }
        .lines();

        match self.handler.ehlo(&mut self.state, &domain, &mut lines).await {
            Err(e) => self.hook_failed(e).await,
            Ok(Some(status)) => self.finish(status).await,
            Ok(None) => {
                lines.push("HELP".to_owned());
                self.finish(ehlo::render(250, &lines)).await
            }
        }
    }

    fn auth_permitted(&self) -> bool {
        self.config.authenticator.is_some() && (!self.config.auth_require_tls || self.state.tls)
    }

    async fn mail(
        &mut self,
        from: Option<email_address::EmailAddress>,
        params: Vec<String>,
    ) -> std::io::Result<Flow> {
        if self.envelope.in_progress() {
            return self.finish("503 Error: nested MAIL command").await;
        }
        if !self.state.extended && !params.is_empty() {
            return self.finish("501 Syntax: MAIL FROM: <address>").await;
        }

        let mut smtp_utf8 = false;
        for param in &params {
            let (key, value) = param
                .split_once('=')
                .map_or((param.as_str(), None), |(k, v)| (k, Some(v)));

            match key.to_ascii_uppercase().as_str() {
                "SIZE" => {
                    let Some(declared) = value.and_then(|v| v.parse::<usize>().ok()) else {
                        return self.finish("501 Syntax: MAIL FROM: <address>").await;
                    };
                    if declared > self.config.data_size_limit {
                        return self
                            .finish("552 Error: message size exceeds fixed maximum message size")
                            .await;
                    }
                }
                "BODY" => {
                    if !matches!(value, Some("7BIT" | "8BITMIME")) {
                        return self
                            .finish("501 Error: BODY can only be one of 7BIT, 8BITMIME")
                            .await;
                    }
                }
                "SMTPUTF8" => {
                    if value.is_some() {
                        return self.finish("501 Error: SMTPUTF8 takes no arguments").await;
                    }
                    if !self.config.enable_smtputf8 {
                        return self.finish("501 Error: SMTPUTF8 disabled").await;
                    }
                    smtp_utf8 = true;
                }
                _ => {
                    return self
                        .finish("555 MAIL FROM parameters not recognized or not implemented")
                        .await;
                }
            }
        }

        let address = from.map(|a| a.to_string()).unwrap_or_default();
        match self
            .handler
            .mail(&mut self.state, &mut self.envelope, &address, &params)
            .await
        {
            Err(e) => self.hook_failed(e).await,
            Ok(Some(status)) => self.finish(status).await,
            Ok(None) => {
                debug!(?address, "sender ok");
                self.envelope.mail_from = Some(address);
                self.envelope.mail_options = params;
                self.envelope.smtp_utf8 = smtp_utf8;
                self.finish("250 OK").await
            }
        }
    }

    async fn rcpt(
        &mut self,
        to: email_address::EmailAddress,
        params: Vec<String>,
    ) -> std::io::Result<Flow> {
        if !self.envelope.in_progress() {
            return self.finish("503 Error: need MAIL command").await;
        }
        if !self.state.extended && !params.is_empty() {
            return self.finish("501 Syntax: RCPT TO: <address>").await;
        }
        // no RCPT extensions are implemented
        if !params.is_empty() {
            return self
                .finish("555 RCPT TO parameters not recognized or not implemented")
                .await;
        }

        let address = to.to_string();
        match self
            .handler
            .rcpt(&mut self.state, &mut self.envelope, &address, &params)
            .await
        {
            Err(e) => self.hook_failed(e).await,
            Ok(Some(status)) => self.finish(status).await,
            Ok(None) => {
                debug!(?address, "recipient ok");
                self.envelope.rcpt_tos.push(address);
                self.envelope.rcpt_options.push(params);
                self.finish("250 OK").await
            }
        }
    }

    async fn data(&mut self) -> std::io::Result<Flow> {
        if self.envelope.rcpt_tos.is_empty() {
            let status = if self.envelope.in_progress() {
                "503 Error: need RCPT command"
            } else {
                "503 Error: need MAIL command"
            };
            return self.finish(status).await;
        }

        self.push("354 End data with <CR><LF>.<CR><LF>").await?;

        let payload = match read_data(
            self.connection.stream_mut(),
            self.config.line_length_limit,
            self.config.data_size_limit,
        )
        .await
        {
            Ok(payload) => payload,
            Err(ReadLineError::Io(e)) => return Err(e),
            Err(_) => return Ok(Flow::Close),
        };

        let status = if payload.line_too_long {
            "500 Line too long.".to_owned()
        } else if payload.too_big {
            "552 Error: Too much mail data".to_owned()
        } else {
            self.accept_payload(payload.content).await
        };

        self.finish_transaction(status).await
    }

    async fn bdat(&mut self, size: u64, last: bool) -> std::io::Result<Flow> {
        // the chunk octets follow the command unconditionally, so they
        // must be consumed even when the transaction is refused
        if !self.envelope.in_progress() || self.envelope.rcpt_tos.is_empty() {
            if discard_chunk(self.connection.stream_mut(), size)
                .await
                .is_err()
            {
                return Ok(Flow::Close);
            }
            let status = if self.envelope.in_progress() {
                "503 Error: need RCPT command"
            } else {
                "503 Error: need MAIL command"
            };
            return self.finish(status).await;
        }

        let mut content = Vec::new();
        let mut too_big = false;
        let (mut size, mut last) = (size, last);

        loop {
            // decide before buffering so an oversized chunk cannot grow
            // the transaction past the limit
            let fits = !too_big
                && size <= self.config.data_size_limit as u64 - content.len() as u64;
            let consumed = if fits {
                read_chunk(self.connection.stream_mut(), size, &mut content).await
            } else {
                too_big = true;
                content.clear();
                discard_chunk(self.connection.stream_mut(), size).await
            };
            if consumed.is_err() {
                return Ok(Flow::Close);
            }

            if last {
                break;
            }
            self.push("250 2.6.0 Chunk accepted").await?;

            // only BDAT, RSET, NOOP and QUIT may interleave with chunks
            match self.next_chunk_command().await? {
                ChunkCommand::Bdat(next_size, next_last) => {
                    size = next_size;
                    last = next_last;
                }
                ChunkCommand::Rset => {
                    self.envelope.clear();
                    return self.finish("250 OK").await;
                }
                ChunkCommand::Flow(flow) => return Ok(flow),
            }
        }

        let status = if too_big {
            "552 Error: Too much mail data".to_owned()
        } else {
            self.accept_payload(content).await
        };

        self.finish_transaction(status).await
    }

    async fn next_chunk_command(&mut self) -> std::io::Result<ChunkCommand> {
        loop {
            let mut buf = Vec::new();
            match self.next_line(&mut buf).await? {
                Input::Line => {}
                Input::Eof => return Ok(ChunkCommand::Flow(Flow::Close)),
                Input::TooLong => {
                    self.push("500 Command line too long").await?;
                    continue;
                }
                Input::TimedOut => return self.timed_out().await.map(ChunkCommand::Flow),
                Input::Shutdown => return self.shutting_down().await.map(ChunkCommand::Flow),
            }

            match Command::parse(&buf, self.config.enable_smtputf8) {
                Ok(Command::Bdat { size, last }) => {
                    if let Some(flow) = self.count_call("BDAT").await? {
                        return Ok(ChunkCommand::Flow(flow));
                    }
                    return Ok(ChunkCommand::Bdat(size, last));
                }
                Ok(Command::Rset) => {
                    if let Some(flow) = self.count_call("RSET").await? {
                        return Ok(ChunkCommand::Flow(flow));
                    }
                    return Ok(ChunkCommand::Rset);
                }
                Ok(Command::Quit) => {
                    let flow = self.quit().await?;
                    return Ok(ChunkCommand::Flow(flow));
                }
                Ok(Command::Noop { .. }) => {
                    self.push("250 OK").await?;
                }
                Ok(cmd) => {
                    debug!(verb = cmd.verb(), "unexpected command between chunks");
                    self.push("503 Error: BDAT expected").await?;
                }
                Err(_) => {
                    self.push("503 Error: BDAT expected").await?;
                }
            }
        }
    }

    /// Store the finished payload on the envelope and let the handler
    /// judge the transaction.
    async fn accept_payload(&mut self, content: Vec<u8>) -> String {
        self.envelope.original_content = Some(content.clone());
        self.envelope.content = Some(if self.config.decode_data {
            Body::Text(String::from_utf8_lossy(&content).into_owned())
        } else {
            Body::Bytes(content)
        });

        match self.handler.data(&mut self.state, &mut self.envelope).await {
            Ok(Some(status)) => status,
            Ok(None) => "250 OK".to_owned(),
            Err(e) => self.exception_status(e).await,
        }
    }

    /// Send the transaction result and clear the envelope. LMTP answers
    /// once per recipient (RFC 2033 section 4.2).
    async fn finish_transaction(&mut self, status: String) -> std::io::Result<Flow> {
        let replies = match self.config.protocol {
            Protocol::Smtp => 1,
            Protocol::Lmtp => self.envelope.rcpt_tos.len().max(1),
        };
        self.envelope.clear();

        for _ in 0..replies {
            self.push(&status).await?;
        }
        Ok(if status.starts_with("421") {
            Flow::Close
        } else {
            Flow::Continue
        })
    }

    async fn rset(&mut self) -> std::io::Result<Flow> {
        self.envelope.clear();
        let result = self.handler.rset(&mut self.state).await;
        self.settle(result, "250 OK").await
    }

    async fn quit(&mut self) -> std::io::Result<Flow> {
        let status = match self.handler.quit(&mut self.state).await {
            Ok(Some(status)) => status,
            Ok(None) => "221 Bye".to_owned(),
            Err(e) => self.exception_status(e).await,
        };
        self.push(status).await?;
        bye(self.connection.stream_mut()).await?;
        Ok(Flow::Close)
    }

    async fn help(&mut self, arg: &str) -> std::io::Result<Flow> {
        let verbs: &[&str] = match self.config.protocol {
            Protocol::Smtp => &[
                "AUTH", "BDAT", "DATA", "EHLO", "EXPN", "HELO", "HELP", "MAIL", "NOOP", "QUIT",
                "RCPT", "RSET", "STARTTLS", "VRFY",
            ],
            Protocol::Lmtp => &[
                "AUTH", "BDAT", "DATA", "EXPN", "HELP", "LHLO", "MAIL", "NOOP", "QUIT", "RCPT",
                "RSET", "STARTTLS", "VRFY",
            ],
        };

        if arg.is_empty() {
            let status = format!("250 Supported commands: {}", verbs.join(" "));
            return self.finish(status).await;
        }

        let verb = arg.to_ascii_uppercase();
        match command::usage(&verb).filter(|_| verbs.contains(&verb.as_str())) {
            Some(usage) => self.finish(format!("250 Syntax: {usage}")).await,
            None => {
                let status = format!("501 Supported commands: {}", verbs.join(" "));
                self.finish(status).await
            }
        }
    }

    async fn starttls(&mut self) -> std::io::Result<Flow> {
        let Some(tls) = self.config.tls.clone() else {
            return self.finish("454 TLS not available").await;
        };
        if self.connection.is_tls() {
            return self.finish("503 Already using TLS").await;
        }

        match self.handler.starttls(&mut self.state).await {
            Err(e) => return self.hook_failed(e).await,
            Ok(Some(status)) => return self.finish(status).await,
            Ok(None) => {}
        }

        self.push("220 Ready to start TLS").await?;

        if self.connection.buffered() > 0 {
            // cleartext pipelined across the upgrade boundary
            warn!("client sent data before the TLS handshake");
            return Ok(Flow::Close);
        }

        if let Err(e) = self.connection.upgrade(&TlsAcceptor::from(tls)).await {
            debug!(%e, "TLS handshake failed");
            return Ok(Flow::Close);
        }

        // back to a fresh session on the encrypted transport
        let peer = std::mem::take(&mut self.state.peer);
        let proxy_data = self.state.proxy_data.take();
        self.state = SessionState::new(peer, true);
        self.state.proxy_data = proxy_data;
        self.envelope.clear();

        Ok(Flow::Continue)
    }

    async fn auth(
        &mut self,
        mechanism: String,
        initial_response: Option<String>,
    ) -> std::io::Result<Flow> {
        if !self.state.extended {
            return self.finish("503 Error: send EHLO first").await;
        }
        if self.config.auth_require_tls && !self.state.tls {
            return self
                .finish("538 5.7.11 Encryption required for requested authentication mechanism")
                .await;
        }
        if self.state.authenticated {
            return self.finish("503 Already authenticated").await;
        }
        if self.envelope.in_progress() {
            return self
                .finish("503 Refused AUTH command during MAIL transaction")
                .await;
        }

        match self
            .handler
            .auth(&mut self.state, &mechanism, initial_response.as_deref())
            .await
        {
            Err(e) => return self.hook_failed(e).await,
            Ok(Some(status)) => return self.finish(status).await,
            Ok(None) => {}
        }

        let Some(authenticator) = self.config.authenticator.clone() else {
            return self.finish("503 Error: authentication not enabled").await;
        };
        let Some(mut exchange) = self.config.make_mechanism(&mechanism) else {
            return self
                .finish("504 5.5.4 Unrecognized authentication type")
                .await;
        };

        // RFC 4954: "=" is an explicitly empty initial response
        let mut response = match initial_response.as_deref() {
            None => None,
            Some("=") => Some(Vec::new()),
            Some(encoded) => match BASE64.decode(encoded) {
                Ok(bytes) => Some(bytes),
                Err(_) => return self.finish("501 5.5.2 Can't decode response").await,
            },
        };
        let mut challenge = exchange.initial();

        loop {
            let bytes = match response.take() {
                Some(bytes) => bytes,
                None => match self.challenge_auth(&challenge).await? {
                    Challenge::Response(bytes) => bytes,
                    Challenge::Abort => return self.finish("501 5.7.0 Auth aborted").await,
                    Challenge::BadBase64 => {
                        return self.finish("501 5.5.2 Can't decode response").await;
                    }
                    Challenge::Flow(flow) => return Ok(flow),
                },
            };

            match exchange.eat(&bytes) {
                Err(sasl::MechanismError::Decode) => {
                    return self.finish("501 5.5.2 Can't decode response").await;
                }
                Ok(sasl::Step::Challenge(next)) => challenge = next,
                Ok(sasl::Step::Done(credentials)) => {
                    return match authenticator.authenticate(&mechanism, &credentials).await {
                        Verdict::Accept(data) => {
                            self.state.authenticated = true;
                            self.state.auth_data = Some(data);
                            self.state.auth_failures = 0;
                            self.finish("235 2.7.0 Authentication successful").await
                        }
                        Verdict::Reject { reply } => {
                            self.state.auth_failures += 1;
                            if self.state.auth_failures >= self.config.auth_max_failures {
                                self.finish("421 4.7.0 Too many auth failures").await
                            } else {
                                let status = reply.unwrap_or_else(|| {
                                    "535 5.7.8 Authentication credentials invalid".to_owned()
                                });
                                self.finish(status).await
                            }
                        }
                    };
                }
            }
        }
    }

    /// Send a `334` challenge and read the client's base64 response.
    async fn challenge_auth(&mut self, prompt: &[u8]) -> std::io::Result<Challenge> {
        self.push(format!("334 {}", BASE64.encode(prompt))).await?;

        let mut buf = Vec::new();
        match self.next_line(&mut buf).await? {
            Input::Line => {}
            Input::Eof => return Ok(Challenge::Flow(Flow::Close)),
            Input::TooLong => return Ok(Challenge::BadBase64),
            Input::TimedOut => return self.timed_out().await.map(Challenge::Flow),
            Input::Shutdown => return self.shutting_down().await.map(Challenge::Flow),
        }

        if buf == b"*" {
            return Ok(Challenge::Abort);
        }
        Ok(match BASE64.decode(&buf) {
            Ok(bytes) => Challenge::Response(bytes),
            Err(_) => Challenge::BadBase64,
        })
    }

    async fn unrecognized(&mut self, verb: &str, args: &str) -> std::io::Result<Flow> {
        self.state.unrecognized += 1;
        if self.state.host_name.is_none() && self.state.unrecognized > crate::UNRECOGNIZED_LIMIT {
            self.push("500 Error: too many unrecognized commands").await?;
            return Ok(Flow::Close);
        }

        match self.handler.command(&mut self.state, verb, args).await {
            Err(e) => self.hook_failed(e).await,
            Ok(Some(status)) => self.finish(status).await,
            Ok(None) => {
                let status = format!("500 Error: command \"{verb}\" not recognized");
                self.finish(status).await
            }
        }
    }

    /// Count a command invocation, enforcing the per-session cap.
    async fn count_call(&mut self, verb: &str) -> std::io::Result<Option<Flow>> {
        let calls = self
            .state
            .command_calls
            .entry(verb.to_owned())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        let calls = *calls;

        if let Some(limit) = &self.config.command_call_limit {
            if calls > limit.for_verb(verb) {
                let status = format!("421 {} Error: too many {verb}", self.config.hostname);
                self.push(status).await?;
                return Ok(Some(Flow::Close));
            }
        }
        Ok(None)
    }

    async fn timed_out(&mut self) -> std::io::Result<Flow> {
        let status = format!("421 {} Error: timeout exceeded", self.config.hostname);
        self.push(status).await?;
        Ok(Flow::Close)
    }

    async fn shutting_down(&mut self) -> std::io::Result<Flow> {
        let status = format!(
            "421 {} Service not available, closing transmission channel",
            self.config.hostname
        );
        self.push(status).await?;
        Ok(Flow::Close)
    }

    /// Resolve a hook result against the engine default and reply.
    async fn settle(
        &mut self,
        result: Result<Option<String>, HookError>,
        default: &str,
    ) -> std::io::Result<Flow> {
        match result {
            Err(e) => self.hook_failed(e).await,
            Ok(Some(status)) => self.finish(status).await,
            Ok(None) => self.finish(default).await,
        }
    }

    async fn hook_failed(&mut self, error: HookError) -> std::io::Result<Flow> {
        let status = self.exception_status(error).await;
        self.finish(status).await
    }

    async fn exception_status(&mut self, error: HookError) -> String {
        warn!(%error, "handler hook failed");
        match self.handler.exception(&error).await {
            Some(status) => status,
            None => format!("500 Error: (Handler) {error}"),
        }
    }

    /// Send a reply and report whether the connection survives it.
    async fn finish(&mut self, status: impl Into<String>) -> std::io::Result<Flow> {
        let status = status.into();
        let close = status.starts_with("421");
        self.push(status).await?;
        Ok(if close { Flow::Close } else { Flow::Continue })
    }

    /// Write one reply, possibly multi-line. Appends CRLF, caps line
    /// length, and holds replies to ASCII unless SMTPUTF8 is enabled.
    async fn push(&mut self, status: impl AsRef<str>) -> std::io::Result<()> {
        let status = status.as_ref();
        let status = status.strip_suffix("\r\n").unwrap_or(status);
        if !self.config.enable_smtputf8 && !status.is_ascii() {
            warn!(?status, "suppressing non-ASCII reply");
            return self
                .connection
                .write_flush("500 Error: non-ASCII reply\r\n")
                .await;
        }

        let mut wire = String::new();
        for line in status.split("\r\n") {
            wire.push_str(clip(line));
            wire.push_str("\r\n");
        }
        self.connection.write_flush(wire).await
    }

    async fn next_line(&mut self, buf: &mut Vec<u8>) -> std::io::Result<Input> {
        let limit = self.config.line_length_limit;
        let idle = self.config.timeout;

        let Self {
            connection, config, ..
        } = self;
        let read = timeout(idle, read_line(connection.stream_mut(), limit, buf));

        let result = match &mut config.shutdown {
            Some(rx) => tokio::select! {
                result = read => Some(result),
                () = wait_shutdown(rx) => None,
            },
            None => Some(read.await),
        };

        match result {
            None => Ok(Input::Shutdown),
            Some(Err(_)) => Ok(Input::TimedOut),
            Some(Ok(Ok(()))) => Ok(Input::Line),
            Some(Ok(Err(ReadLineError::Eof))) => Ok(Input::Eof),
            Some(Ok(Err(ReadLineError::TooLong(_)))) => Ok(Input::TooLong),
            Some(Ok(Err(ReadLineError::Io(e)))) => Err(e),
        }
    }
}

enum ChunkCommand {
    Bdat(u64, bool),
    Rset,
    Flow(Flow),
}

enum Challenge {
    Response(Vec<u8>),
    Abort,
    BadBase64,
    Flow(Flow),
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        // no controller anymore; never signal
        std::future::pending::<()>().await;
    }
}

fn clip(line: &str) -> &str {
    if line.len() <= REPLY_LIMIT {
        return line;
    }
    let mut end = REPLY_LIMIT;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use secrecy::ExposeSecret;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::{
        handler::{Handler, HookResult},
        message::{Body, Envelope},
        server::{CallLimit, Config, Protocol, Server},
    };

    fn config() -> Config {
        Config {
            hostname: "mail.example.com".to_owned(),
            ident: "test".to_owned(),
            ..Config::default()
        }
    }

    /// Run a whole session over a duplex pipe and return the server's
    /// side of the conversation.
    async fn run<H: Handler>(
        config: Config,
        handler: H,
        input: impl AsRef<[u8]>,
    ) -> anyhow::Result<String> {
        let (mut client, server) = tokio::io::duplex(65536);
        let session = Server::new(config, handler).accept(server, "test");
        let task = tokio::spawn(session.serve());

        client.write_all(input.as_ref()).await?;
        client.shutdown().await?;

        let mut output = String::new();
        client.read_to_string(&mut output).await?;
        task.await??;

        Ok(output)
    }

    struct Sink;

    impl Handler for Sink {}

    struct Creds;

    #[async_trait::async_trait]
    impl auth::Authenticator for Creds {
        async fn authenticate(
            &self,
            _mechanism: &str,
            credentials: &auth::Credentials,
        ) -> auth::Verdict {
            match credentials {
                auth::Credentials::Password { username, password }
                    if username == "bob" && password.expose_secret() == "hunter2" =>
                {
                    auth::Verdict::Accept(Box::new(username.clone()))
                }
                _ => auth::Verdict::reject(),
            }
        }
    }

    #[derive(Clone, Default)]
    struct Capture {
        seen: Arc<Mutex<Vec<Envelope>>>,
    }

    #[async_trait::async_trait]
    impl Handler for Capture {
        async fn data(
            &self,
            _session: &mut super::SessionState,
            envelope: &mut Envelope,
        ) -> HookResult {
            self.seen.lock().unwrap().push(envelope.clone());
            Ok(None)
        }
    }

    #[tokio::test]
    async fn ehlo_advertisement() -> anyhow::Result<()> {
        let output = run(config(), Sink, "EHLO example.org\r\nQUIT\r\n").await?;
        assert_eq!(
            output,
            "220 mail.example.com test\r\n\
             250-mail.example.com\r\n\
             250-SIZE 33554432\r\n\
             250-8BITMIME\r\n\
             250-CHUNKING\r\n\
             250 HELP\r\n\
             221 Bye\r\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn smtputf8_and_auth_advertised() -> anyhow::Result<()> {
        let mut config = config();
        config.enable_smtputf8 = true;
        config.auth_require_tls = false;
        config.authenticator = Some(Arc::new(Creds));

        let output = run(config, Sink, "EHLO example.org\r\nQUIT\r\n").await?;
        assert_eq!(
            output,
            "220 mail.example.com test\r\n\
             250-mail.example.com\r\n\
             250-SIZE 33554432\r\n\
             250-8BITMIME\r\n\
             250-SMTPUTF8\r\n\
             250-CHUNKING\r\n\
             250-AUTH LOGIN PLAIN\r\n\
             250 HELP\r\n\
             221 Bye\r\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn message_delivery() -> anyhow::Result<()> {
        let capture = Capture::default();
        let output = run(
            config(),
            capture.clone(),
            "EHLO x\r\n\
             MAIL FROM:<a@b>\r\n\
             RCPT TO:<c@d>\r\n\
             DATA\r\n\
             Hi\r\n\
             .\r\n\
             QUIT\r\n",
        )
        .await?;

        assert!(output.contains("354 End data with <CR><LF>.<CR><LF>\r\n"));
        assert!(output.ends_with("250 OK\r\n221 Bye\r\n"));

        let seen = capture.seen.lock().unwrap();
        let envelope = &seen[0];
        assert_eq!(envelope.mail_from.as_deref(), Some("a@b"));
        assert_eq!(envelope.rcpt_tos, ["c@d"]);
        assert_eq!(envelope.content, Some(Body::Bytes(b"Hi".to_vec())));
        assert_eq!(envelope.original_content.as_deref(), Some(&b"Hi"[..]));
        Ok(())
    }

    #[tokio::test]
    async fn data_needs_mail_then_rcpt() -> anyhow::Result<()> {
        let output = run(
            config(),
            Sink,
            "EHLO x\r\nDATA\r\nMAIL FROM:<a@b>\r\nDATA\r\nQUIT\r\n",
        )
        .await?;

        assert!(output.contains("503 Error: need MAIL command\r\n"));
        assert!(output.contains("503 Error: need RCPT command\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn dot_stuffing() -> anyhow::Result<()> {
        let capture = Capture::default();
        run(
            config(),
            capture.clone(),
            "EHLO x\r\nMAIL FROM:<a@b>\r\nRCPT TO:<c@d>\r\nDATA\r\n..line\r\n.\r\nQUIT\r\n",
        )
        .await?;

        let seen = capture.seen.lock().unwrap();
        assert_eq!(seen[0].content, Some(Body::Bytes(b".line".to_vec())));
        Ok(())
    }

    #[tokio::test]
    async fn data_size_limit() -> anyhow::Result<()> {
        let mut config = config();
        config.data_size_limit = 10;

        let output = run(
            config,
            Sink,
            "EHLO x\r\n\
             MAIL FROM:<a@b>\r\n\
             RCPT TO:<c@d>\r\n\
             DATA\r\n\
             01234567890123456789\r\n\
             .\r\n\
             MAIL FROM:<a@b>\r\n\
             QUIT\r\n",
        )
        .await?;

        assert!(output.contains("552 Error: Too much mail data\r\n"));
        // the envelope was cleared, so a fresh MAIL is not "nested"
        assert!(output.ends_with("250 OK\r\n221 Bye\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn greeting_required() -> anyhow::Result<()> {
        let output = run(
            config(),
            Sink,
            "MAIL FROM:<a@b>\r\nRSET\r\nNOOP\r\nQUIT\r\n",
        )
        .await?;
        assert_eq!(
            output,
            "220 mail.example.com test\r\n\
             503 Error: send HELO first\r\n\
             250 OK\r\n\
             250 OK\r\n\
             221 Bye\r\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn starttls_required_gates_mail() -> anyhow::Result<()> {
        let mut config = config();
        config.require_starttls = true;

        let output = run(
            config,
            Sink,
            "EHLO x\r\nMAIL FROM:<a@b>\r\nSTARTTLS\r\nQUIT\r\n",
        )
        .await?;

        assert!(output.contains("530 Must issue a STARTTLS command first\r\n"));
        // no TLS context is configured, so the upgrade itself is refused
        assert!(output.contains("454 TLS not available\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn auth_required_gates_mail() -> anyhow::Result<()> {
        let mut config = config();
        config.auth_required = true;
        config.auth_require_tls = false;
        config.authenticator = Some(Arc::new(Creds));

        let output = run(
            config,
            Sink,
            "EHLO x\r\n\
             MAIL FROM:<a@b>\r\n\
             AUTH PLAIN AGJvYgBodW50ZXIy\r\n\
             MAIL FROM:<a@b>\r\n\
             QUIT\r\n",
        )
        .await?;

        assert!(output.contains("530 5.7.0 Authentication required\r\n"));
        assert!(output.contains("235 2.7.0 Authentication successful\r\n"));
        assert!(output.ends_with("250 OK\r\n221 Bye\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn auth_login_exchange() -> anyhow::Result<()> {
        let mut config = config();
        config.auth_require_tls = false;
        config.authenticator = Some(Arc::new(Creds));

        let output = run(
            config,
            Sink,
            "EHLO x\r\nAUTH LOGIN\r\nYm9i\r\naHVudGVyMg==\r\nQUIT\r\n",
        )
        .await?;

        assert!(output.contains("334 VXNlcm5hbWU=\r\n"));
        assert!(output.contains("334 UGFzc3dvcmQ=\r\n"));
        assert!(output.contains("235 2.7.0 Authentication successful\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn auth_abort_and_failures() -> anyhow::Result<()> {
        let mut config = config();
        config.auth_require_tls = false;
        config.authenticator = Some(Arc::new(Creds));

        let output = run(
            config.clone(),
            Sink,
            "EHLO x\r\nAUTH LOGIN\r\n*\r\nQUIT\r\n",
        )
        .await?;
        assert!(output.contains("501 5.7.0 Auth aborted\r\n"));

        // three rejected attempts end the connection
        let output = run(
            config,
            Sink,
            "EHLO x\r\n\
             AUTH PLAIN AGV2ZQB3cm9uZw==\r\n\
             AUTH PLAIN AGV2ZQB3cm9uZw==\r\n\
             AUTH PLAIN AGV2ZQB3cm9uZw==\r\n",
        )
        .await?;
        assert_eq!(
            output.matches("535 5.7.8 Authentication credentials invalid\r\n").count(),
            2
        );
        assert!(output.ends_with("421 4.7.0 Too many auth failures\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn auth_requires_tls_by_default() -> anyhow::Result<()> {
        let mut config = config();
        config.authenticator = Some(Arc::new(Creds));

        let output = run(config, Sink, "EHLO x\r\nAUTH PLAIN\r\nQUIT\r\n").await?;
        assert!(output.contains(
            "538 5.7.11 Encryption required for requested authentication mechanism\r\n"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn auth_needs_ehlo() -> anyhow::Result<()> {
        let mut config = config();
        config.auth_require_tls = false;
        config.authenticator = Some(Arc::new(Creds));

        let output = run(config, Sink, "HELO x\r\nAUTH PLAIN\r\nQUIT\r\n").await?;
        assert!(output.contains("503 Error: send EHLO first\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_mechanism() -> anyhow::Result<()> {
        let mut config = config();
        config.auth_require_tls = false;
        config.authenticator = Some(Arc::new(Creds));

        let output = run(config, Sink, "EHLO x\r\nAUTH GSSAPI\r\nQUIT\r\n").await?;
        assert!(output.contains("504 5.5.4 Unrecognized authentication type\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn excluded_mechanism_not_offered() -> anyhow::Result<()> {
        let mut config = config();
        config.auth_require_tls = false;
        config.authenticator = Some(Arc::new(Creds));
        config.auth_exclude_mechanism.insert("LOGIN".to_owned());

        let output = run(config, Sink, "EHLO x\r\nAUTH LOGIN\r\nQUIT\r\n").await?;
        assert!(output.contains("250-AUTH PLAIN\r\n"));
        assert!(output.contains("504 5.5.4 Unrecognized authentication type\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn rset_keeps_session_state() -> anyhow::Result<()> {
        let output = run(
            config(),
            Sink,
            "EHLO x\r\n\
             MAIL FROM:<a@b>\r\n\
             RSET\r\n\
             MAIL FROM:<other@b>\r\n\
             MAIL FROM:<nested@b>\r\n\
             QUIT\r\n",
        )
        .await?;

        // the envelope went away but the greeting did not
        assert!(!output.contains("503 Error: send HELO first"));
        assert!(output.contains("503 Error: nested MAIL command\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn command_call_limit() -> anyhow::Result<()> {
        let mut config = config();
        config.command_call_limit = Some(CallLimit::Uniform(2));

        let output = run(config, Sink, "NOOP\r\nNOOP\r\nNOOP\r\nNOOP\r\n").await?;
        assert_eq!(
            output,
            "220 mail.example.com test\r\n\
             250 OK\r\n\
             250 OK\r\n\
             421 mail.example.com Error: too many NOOP\r\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn unrecognized_command() -> anyhow::Result<()> {
        let output = run(config(), Sink, "WAT\r\nQUIT\r\n").await?;
        assert!(output.contains("500 Error: command \"WAT\" not recognized\r\n"));
        Ok(())
    }

    struct Pong;

    #[async_trait::async_trait]
    impl Handler for Pong {
        async fn command(
            &self,
            _session: &mut super::SessionState,
            verb: &str,
            _args: &str,
        ) -> HookResult {
            Ok((verb == "XPING").then(|| "250 pong".to_owned()))
        }
    }

    #[tokio::test]
    async fn registered_command_hook() -> anyhow::Result<()> {
        let output = run(config(), Pong, "XPING\r\nXPONG\r\nQUIT\r\n").await?;
        assert!(output.contains("250 pong\r\n"));
        assert!(output.contains("500 Error: command \"XPONG\" not recognized\r\n"));
        Ok(())
    }

    struct Broken;

    #[async_trait::async_trait]
    impl Handler for Broken {
        async fn vrfy(&self, _session: &mut super::SessionState, _address: &str) -> HookResult {
            Err("database offline".into())
        }
    }

    #[tokio::test]
    async fn hook_failure_keeps_connection() -> anyhow::Result<()> {
        let output = run(config(), Broken, "EHLO x\r\nVRFY a@b\r\nNOOP\r\nQUIT\r\n").await?;
        assert!(output.contains("500 Error: (Handler) database offline\r\n"));
        assert!(output.ends_with("250 OK\r\n221 Bye\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn lmtp_greeting_and_per_recipient_replies() -> anyhow::Result<()> {
        let mut config = config();
        config.protocol = Protocol::Lmtp;

        let output = run(
            config,
            Sink,
            "EHLO x\r\n\
             LHLO x\r\n\
             MAIL FROM:<a@b>\r\n\
             RCPT TO:<c@d>\r\n\
             RCPT TO:<e@f>\r\n\
             DATA\r\n\
             Hi\r\n\
             .\r\n\
             QUIT\r\n",
        )
        .await?;

        assert!(output.contains("500 Error: command \"EHLO\" not recognized (send LHLO)\r\n"));
        assert!(output.ends_with("250 OK\r\n250 OK\r\n221 Bye\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn bdat_chunks() -> anyhow::Result<()> {
        let capture = Capture::default();
        let output = run(
            config(),
            capture.clone(),
            "EHLO x\r\n\
             MAIL FROM:<a@b>\r\n\
             RCPT TO:<c@d>\r\n\
             BDAT 6\r\nfirst \
             BDAT 5 LAST\r\nchunk\
             QUIT\r\n",
        )
        .await?;

        assert!(output.contains("250 2.6.0 Chunk accepted\r\n"));
        assert!(output.ends_with("250 OK\r\n221 Bye\r\n"));

        let seen = capture.seen.lock().unwrap();
        assert_eq!(seen[0].content, Some(Body::Bytes(b"first chunk".to_vec())));
        Ok(())
    }

    #[tokio::test]
    async fn bdat_without_transaction_consumes_chunk() -> anyhow::Result<()> {
        let output = run(config(), Sink, "EHLO x\r\nBDAT 4\r\nobokQUIT\r\n").await?;
        assert!(output.contains("503 Error: need MAIL command\r\n"));
        assert!(output.ends_with("221 Bye\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn command_line_too_long() -> anyhow::Result<()> {
        let mut long = b"NOOP ".to_vec();
        long.extend(vec![b'x'; 2000]);
        long.extend_from_slice(b"\r\nQUIT\r\n");

        let output = run(config(), Sink, long).await?;
        assert_eq!(
            output,
            "220 mail.example.com test\r\n\
             500 Command line too long\r\n\
             221 Bye\r\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn strict_ascii_without_smtputf8() -> anyhow::Result<()> {
        let output = run(
            config(),
            Sink,
            "EHLO x\r\nMAIL FROM:<g\u{fc}nter@bahn.de>\r\nQUIT\r\n",
        )
        .await?;
        assert!(output.contains("500 Error: strict ASCII required\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn mail_parameters() -> anyhow::Result<()> {
        let output = run(
            config(),
            Sink,
            "EHLO x\r\n\
             MAIL FROM:<a@b> SIZE=999999999999\r\n\
             MAIL FROM:<a@b> SMTPUTF8\r\n\
             MAIL FROM:<a@b> FUTURE=1\r\n\
             MAIL FROM:<a@b> BODY=8BITMIME SIZE=100\r\n\
             QUIT\r\n",
        )
        .await?;

        assert!(output.contains("552 Error: message size exceeds fixed maximum message size\r\n"));
        assert!(output.contains("501 Error: SMTPUTF8 disabled\r\n"));
        assert!(output.contains("555 MAIL FROM parameters not recognized or not implemented\r\n"));
        assert!(output.ends_with("250 OK\r\n221 Bye\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn help_lists_commands() -> anyhow::Result<()> {
        let output = run(config(), Sink, "HELP\r\nHELP MAIL\r\nHELP WAT\r\nQUIT\r\n").await?;
        assert!(output.contains("250 Supported commands: AUTH BDAT DATA EHLO EXPN HELO HELP"));
        assert!(output.contains("250 Syntax: MAIL FROM: <address>\r\n"));
        assert!(output.contains("501 Supported commands:"));
        Ok(())
    }

    #[tokio::test]
    async fn proxy_preamble_before_greeting() -> anyhow::Result<()> {
        let mut config = config();
        config.proxy_protocol_timeout = Some(Duration::from_secs(1));

        let output = run(
            config,
            Sink,
            "PROXY TCP4 192.0.2.1 198.51.100.2 51000 25\r\nEHLO x\r\nQUIT\r\n",
        )
        .await?;
        assert!(output.starts_with("220 mail.example.com test\r\n"));
        assert!(output.ends_with("221 Bye\r\n"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout() -> anyhow::Result<()> {
        let (mut client, server) = tokio::io::duplex(1024);
        let session = Server::new(config(), Sink).accept(server, "test");
        let task = tokio::spawn(session.serve());

        let mut output = String::new();
        client.read_to_string(&mut output).await?;
        task.await??;

        assert_eq!(
            output,
            "220 mail.example.com test\r\n\
             421 mail.example.com Error: timeout exceeded\r\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_answers_421() -> anyhow::Result<()> {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let mut config = config();
        config.shutdown = Some(rx);

        let (mut client, server) = tokio::io::duplex(1024);
        let session = Server::new(config, Sink).accept(server, "test");
        let task = tokio::spawn(session.serve());

        tx.send(true)?;

        let mut output = String::new();
        client.read_to_string(&mut output).await?;
        task.await??;

        assert!(output.ends_with(
            "421 mail.example.com Service not available, closing transmission channel\r\n"
        ));
        Ok(())
    }
}
