use async_trait::async_trait;

use crate::{message::Envelope, server::session::SessionState};

/// Failure escaping an application hook. The engine catches it, consults
/// [`Handler::exception`], and keeps the connection alive.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// `Ok(None)` keeps the engine's default behavior; `Ok(Some(reply))` sends
/// the given reply instead (a full status line such as `"250 OK"`, no
/// CRLF). Replies starting with `421` close the connection after being
/// sent.
pub type HookResult = Result<Option<String>, HookError>;

/// Application checkpoints of the protocol engine.
///
/// Every hook has a default-accept implementation, so a handler only
/// implements the checkpoints it cares about. Hooks run on the session
/// task and may mutate the session and envelope freely; the engine never
/// holds them across commands.
#[allow(unused_variables)]
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// After HELO syntax validation, before the engine records the peer
    /// name. Default reply: `250 <hostname>`.
    async fn helo(&self, session: &mut SessionState, domain: &str) -> HookResult {
        Ok(None)
    }

    /// Inspect or rewrite the tentative EHLO/LHLO response lines (the
    /// first entry is the hostname greeting; the terminal `HELP` line is
    /// appended afterwards).
    async fn ehlo(
        &self,
        session: &mut SessionState,
        domain: &str,
        responses: &mut Vec<String>,
    ) -> HookResult {
        Ok(None)
    }

    /// Default reply: `250 OK`.
    async fn noop(&self, session: &mut SessionState, arg: &str) -> HookResult {
        Ok(None)
    }

    /// Before the connection closes. Default reply: `221 Bye`.
    async fn quit(&self, session: &mut SessionState) -> HookResult {
        Ok(None)
    }

    /// Default reply: `252 Cannot VRFY user, but will accept message`.
    async fn vrfy(&self, session: &mut SessionState, address: &str) -> HookResult {
        Ok(None)
    }

    /// Default reply: `502 EXPN not implemented`.
    async fn expn(&self, session: &mut SessionState, address: &str) -> HookResult {
        Ok(None)
    }

    /// After MAIL parsing and parameter validation, before the sender is
    /// committed to the envelope. Default reply: `250 OK`.
    async fn mail(
        &self,
        session: &mut SessionState,
        envelope: &mut Envelope,
        address: &str,
        params: &[String],
    ) -> HookResult {
        Ok(None)
    }

    /// After RCPT parsing, before the recipient is committed. Default
    /// reply: `250 OK`.
    async fn rcpt(
        &self,
        session: &mut SessionState,
        envelope: &mut Envelope,
        address: &str,
        params: &[String],
    ) -> HookResult {
        Ok(None)
    }

    /// Default reply: `250 OK`.
    async fn rset(&self, session: &mut SessionState) -> HookResult {
        Ok(None)
    }

    /// After the payload has been read into `envelope.content`. The reply
    /// becomes the transaction result; the envelope is cleared afterwards
    /// either way. Default reply: `250 OK`.
    async fn data(&self, session: &mut SessionState, envelope: &mut Envelope) -> HookResult {
        Ok(None)
    }

    /// Just before the TLS handshake. Returning a reply refuses the
    /// upgrade; the default proceeds.
    async fn starttls(&self, session: &mut SessionState) -> HookResult {
        Ok(None)
    }

    /// Full override of the AUTH machinery. Returning a reply ends the
    /// command; the default continues into the built-in SASL exchange.
    async fn auth(
        &self,
        session: &mut SessionState,
        mechanism: &str,
        initial_response: Option<&str>,
    ) -> HookResult {
        Ok(None)
    }

    /// Application-registered commands: consulted for any verb the engine
    /// does not recognize, before the `500` reply.
    async fn command(&self, session: &mut SessionState, verb: &str, args: &str) -> HookResult {
        Ok(None)
    }

    /// A hook failed. The returned reply is sent instead of the default
    /// `500 Error: (Handler) <message>`.
    async fn exception(&self, error: &HookError) -> Option<String> {
        None
    }
}
