//! [EHLO response](https://datatracker.ietf.org/doc/html/rfc5321#section-4.1.1.1)
//! assembly.
//!
//! The engine builds a tentative line list, lets the application's `ehlo`
//! hook rewrite it, and renders the result as one multi-line 250 reply:
//!
//! ```txt
//! C: EHLO localhost
//! S: 250-mail.example.com
//! 250-SIZE 33554432
//! 250-8BITMIME
//! 250-CHUNKING
//! 250-STARTTLS
//! 250-AUTH LOGIN PLAIN
//! 250 HELP
//! ```

use std::fmt::Write;

bitflags::bitflags! {
    /// Extensions the engine itself implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Extensions: u8 {
        const _8BITMIME = 1 << 0;
        const SMTPUTF8 = 1 << 1;
        /// Message chunking via `BDAT`
        /// ([RFC 3030](https://datatracker.ietf.org/doc/html/rfc3030)).
        const CHUNKING = 1 << 2;
        /// Opportunistic TLS
        /// ([RFC 3207](https://datatracker.ietf.org/doc/html/rfc3207)).
        const STARTTLS = 1 << 3;
    }
}

impl Extensions {
    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        self.iter().map(|f| match f {
            Self::_8BITMIME => "8BITMIME",
            Self::SMTPUTF8 => "SMTPUTF8",
            Self::CHUNKING => "CHUNKING",
            Self::STARTTLS => "STARTTLS",
            _ => unreachable!(),
        })
    }
}

/// Tentative EHLO response content, before the application hook sees it.
#[derive(Debug, PartialEq, Eq)]
pub struct Response {
    /// Domain name of the server, first line of the reply.
    pub domain: String,
    pub extensions: Extensions,
    /// Maximum message size in octets
    /// ([RFC 1870](https://datatracker.ietf.org/doc/html/rfc1870)).
    pub size: usize,
    /// AUTH mechanisms to advertise; empty suppresses the AUTH line.
    pub auth: Vec<String>,
}

impl Response {
    /// The reply payload, one entry per line, without status prefixes and
    /// without the terminal HELP line.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![self.domain.clone(), format!("SIZE {}", self.size)];
        lines.extend(self.extensions.names().map(str::to_owned));
        if !self.auth.is_empty() {
            lines.push(format!("AUTH {}", self.auth.join(" ")));
        }
        lines
    }
}

/// Render payload lines as a multi-line reply: `code-` on every line but
/// the last, `code ` on the last.
pub fn render(code: u16, lines: &[String]) -> String {
    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        let sep = if i + 1 == lines.len() { ' ' } else { '-' };
        let _ = write!(out, "{code}{sep}{line}");
        if i + 1 != lines.len() {
            out.push_str("\r\n");
        }
    }
    out
}
