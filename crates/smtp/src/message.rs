pub mod bdat;
pub mod data;

/// Message payload, decoded or raw depending on the `decode_data` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Bytes(Vec<u8>),
    Text(String),
}

/// SMTP-level metadata and payload of one message in flight.
///
/// Exclusively owned by its session; reset between messages, never reused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Reverse-path of the accepted MAIL command; the empty string is the
    /// null reverse-path `<>`. Absent until MAIL is accepted.
    pub mail_from: Option<ReversePath>,
    /// ESMTP parameters accepted on MAIL, in order of appearance.
    pub mail_options: Vec<String>,
    /// SMTPUTF8 was requested on MAIL.
    pub smtp_utf8: bool,
    /// Forward-paths in RCPT order.
    pub rcpt_tos: Vec<String>,
    /// ESMTP parameters per recipient, parallel to `rcpt_tos`.
    pub rcpt_options: Vec<Vec<String>>,
    /// Payload with dot-stuffing removed, lines joined by CRLF. Set only
    /// at DATA/BDAT completion.
    pub content: Option<Body>,
    /// Payload before decoding.
    pub original_content: Option<Vec<u8>>,
}

/// The sender address of a transaction; empty string for the null
/// reverse-path `<>`.
pub type ReversePath = String;

impl Envelope {
    /// Back to the no-transaction state.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// A MAIL command has been accepted and not yet completed or reset.
    pub fn in_progress(&self) -> bool {
        self.mail_from.is_some()
    }
}
