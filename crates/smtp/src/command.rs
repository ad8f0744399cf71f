use std::str::FromStr;

use email_address::EmailAddress;
use nom::{
    bytes::complete::{tag, take_until},
    sequence::{delimited, preceded},
    IResult,
};
use tracing::debug;

/// One parsed client command.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Helo {
        domain: String,
    },
    Ehlo {
        domain: String,
    },
    /// LMTP greeting (RFC 2033); unrecognized in SMTP mode.
    Lhlo {
        domain: String,
    },
    Mail {
        /// `None` is the null reverse-path `<>`.
        from: Option<EmailAddress>,
        params: Vec<String>,
    },
    Rcpt {
        to: EmailAddress,
        params: Vec<String>,
    },
    Data,
    /// BDAT <size> ["LAST"] (RFC 3030).
    Bdat {
        size: u64,
        last: bool,
    },
    Rset,
    Noop {
        arg: String,
    },
    Quit,
    Help {
        arg: String,
    },
    Vrfy {
        arg: String,
    },
    Expn {
        arg: String,
    },
    Starttls,
    /// AUTH <mechanism> [initial-response] (RFC 4954).
    Auth {
        mechanism: String,
        initial_response: Option<String>,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    Unrecognized { verb: String, args: String },
    Syntax { verb: &'static str, usage: &'static str },
    /// Non-ASCII bytes without SMTPUTF8, or invalid UTF-8 with it.
    NonAscii,
}

impl Command {
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Helo { .. } => "HELO",
            Self::Ehlo { .. } => "EHLO",
            Self::Lhlo { .. } => "LHLO",
            Self::Mail { .. } => "MAIL",
            Self::Rcpt { .. } => "RCPT",
            Self::Data => "DATA",
            Self::Bdat { .. } => "BDAT",
            Self::Rset => "RSET",
            Self::Noop { .. } => "NOOP",
            Self::Quit => "QUIT",
            Self::Help { .. } => "HELP",
            Self::Vrfy { .. } => "VRFY",
            Self::Expn { .. } => "EXPN",
            Self::Starttls => "STARTTLS",
            Self::Auth { .. } => "AUTH",
        }
    }

    /// Parse one command line. `utf8` permits non-ASCII argument bytes
    /// (SMTPUTF8 negotiated); without it the line must be pure ASCII.
    pub fn parse(line: &[u8], utf8: bool) -> Result<Self, Error> {
        let s = std::str::from_utf8(line).map_err(|_| Error::NonAscii)?;
        if !utf8 && !s.is_ascii() {
            return Err(Error::NonAscii);
        }
        debug!(?s, "parsing command");

        let (verb, args) = s.split_once(' ').unwrap_or((s, ""));

        let cmd = match verb.to_ascii_uppercase().as_str() {
            "HELO" => Self::Helo {
                domain: domain_arg(args, "HELO", "HELO hostname")?,
            },
            "EHLO" => Self::Ehlo {
                domain: domain_arg(args, "EHLO", "EHLO hostname")?,
            },
            "LHLO" => Self::Lhlo {
                domain: domain_arg(args, "LHLO", "LHLO hostname")?,
            },
            "MAIL" => {
                let rest = prefix_ci(args.trim_start(), "FROM:").ok_or(Error::Syntax {
                    verb: "MAIL",
                    usage: "MAIL FROM: <address>",
                })?;
                let (path, params) = path_and_params(rest, "MAIL", "MAIL FROM: <address>")?;
                Self::Mail { from: path, params }
            }
            "RCPT" => {
                let rest = prefix_ci(args.trim_start(), "TO:").ok_or(Error::Syntax {
                    verb: "RCPT",
                    usage: "RCPT TO: <address>",
                })?;
                let (path, params) = path_and_params(rest, "RCPT", "RCPT TO: <address>")?;
                Self::Rcpt {
                    to: path.ok_or(Error::Syntax {
                        verb: "RCPT",
                        usage: "RCPT TO: <address>",
                    })?,
                    params,
                }
            }
            "DATA" => bare(args, Self::Data, "DATA", "DATA")?,
            "RSET" => bare(args, Self::Rset, "RSET", "RSET")?,
            "QUIT" => bare(args, Self::Quit, "QUIT", "QUIT")?,
            "STARTTLS" => bare(args, Self::Starttls, "STARTTLS", "STARTTLS")?,
            "NOOP" => Self::Noop {
                arg: args.trim().to_owned(),
            },
            "HELP" => Self::Help {
                arg: args.trim().to_owned(),
            },
            "VRFY" => {
                let arg = args.trim();
                if arg.is_empty() {
                    return Err(Error::Syntax {
                        verb: "VRFY",
                        usage: "VRFY <address>",
                    });
                }
                Self::Vrfy {
                    arg: arg.to_owned(),
                }
            }
            "EXPN" => Self::Expn {
                arg: args.trim().to_owned(),
            },
            "BDAT" => {
                let mut args = args.split_ascii_whitespace();
                let size = args.next().and_then(|s| s.parse().ok()).ok_or(Error::Syntax {
                    verb: "BDAT",
                    usage: "BDAT <size> [LAST]",
                })?;
                let last = args
                    .next()
                    .map_or(false, |s| s.eq_ignore_ascii_case("LAST"));
                Self::Bdat { size, last }
            }
            "AUTH" => {
                let mut args = args.splitn(2, ' ');
                let mechanism = args
                    .next()
                    .filter(|m| !m.is_empty())
                    .ok_or(Error::Syntax {
                        verb: "AUTH",
                        usage: "AUTH <mechanism> [initial-response]",
                    })?
                    .to_ascii_uppercase();
                Self::Auth {
                    mechanism,
                    initial_response: args.next().map(|r| r.trim().to_owned()),
                }
            }
            _ => {
                return Err(Error::Unrecognized {
                    verb: verb.to_owned(),
                    args: args.to_owned(),
                })
            }
        };

        Ok(cmd)
    }
}

/// Per-verb usage line, as served by HELP.
pub fn usage(verb: &str) -> Option<&'static str> {
    Some(match verb {
        "HELO" => "HELO hostname",
        "EHLO" => "EHLO hostname",
        "LHLO" => "LHLO hostname",
        "MAIL" => "MAIL FROM: <address>",
        "RCPT" => "RCPT TO: <address>",
        "DATA" => "DATA",
        "BDAT" => "BDAT <size> [LAST]",
        "RSET" => "RSET",
        "NOOP" => "NOOP [ignored]",
        "QUIT" => "QUIT",
        "HELP" => "HELP [command]",
        "VRFY" => "VRFY <address>",
        "STARTTLS" => "STARTTLS",
        "AUTH" => "AUTH <mechanism> [initial-response]",
        _ => return None,
    })
}

fn bare(
    args: &str,
    cmd: Command,
    verb: &'static str,
    usage: &'static str,
) -> Result<Command, Error> {
    if args.trim().is_empty() {
        Ok(cmd)
    } else {
        Err(Error::Syntax { verb, usage })
    }
}

fn domain_arg(args: &str, verb: &'static str, usage: &'static str) -> Result<String, Error> {
    let domain = args.trim();
    if domain.is_empty() {
        Err(Error::Syntax { verb, usage })
    } else {
        Ok(domain.to_owned())
    }
}

fn prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    s.get(..prefix.len())
        .filter(|p| p.eq_ignore_ascii_case(prefix))
        .map(|_| &s[prefix.len()..])
}

fn angle_path(i: &str) -> IResult<&str, &str> {
    preceded(take_until("<"), delimited(tag("<"), take_until(">"), tag(">")))(i)
}

/// Split `<path> [params...]`; an empty path is the null reverse-path.
fn path_and_params(
    i: &str,
    verb: &'static str,
    usage: &'static str,
) -> Result<(Option<EmailAddress>, Vec<String>), Error> {
    let (params, path) = angle_path(i).map_err(|e| {
        debug!(%e, "failed to parse path from {i:?}");
        Error::Syntax { verb, usage }
    })?;

    let path = if path.is_empty() {
        None
    } else {
        Some(EmailAddress::from_str(path).map_err(|e| {
            debug!(%e, "invalid address {path:?}");
            Error::Syntax { verb, usage }
        })?)
    };

    Ok((
        path,
        params
            .split_ascii_whitespace()
            .map(ToOwned::to_owned)
            .collect(),
    ))
}
