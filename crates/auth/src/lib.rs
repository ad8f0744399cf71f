use std::any::Any;

use secrecy::{ExposeSecret, SecretString};

pub mod sasl;

/// Opaque application data attached to a session by a successful
/// authenticator.
pub type AuthData = Box<dyn Any + Send + Sync>;

/// What a SASL exchange produced for validation.
pub enum Credentials {
    /// Username/password pair from PLAIN or LOGIN.
    Password {
        username: String,
        password: SecretString,
    },
    /// Final client response of a custom mechanism, undecoded.
    Raw(Vec<u8>),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Raw(_) => f.debug_struct("Raw").finish_non_exhaustive(),
        }
    }
}

/// Outcome of credential validation.
pub enum Verdict {
    /// Authentication succeeded; the data is stored on the session.
    Accept(AuthData),
    /// Authentication failed. `reply` overrides the server's default
    /// failure response when set.
    Reject { reply: Option<String> },
}

impl Verdict {
    pub fn reject() -> Self {
        Self::Reject { reply: None }
    }
}

/// Application-provided credential validation.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, mechanism: &str, credentials: &Credentials) -> Verdict;
}

/// Adapter for the simpler `fn(mechanism, login, password) -> bool` shape.
///
/// Accepted logins get their username stored as the session auth data.
pub struct CallbackAuthenticator<F>(pub F);

#[async_trait::async_trait]
impl<F> Authenticator for CallbackAuthenticator<F>
where
    F: Fn(&str, Option<&str>, Option<&str>) -> bool + Send + Sync,
{
    async fn authenticate(&self, mechanism: &str, credentials: &Credentials) -> Verdict {
        match credentials {
            Credentials::Password { username, password } => {
                if (self.0)(
                    mechanism,
                    Some(username.as_str()),
                    Some(password.expose_secret()),
                ) {
                    Verdict::Accept(Box::new(username.clone()))
                } else {
                    Verdict::reject()
                }
            }
            Credentials::Raw(_) => {
                if (self.0)(mechanism, None, None) {
                    Verdict::Accept(Box::new(()))
                } else {
                    Verdict::reject()
                }
            }
        }
    }
}
