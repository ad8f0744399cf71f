use secrecy::SecretString;

use crate::Credentials;

use super::{Exchange, MechanismError, Step};

/// Decode a PLAIN response (RFC 4616), `authzid \0 authcid \0 password`.
/// An empty authorization identity is allowed and ignored.
///
/// ```text
/// C: AUTH PLAIN
/// S: 334
/// C: AGJvYgBodW50ZXIy
/// ```
///
/// ```
/// # use auth::Credentials;
/// # use auth::sasl::plain::decode;
/// # use secrecy::ExposeSecret;
/// let Credentials::Password { username, password } = decode(b"\0bob\0hunter2").unwrap() else {
///     unreachable!()
/// };
/// assert_eq!(username, "bob");
/// assert_eq!(password.expose_secret(), "hunter2");
/// ```
pub fn decode(response: &[u8]) -> Result<Credentials, MechanismError> {
    let response = std::str::from_utf8(response).map_err(|_| MechanismError::Decode)?;
    let mut parts = response.splitn(3, '\0');

    let _authzid = parts.next().ok_or(MechanismError::Decode)?;
    let username = parts.next().ok_or(MechanismError::Decode)?;
    let password = parts.next().ok_or(MechanismError::Decode)?;

    Ok(Credentials::Password {
        username: username.to_owned(),
        password: SecretString::new(password.to_owned()),
    })
}

/// Client-first mechanism: the whole exchange is one response.
#[derive(Default)]
pub struct Plain {
    _private: (),
}

impl Exchange for Plain {
    fn eat(&mut self, response: &[u8]) -> Result<Step, MechanismError> {
        decode(response).map(Step::Done)
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use crate::Credentials;

    use super::decode;

    #[test]
    fn with_authzid() {
        let Credentials::Password { username, password } =
            decode(b"admin\0bob\0hunter2").unwrap()
        else {
            unreachable!()
        };
        assert_eq!(username, "bob");
        assert_eq!(password.expose_secret(), "hunter2");
    }

    #[test]
    fn malformed() {
        assert!(decode(b"bob").is_err());
        assert!(decode(b"\0bob").is_err());
        assert!(decode(b"\xff\0bob\0pw").is_err());
    }
}
