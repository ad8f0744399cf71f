use secrecy::SecretString;

use crate::Credentials;

use super::{Exchange, MechanismError, Step};

/// Prompt sent as the first LOGIN challenge.
pub const USERNAME_CHALLENGE: &[u8] = b"Username";
/// Prompt sent as the second LOGIN challenge.
pub const PASSWORD_CHALLENGE: &[u8] = b"Password";

/// Server-first mechanism with two prompts (the de-facto LOGIN exchange;
/// there is no RFC for it). An initial response to `AUTH LOGIN` counts as
/// the username.
#[derive(Default)]
pub struct Login {
    username: Option<String>,
}

impl Exchange for Login {
    fn initial(&self) -> Vec<u8> {
        USERNAME_CHALLENGE.to_vec()
    }

    fn eat(&mut self, response: &[u8]) -> Result<Step, MechanismError> {
        let response = std::str::from_utf8(response)
            .map_err(|_| MechanismError::Decode)?
            .to_owned();

        match self.username.take() {
            None => {
                self.username = Some(response);
                Ok(Step::Challenge(PASSWORD_CHALLENGE.to_vec()))
            }
            Some(username) => Ok(Step::Done(Credentials::Password {
                username,
                password: SecretString::new(response),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use crate::{sasl::Step, Credentials};

    use super::*;

    #[test]
    fn two_step() {
        let mut login = Login::default();
        assert_eq!(login.initial(), USERNAME_CHALLENGE);

        let Step::Challenge(prompt) = login.eat(b"bob").unwrap() else {
            panic!("expected password prompt")
        };
        assert_eq!(prompt, PASSWORD_CHALLENGE);

        let Step::Done(Credentials::Password { username, password }) =
            login.eat(b"hunter2").unwrap()
        else {
            panic!("expected credentials")
        };
        assert_eq!(username, "bob");
        assert_eq!(password.expose_secret(), "hunter2");
    }
}
