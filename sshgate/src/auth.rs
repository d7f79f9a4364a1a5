// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use log::{debug, info};
use subtle::ConstantTimeEq;

use crate::Error;

/// What the client presented along with its username.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential<'a> {
    /// The `none` method.
    None,
    Password(&'a str),
}

/// Checks usernames and passwords against an optional expected pair.
///
/// An unset field accepts anything. With both fields unset every
/// client gets in, whatever method it uses.
#[derive(Debug, Clone, Default)]
pub struct AuthGate {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl AuthGate {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        AuthGate { username, password }
    }

    /// A gate that lets every client in.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.username.is_none() && self.password.is_none()
    }

    pub fn authenticate(&self, user: &str, credential: Credential<'_>) -> Result<(), Error> {
        if let Some(expected) = &self.username {
            if !constant_time_eq(expected, user) {
                debug!("rejecting unknown user {user:?}");
                return Err(Error::AuthenticationFailed);
            }
        }
        if let Some(expected) = &self.password {
            let matches = match credential {
                Credential::Password(password) => constant_time_eq(expected, password),
                Credential::None => false,
            };
            if !matches {
                debug!("rejecting bad password for {user:?}");
                return Err(Error::AuthenticationFailed);
            }
        }
        info!("authenticated {user:?}");
        Ok(())
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_only_gate() {
        let gate = AuthGate::new(Some("alice".into()), None);
        assert!(gate.authenticate("alice", Credential::Password("anything")).is_ok());
        assert!(gate.authenticate("alice", Credential::None).is_ok());
        assert!(matches!(
            gate.authenticate("bob", Credential::Password("anything")),
            Err(Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn password_gate() {
        let gate = AuthGate::new(Some("alice".into()), Some("s3cret".into()));
        assert!(gate.authenticate("alice", Credential::Password("s3cret")).is_ok());
        assert!(gate.authenticate("alice", Credential::Password("s3cre")).is_err());
        assert!(gate.authenticate("alice", Credential::None).is_err());
        assert!(gate.authenticate("bob", Credential::Password("s3cret")).is_err());
    }

    #[test]
    fn open_gate_accepts_everyone() {
        let gate = AuthGate::open();
        assert!(gate.is_open());
        assert!(gate.authenticate("", Credential::None).is_ok());
        assert!(gate.authenticate("root", Credential::Password("")).is_ok());
    }
}
