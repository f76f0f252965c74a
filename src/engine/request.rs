use std::fmt;

use zeroize::Zeroizing;

use crate::{
    continuation::ContinuationToken,
    error::{Error, Result},
    sasl::{AuthMethod, MethodKind},
};

/// Output budget when the host does not name one.
pub const DEFAULT_MAX_OUTPUT: usize = 16 * 1024;

/// A decoded host request: which method, for whom, with what.
///
/// For administrative methods `username`/`secret` name the administrator and
/// `target` the account acted upon (the administrator's own account when
/// absent).
pub struct AuthRequest {
    pub method: AuthMethod,
    pub username: String,
    pub secret: Zeroizing<Vec<u8>>,
    /// Relay methods: the challenge the caller issued.
    pub challenge: Vec<u8>,
    /// Relay methods: the response the caller received. Interactive
    /// methods: the answer to the server's last challenge.
    pub response: Vec<u8>,
    pub target: Option<String>,
    pub new_secret: Zeroizing<Vec<u8>>,
    /// Method specific argument (policy text, user data, sync payload, ...).
    pub value: Vec<u8>,
    /// Authenticate without remembering the user for later privileged calls.
    pub auth_only: bool,
    pub max_output: usize,
    pub continuation: Option<ContinuationToken>,
}

impl AuthRequest {
    pub fn new(method: AuthMethod, username: impl Into<String>) -> Self {
        Self {
            method,
            username: username.into(),
            secret: Zeroizing::new(Vec::new()),
            challenge: Vec::new(),
            response: Vec::new(),
            target: None,
            new_secret: Zeroizing::new(Vec::new()),
            value: Vec::new(),
            auth_only: false,
            max_output: DEFAULT_MAX_OUTPUT,
            continuation: None,
        }
    }

    pub fn secret(mut self, secret: &[u8]) -> Self {
        self.secret = Zeroizing::new(secret.to_vec());
        self
    }

    pub fn challenge(mut self, challenge: &[u8]) -> Self {
        self.challenge = challenge.to_vec();
        self
    }

    pub fn response(mut self, response: &[u8]) -> Self {
        self.response = response.to_vec();
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn new_secret(mut self, secret: &[u8]) -> Self {
        self.new_secret = Zeroizing::new(secret.to_vec());
        self
    }

    pub fn value(mut self, value: &[u8]) -> Self {
        self.value = value.to_vec();
        self
    }

    pub fn auth_only(mut self, auth_only: bool) -> Self {
        self.auth_only = auth_only;
        self
    }

    pub fn max_output(mut self, max: usize) -> Self {
        self.max_output = max;
        self
    }

    pub fn resume(mut self, token: ContinuationToken) -> Self {
        self.continuation = Some(token);
        self
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.max_output == 0 {
            return Err(Error::BufferTooSmall { need: 1, have: 0 });
        }
        if self.continuation.is_some() {
            return Ok(());
        }

        let info = self.method.info();
        if info.kind != MethodKind::Bypass && self.username.trim().is_empty() {
            return Err(Error::Parameter(format!("{} needs a username", self.method)));
        }
        if info.kind == MethodKind::Relay && self.response.is_empty() {
            return Err(Error::Parameter(format!("{} needs a response", self.method)));
        }
        if matches!(
            self.method,
            AuthMethod::SetPassword
                | AuthMethod::SetPasswordAsRoot
                | AuthMethod::ChangePassword
                | AuthMethod::NewUser
        ) && self.new_secret.is_empty()
        {
            return Err(Error::Parameter(format!("{} needs a new secret", self.method)));
        }
        Ok(())
    }
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("method", &self.method)
            .field("username", &self.username)
            .field("target", &self.target)
            .field("auth_only", &self.auth_only)
            .field("max_output", &self.max_output)
            .field("continuation", &self.continuation)
            .finish()
    }
}

/// Success flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Complete,
    /// Authenticated, but the password must be changed before normal use.
    PasswordChangeRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub status: AuthStatus,
    pub data: Vec<u8>,
    /// Pass back with [`AuthRequest::resume`] for the next part.
    pub continuation: Option<ContinuationToken>,
}

impl AuthResponse {
    pub(crate) fn complete(data: Vec<u8>) -> Self {
        Self {
            status: AuthStatus::Complete,
            data,
            continuation: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.continuation.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_output_budget() {
        let req = AuthRequest::new(AuthMethod::ClearText, "bob").max_output(0);
        assert!(matches!(
            req.check(),
            Err(Error::BufferTooSmall { need: 1, have: 0 })
        ));
    }

    #[test]
    fn required_fields() {
        assert!(AuthRequest::new(AuthMethod::ClearText, "").check().is_err());
        assert!(AuthRequest::new(AuthMethod::GetIdByName, "").check().is_ok());
        assert!(AuthRequest::new(AuthMethod::Apop, "bob").check().is_err());
        assert!(
            AuthRequest::new(AuthMethod::Apop, "bob")
                .challenge(b"<1@h>")
                .response(b"abc")
                .check()
                .is_ok()
        );
        assert!(AuthRequest::new(AuthMethod::ChangePassword, "bob").check().is_err());
    }

    #[test]
    fn debug_hides_secrets() {
        let req = AuthRequest::new(AuthMethod::ClearText, "bob").secret(b"hunter2");
        assert!(!format!("{req:?}").contains("hunter2"));
    }
}
