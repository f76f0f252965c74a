use crate::error::Error;

use super::TransportError;

/// Account and password policy failures from the `POLICY` namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PolicyCode {
    AccountDisabled = 1,
    AccountExpired = 2,
    AccountInactive = 3,
    PasswordExpired = 4,
    TooShort = 5,
    TooLong = 6,
    NeedsLetter = 7,
    NeedsDigit = 8,
    SameAsName = 9,
    RecentlyUsed = 10,
    NeedsMixedCase = 11,
    ChangeTooSoon = 12,
    NotAuthorized = 13,
    AuthFailed = 14,
    ResetRequired = 15,
    TooManyFailedLogins = 16,
}

impl PolicyCode {
    pub fn from_code(code: i32) -> Option<Self> {
        use PolicyCode::*;

        Some(match code {
            1 => AccountDisabled,
            2 => AccountExpired,
            3 => AccountInactive,
            4 => PasswordExpired,
            5 => TooShort,
            6 => TooLong,
            7 => NeedsLetter,
            8 => NeedsDigit,
            9 => SameAsName,
            10 => RecentlyUsed,
            11 => NeedsMixedCase,
            12 => ChangeTooSoon,
            13 => NotAuthorized,
            14 => AuthFailed,
            15 => ResetRequired,
            16 => TooManyFailedLogins,
            _ => return None,
        })
    }

    /// The credentials were accepted but the password must be changed now.
    pub fn requires_change(self) -> bool {
        matches!(self, PolicyCode::PasswordExpired | PolicyCode::ResetRequired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSpace {
    Sasl,
    Policy,
    Other(String),
}

/// A `-ERR` reply: the top-level code plus an optional namespaced code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
    pub code: i32,
    pub detail: Option<(ErrorSpace, i32)>,
}

impl WireError {
    pub fn policy(&self) -> Option<PolicyCode> {
        match self.detail {
            Some((ErrorSpace::Policy, code)) => PolicyCode::from_code(code),
            _ => None,
        }
    }

    fn parse(rest: &str) -> Result<Self, TransportError> {
        let mut parts = rest.split_whitespace();
        let code = parts
            .next()
            .and_then(|c| c.parse::<i32>().ok())
            .ok_or_else(|| TransportError::Malformed(format!("-ERR {rest}")))?;

        let detail = match (parts.next(), parts.next().and_then(|c| c.parse().ok())) {
            (Some(space), Some(sub)) => {
                let space = match space {
                    "SASL" => ErrorSpace::Sasl,
                    "POLICY" => ErrorSpace::Policy,
                    other => ErrorSpace::Other(other.to_string()),
                };
                Some((space, sub))
            }
            _ => None,
        };
        Ok(Self { code, detail })
    }
}

impl From<WireError> for Error {
    fn from(value: WireError) -> Self {
        match value.detail {
            Some((ErrorSpace::Sasl, code)) => {
                Error::negotiation(code, format!("server rejected negotiation ({})", value.code))
            }
            Some((ErrorSpace::Policy, code)) => match PolicyCode::from_code(code) {
                Some(
                    PolicyCode::AccountDisabled
                    | PolicyCode::AccountInactive
                    | PolicyCode::TooManyFailedLogins,
                ) => Error::AccountDisabled,
                Some(PolicyCode::AccountExpired) => Error::AccountExpired,
                Some(PolicyCode::NotAuthorized) => Error::NotAuthorized,
                Some(PolicyCode::AuthFailed) => Error::AuthFailed,
                Some(policy) => Error::PasswordPolicy(policy),
                None => Error::Server {
                    reason: format!("unknown policy code {code}"),
                    code: Some(value.code),
                },
            },
            Some((ErrorSpace::Other(space), code)) => Error::Server {
                reason: format!("{space} error {code}"),
                code: Some(value.code),
            },
            None => Error::Server {
                reason: "server returned an error".to_string(),
                code: Some(value.code),
            },
        }
    }
}

/// One reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK[ payload]`
    Ok(String),
    /// `+AUTHOK payload`: the exchange continues.
    Continue(String),
    Err(WireError),
}

impl Reply {
    pub fn parse(line: &str) -> Result<Self, TransportError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (status, rest) = line.split_once(' ').unwrap_or((line, ""));

        match status {
            "+OK" => Ok(Reply::Ok(rest.to_string())),
            "+AUTHOK" => Ok(Reply::Continue(rest.to_string())),
            "-ERR" => Ok(Reply::Err(WireError::parse(rest)?)),
            _ => Err(TransportError::Malformed(format!(
                "unknown status token '{status}'"
            ))),
        }
    }

    /// Payload of a finished command; anything else becomes an error.
    pub fn into_payload(self) -> Result<String, Error> {
        match self {
            Reply::Ok(payload) => Ok(payload),
            Reply::Continue(_) => Err(Error::server("unexpected continuation reply")),
            Reply::Err(err) => Err(err.into()),
        }
    }
}
