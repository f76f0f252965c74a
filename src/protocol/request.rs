use std::fmt;

use crate::crypto::{encode_blob, to_hex};

/// One protocol command: a verb followed by space separated arguments.
///
/// `Debug` only shows the verb; arguments routinely carry secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct Request {
    verb: &'static str,
    args: Vec<String>,
}

impl Request {
    pub fn new(verb: &'static str) -> Self {
        Self {
            verb,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn blob(self, data: &[u8]) -> Self {
        self.arg(encode_blob(data))
    }

    pub fn verb(&self) -> &'static str {
        self.verb
    }

    /// Wire form without the trailing CRLF.
    pub fn line(&self) -> String {
        let mut line = String::from(self.verb);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    pub fn rsa_public() -> Self {
        Self::new("RSAPUBLIC")
    }

    pub fn list_mechanisms() -> Self {
        Self::new("LIST")
    }

    pub fn list_replicas() -> Self {
        Self::new("LIST").arg("REPLICAS")
    }

    pub fn big_random() -> Self {
        Self::new("GETBIGRANDOM")
    }

    pub fn rsa_validate(ciphertext: &[u8]) -> Self {
        Self::new("RSAVALIDATE").blob(ciphertext)
    }

    /// First negotiation step: `USER <name> AUTH <mech> [<hex token>]`.
    pub fn user_auth(user: &str, mechanism: &str, token: Option<&[u8]>) -> Self {
        let req = Self::new("USER").arg(user).arg("AUTH").arg(mechanism);
        match token {
            Some(token) => req.arg(to_hex(token)),
            None => req,
        }
    }

    /// Next client round; an empty token just acknowledges the server.
    pub fn auth2(token: &[u8]) -> Self {
        let req = Self::new("AUTH2");
        if token.is_empty() { req } else { req.arg(to_hex(token)) }
    }

    pub fn quit() -> Self {
        Self::new("QUIT")
    }

    pub fn change_pass(user: &str, secret: &[u8]) -> Self {
        Self::new("CHANGEPASS").arg(user).blob(secret)
    }

    pub fn new_user(name: &str, secret: &[u8]) -> Self {
        Self::new("NEWUSER").arg(name).blob(secret)
    }

    pub fn delete_user(user: &str) -> Self {
        Self::new("DELETEUSER").arg(user)
    }

    pub fn get_policy(user: &str, effective: bool) -> Self {
        let req = Self::new("GETPOLICY").arg(user);
        if effective { req.arg("ACTUAL") } else { req }
    }

    pub fn set_policy(user: &str, policy: &str) -> Self {
        Self::new("SETPOLICY").arg(user).arg(policy)
    }

    pub fn get_global_policy() -> Self {
        Self::new("GETGLOBALPOLICY")
    }

    pub fn set_global_policy(policy: &str) -> Self {
        Self::new("SETGLOBALPOLICY").arg(policy)
    }

    pub fn get_user_data(user: &str) -> Self {
        Self::new("GETUSERDATA").arg(user)
    }

    pub fn set_user_data(user: &str, data: &[u8]) -> Self {
        Self::new("SETUSERDATA").arg(user).blob(data)
    }

    pub fn get_id_by_name(name: &str) -> Self {
        Self::new("GETIDBYNAME").arg(name)
    }

    pub fn get_mppe_keys(user: &str, nt_response: &[u8], key_size: u32) -> Self {
        Self::new("GETMPPEKEYS")
            .arg(user)
            .arg(to_hex(nt_response))
            .arg(key_size.to_string())
    }

    /// `SYNC <sub-command> [args]`.
    pub fn sync(sub: &'static str) -> Self {
        Self::new("SYNC").arg(sub)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request({}, {} args)", self.verb, self.args.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_lines() {
        let inputs = vec![
            (Request::rsa_public(), "RSAPUBLIC"),
            (Request::list_replicas(), "LIST REPLICAS"),
            (Request::auth2(&[0xab, 0x01]), "AUTH2 ab01"),
            (Request::auth2(&[]), "AUTH2"),
            (Request::user_auth("bob", "CRAM-MD5", None), "USER bob AUTH CRAM-MD5"),
            (
                Request::user_auth("bob", "PLAIN", Some(b"\0bob\0pw")),
                "USER bob AUTH PLAIN 00626f62007077",
            ),
            (Request::get_policy("bob", true), "GETPOLICY bob ACTUAL"),
            (Request::change_pass("bob", b"abc"), "CHANGEPASS bob {3}YWJj"),
            (Request::sync("PROCESS-NO-REPLY"), "SYNC PROCESS-NO-REPLY"),
        ];

        for (req, expected) in inputs {
            assert!(req.line().starts_with(expected), "{}", req.line());
        }
    }

    #[test]
    fn debug_hides_arguments() {
        let req = Request::change_pass("bob", b"hunter2");
        let shown = format!("{req:?}");
        assert!(!shown.contains("aHVudGVyMg"));
        assert!(shown.contains("CHANGEPASS"));
    }
}
