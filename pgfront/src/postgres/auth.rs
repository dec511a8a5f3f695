//! Password responses to authentication requests.
use md5::{Digest, Md5};

use super::backend::Authentication;

/// Prefix of a hashed password response.
pub const MD5_PREFIX: &str = "md5";

/// An authentication request that can be answered with a password.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PasswordChallenge {
    /// Password is sent as is.
    Cleartext,
    /// Password is hashed with the user name and salt.
    Md5 {
        salt: [u8; 4],
    },
}

impl PasswordChallenge {
    /// Challenge of an authentication request, if it is answered with a password.
    pub fn from_request(auth: Authentication) -> Option<PasswordChallenge> {
        match auth {
            Authentication::CleartextPassword => Some(Self::Cleartext),
            Authentication::MD5Password { salt } => Some(Self::Md5 { salt }),
            _ => None,
        }
    }

    /// Payload of the password message.
    pub fn response(&self, user: &str, password: &str) -> String {
        match self {
            Self::Cleartext => password.to_owned(),
            Self::Md5 { salt } => md5_response(user, password, salt),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cleartext => "CleartextPassword",
            Self::Md5 { .. } => "MD5Password",
        }
    }
}

/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`
pub fn md5_response(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let mut md5 = Md5::new();
    md5.update(password);
    md5.update(user);
    let inner = format!("{:x}", md5.finalize_reset());

    md5.update(inner);
    md5.update(salt);
    format!("{MD5_PREFIX}{:x}", md5.finalize())
}
