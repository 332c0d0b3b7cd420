//! Username/password authentication for SMTP.
//!
//! Supports the two SASL mechanisms that carry plain credentials:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but widely used)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};

/// Authentication methods supported by the mailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication (obsolete).
    Login,
}

impl AuthMethod {
    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
        }
    }

    /// Returns the priority for auto-selection (higher is better).
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }

    /// Parses from SMTP capability string.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            _ => None,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mechanism_name())
    }
}

/// Username and password for SMTP AUTH.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    /// Creates credentials from an already protected password.
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    /// Creates credentials from a plain password string.
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(username, SecretString::new(password.into()))
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the protected password.
    pub fn password(&self) -> &SecretString {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// SASL encodings and mechanism selection.
pub struct Authenticator;

impl Authenticator {
    /// Generates the initial response for PLAIN authentication.
    pub fn plain_initial_response(credentials: &Credentials) -> String {
        // Format: \0username\0password
        let response = format!(
            "\0{}\0{}",
            credentials.username,
            credentials.password.expose_secret()
        );
        BASE64.encode(response)
    }

    /// Generates LOGIN username response.
    pub fn login_username(credentials: &Credentials) -> String {
        BASE64.encode(&credentials.username)
    }

    /// Generates LOGIN password response.
    pub fn login_password(credentials: &Credentials) -> String {
        BASE64.encode(credentials.password.expose_secret())
    }

    /// Selects the best authentication method from those the server offers.
    ///
    /// Both mechanisms send the password in the clear, so they are only
    /// offered over TLS unless `allow_plaintext` is set.
    pub fn select_method(
        available: &[AuthMethod],
        tls_enabled: bool,
        allow_plaintext: bool,
    ) -> SmtpResult<AuthMethod> {
        if !tls_enabled && !allow_plaintext {
            return Err(SmtpError::new(
                SmtpErrorKind::AuthMethodNotSupported,
                "Refusing to send credentials over an unencrypted connection",
            ));
        }

        available
            .iter()
            .copied()
            .max_by_key(|m| m.priority())
            .ok_or_else(|| {
                SmtpError::new(
                    SmtpErrorKind::AuthMethodNotSupported,
                    "Server offers neither AUTH PLAIN nor AUTH LOGIN",
                )
            })
    }
}
