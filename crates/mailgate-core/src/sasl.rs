//! SASL PLAIN and LOGIN decoding
//!
//! Shared by IMAP `AUTHENTICATE` and SMTP `AUTH`. Both mechanisms carry
//! base64 payloads; only the decoding lives here, credential checks are done
//! by [`AccountService`](crate::accounts::AccountService).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

/// Malformed SASL payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaslError {
    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("invalid credential format: {0} parts")]
    InvalidFormat(usize),

    #[error("authentication cancelled")]
    Cancelled,
}

/// Credentials carried by a PLAIN or LOGIN exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

/// Decode a PLAIN response: `[authzid]\0authcid\0password`.
/// The authorization identity is ignored.
pub fn decode_plain(encoded: &str) -> Result<Credentials, SaslError> {
    let encoded = encoded.trim();
    if encoded == "*" {
        return Err(SaslError::Cancelled);
    }

    let decoded = BASE64
        .decode(encoded)
        .map_err(|_| SaslError::InvalidBase64)?;
    let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();

    let (username, secret) = match parts.as_slice() {
        [authcid, password] => (authcid, password),
        [_authzid, authcid, password] => (authcid, password),
        _ => return Err(SaslError::InvalidFormat(parts.len())),
    };

    Ok(Credentials {
        username: String::from_utf8_lossy(username).into_owned(),
        secret: String::from_utf8_lossy(secret).into_owned(),
    })
}

/// Decode one base64 line of a LOGIN exchange
pub fn decode_login_field(encoded: &str) -> Result<String, SaslError> {
    let encoded = encoded.trim();
    if encoded == "*" {
        return Err(SaslError::Cancelled);
    }
    let decoded = BASE64
        .decode(encoded)
        .map_err(|_| SaslError::InvalidBase64)?;
    Ok(String::from_utf8_lossy(&decoded).into_owned())
}

/// Base64 `Username:` challenge for AUTH LOGIN
pub fn login_challenge_username() -> String {
    BASE64.encode(b"Username:")
}

/// Base64 `Password:` challenge for AUTH LOGIN
pub fn login_challenge_password() -> String {
    BASE64.encode(b"Password:")
}
