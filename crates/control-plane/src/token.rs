use base32::Alphabet;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::hashing::hex_encode;
use crate::models::{DeviceAuthToken, EnrollToken};

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_BYTES: usize = 32;
pub const TOKEN_PREFIX_CHARS: usize = 8;

const TOKEN_ALPHABET: Alphabet = Alphabet::Rfc4648Lower { padding: false };

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenCheck {
    Valid,
    Expired,
    Revoked,
    NotFound,
    Used,
}

/// Raw token plus its stored forms. The raw value leaves the process exactly
/// once, in the response that minted it.
#[derive(Clone)]
pub struct MintedToken {
    pub raw: String,
    pub hash: String,
    pub prefix: String,
}

#[derive(Clone)]
pub struct TokenService {
    pepper: Vec<u8>,
}

impl TokenService {
    pub fn new(pepper: &str) -> Self {
        Self {
            pepper: pepper.as_bytes().to_vec(),
        }
    }

    pub fn mint(&self) -> MintedToken {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let raw = base32::encode(TOKEN_ALPHABET, &bytes);
        let hash = self.hash(&raw);
        let prefix = raw.chars().take(TOKEN_PREFIX_CHARS).collect();
        MintedToken { raw, hash, prefix }
    }

    /// Peppered token hash: lowercase hex of HMAC-SHA256(pepper, token).
    /// Lookup is by hash equality, so the raw value is never persisted.
    pub fn hash(&self, raw: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.pepper).expect("hmac accepts any key length");
        mac.update(raw.as_bytes());
        hex_encode(&mac.finalize().into_bytes())
    }
}

pub fn check_enroll_token(token: &EnrollToken, now: DateTime<Utc>) -> TokenCheck {
    if token.used_at.is_some() {
        return TokenCheck::Used;
    }
    if token.revoked_at.is_some() {
        return TokenCheck::Revoked;
    }
    if let Some(expires_at) = token.expires_at {
        if expires_at <= now {
            return TokenCheck::Expired;
        }
    }
    TokenCheck::Valid
}

pub fn check_device_token(token: &DeviceAuthToken) -> TokenCheck {
    if token.revoked_at.is_some() {
        return TokenCheck::Revoked;
    }
    TokenCheck::Valid
}
