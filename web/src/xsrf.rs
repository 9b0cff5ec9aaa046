//! cross-site request forgery protection.
//!
//! The `_xsrf` cookie (version 2) is `2|timestamp|hex(token16)`. The token
//! exposed to forms and headers is freshly masked per response:
//! `hex(mask4) ++ hex(mask xor token)`, which keeps the cookie value out of
//! compressed response bodies (BREACH).

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

/// raw token size in bytes.
const TOKEN_LEN: usize = 16;
const MASK_LEN: usize = 4;

/// A decoded or freshly generated XSRF token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct XsrfToken {
    token: [u8; TOKEN_LEN],
    timestamp: u64,
    /// true when the token was created for this request and its cookie
    /// still needs to be set.
    pub fresh: bool,
}

impl XsrfToken {
    /// generate a new random token.
    pub fn generate() -> Self {
        let mut token = [0u8; TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut token);
        Self {
            token,
            timestamp: now_seconds(),
            fresh: true,
        }
    }

    /// parse a `_xsrf` cookie. version 2 is the structured form; a bare
    /// 32-character hex string is accepted as a legacy version 1 token.
    pub fn from_cookie(value: &str) -> Option<Self> {
        if let Some(rest) = value.strip_prefix("2|") {
            let (timestamp, token_hex) = rest.split_once('|')?;
            let timestamp: u64 = timestamp.parse().ok()?;
            let token = decode_token(token_hex)?;
            return Some(Self {
                token,
                timestamp,
                fresh: false,
            });
        }
        // version 1 cookie: the raw hex token. re-issued as v2 on first use.
        let token = decode_token(value)?;
        Some(Self {
            token,
            timestamp: now_seconds(),
            fresh: true,
        })
    }

    /// serialize the version 2 cookie value.
    pub fn cookie_value(&self) -> String {
        format!("2|{}|{}", self.timestamp, hex::encode(self.token))
    }

    /// a freshly masked token for embedding in forms and headers.
    pub fn masked(&self) -> String {
        let mut mask = [0u8; MASK_LEN];
        rand::thread_rng().fill_bytes(&mut mask);
        let mut masked = self.token;
        xor_mask(&mut masked, mask);
        format!("{}{}", hex::encode(mask), hex::encode(masked))
    }

    /// check a token supplied by a form field or header against this one.
    pub fn verify(&self, supplied: &str) -> bool {
        match supplied.len() {
            // masked v2 form: mask ++ masked token.
            l if l == 2 * (MASK_LEN + TOKEN_LEN) => {
                let Ok(mask) = hex::decode(&supplied[..2 * MASK_LEN]) else {
                    return false;
                };
                let Ok(masked) = hex::decode(&supplied[2 * MASK_LEN..]) else {
                    return false;
                };
                let mut unmasked = [0u8; TOKEN_LEN];
                unmasked.copy_from_slice(&masked);
                xor_mask(&mut unmasked, [mask[0], mask[1], mask[2], mask[3]]);
                constant_time_eq(&unmasked, &self.token)
            }
            // legacy v1 form: the raw token.
            l if l == 2 * TOKEN_LEN => match decode_token(supplied) {
                Some(token) => constant_time_eq(&token, &self.token),
                None => false,
            },
            _ => false,
        }
    }

    /// age of the token in seconds at `now`.
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }
}

fn decode_token(hex_str: &str) -> Option<[u8; TOKEN_LEN]> {
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

fn xor_mask(buf: &mut [u8; TOKEN_LEN], mask: [u8; MASK_LEN]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i % MASK_LEN];
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

fn now_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_secs()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mask_roundtrip() {
        let token = XsrfToken::generate();
        let masked = token.masked();
        assert_eq!(masked.len(), 40);
        assert!(token.verify(&masked));
        // every masking is unique but all verify.
        let other = token.masked();
        assert_ne!(masked, other);
        assert!(token.verify(&other));
    }

    #[test]
    fn wrong_token_fails() {
        let token = XsrfToken::generate();
        let intruder = XsrfToken::generate();
        assert!(!token.verify(&intruder.masked()));
        assert!(!token.verify("2f2f"));
        assert!(!token.verify(""));
        assert!(!token.verify(&"zz".repeat(20)));
    }

    #[test]
    fn cookie_roundtrip() {
        let token = XsrfToken::generate();
        let cookie = token.cookie_value();
        assert!(cookie.starts_with("2|"));
        let parsed = XsrfToken::from_cookie(&cookie).unwrap();
        assert_eq!(parsed.token, token.token);
        assert!(!parsed.fresh);
        assert!(parsed.verify(&token.masked()));
    }

    #[test]
    fn legacy_v1_cookie_upgrades() {
        let token = XsrfToken::generate();
        let v1 = hex::encode(token.token);
        let parsed = XsrfToken::from_cookie(&v1).unwrap();
        assert_eq!(parsed.token, token.token);
        // a v1 cookie is re-issued in the v2 format.
        assert!(parsed.fresh);
    }

    #[test]
    fn raw_v1_form_token_accepted() {
        let token = XsrfToken::generate();
        assert!(token.verify(&hex::encode(token.token)));
    }

    #[test]
    fn malformed_cookies_rejected() {
        assert!(XsrfToken::from_cookie("").is_none());
        assert!(XsrfToken::from_cookie("2|abc").is_none());
        assert!(XsrfToken::from_cookie("2|123|zz").is_none());
        assert!(XsrfToken::from_cookie("3|123|2f2f").is_none());
    }
}
