//! authenticated, timestamped value signing for cookies.
//!
//! Wire format (version 2):
//! `base64(value) | timestamp-seconds | hex(hmac-sha1(secret, name ++ b64 ++ ts)) [| key-version]`
//!
//! The value is base64 and therefore pipe-free, which makes the format
//! splittable on `|`. Version 1 lacks the trailing key-version field.

use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::engine::{Engine, general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tracing::warn;

type HmacSha1 = Hmac<Sha1>;

/// Secret material: one key, or a rotation map signed with the newest key
/// and verified against whichever version the value names.
#[derive(Clone)]
pub enum KeySet {
    Single(Vec<u8>),
    Versioned(BTreeMap<u32, Vec<u8>>),
}

impl KeySet {
    pub fn single(secret: impl Into<Vec<u8>>) -> Self {
        Self::Single(secret.into())
    }

    pub fn versioned(keys: BTreeMap<u32, Vec<u8>>) -> Self {
        assert!(!keys.is_empty(), "versioned key set needs at least one key");
        Self::Versioned(keys)
    }

    /// key used for new signatures, with its version when rotating.
    fn signing_key(&self) -> (&[u8], Option<u32>) {
        match self {
            Self::Single(key) => (key, None),
            Self::Versioned(keys) => {
                let (version, key) = keys.last_key_value().expect("checked non-empty");
                (key, Some(*version))
            }
        }
    }

    fn key_for(&self, version: Option<u32>) -> Option<&[u8]> {
        match (self, version) {
            (Self::Single(key), None) => Some(key),
            (Self::Versioned(keys), Some(version)) => keys.get(&version).map(Vec::as_slice),
            // a versioned set accepts unversioned values signed with any key
            // only by trial; reject instead of guessing.
            _ => None,
        }
    }
}

fn signature(secret: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(secret).expect("hmac accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

fn now_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_secs()
}

/// sign `value` under `name`, stamped with the current time.
pub fn create_signed_value(keys: &KeySet, name: &str, value: &[u8]) -> String {
    create_signed_value_at(keys, name, value, now_seconds())
}

/// sign with an explicit clock reading.
pub fn create_signed_value_at(keys: &KeySet, name: &str, value: &[u8], clock: u64) -> String {
    let (key, version) = keys.signing_key();
    let encoded = BASE64.encode(value);
    let timestamp = clock.to_string();
    let tag = signature(key, &[name.as_bytes(), encoded.as_bytes(), timestamp.as_bytes()]);

    let mut out = String::with_capacity(encoded.len() + timestamp.len() + 44);
    out.push_str(&encoded);
    out.push('|');
    out.push_str(&timestamp);
    out.push('|');
    out.push_str(&hex::encode(tag));
    if let Some(version) = version {
        out.push('|');
        out.push_str(&version.to_string());
    }
    out
}

/// verify and decode a signed value. `None` on any mismatch: wrong
/// signature, expired timestamp, malformed structure, unknown key version
/// or version below `min_version`.
pub fn decode_signed_value(
    keys: &KeySet,
    name: &str,
    value: &str,
    max_age_days: Option<f64>,
    min_version: Option<u32>,
) -> Option<Vec<u8>> {
    decode_signed_value_at(keys, name, value, max_age_days, min_version, now_seconds())
}

/// verify with an explicit clock reading.
pub fn decode_signed_value_at(
    keys: &KeySet,
    name: &str,
    value: &str,
    max_age_days: Option<f64>,
    min_version: Option<u32>,
    clock: u64,
) -> Option<Vec<u8>> {
    let fields: Vec<&str> = value.split('|').collect();
    let (encoded, timestamp, tag_hex, key_version) = match fields.as_slice() {
        [encoded, timestamp, tag] => (*encoded, *timestamp, *tag, None),
        [encoded, timestamp, tag, version] => {
            let version: u32 = version.parse().ok()?;
            (*encoded, *timestamp, *tag, Some(version))
        }
        _ => return None,
    };

    if let (Some(min), Some(version)) = (min_version, key_version) {
        if version < min {
            return None;
        }
    }

    let key = keys.key_for(key_version)?;
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(name.as_bytes());
    mac.update(encoded.as_bytes());
    mac.update(timestamp.as_bytes());
    let tag = hex::decode(tag_hex).ok()?;
    // constant time comparison.
    mac.verify_slice(&tag).ok()?;

    let signed_at: u64 = timestamp.parse().ok()?;
    if let Some(max_age_days) = max_age_days {
        let max_age = (max_age_days * 86400.0) as u64;
        if signed_at < clock.saturating_sub(max_age) {
            warn!(target: "signed_value", "expired signed value for {name}");
            return None;
        }
        // a timestamp far in the future is as suspect as an expired one.
        if signed_at > clock + 86400 {
            warn!(target: "signed_value", "signed value for {name} timestamped in the future");
            return None;
        }
    }

    BASE64.decode(encoded).ok()
}

/// key version named by a signed value, when present.
pub fn signature_key_version(value: &str) -> Option<u32> {
    let fields: Vec<&str> = value.split('|').collect();
    match fields.as_slice() {
        [_, _, _, version] => version.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn keys() -> KeySet {
        KeySet::single(b"s".to_vec())
    }

    #[test]
    fn roundtrip() {
        let signed = create_signed_value_at(&keys(), "u", b"bob", 1_000_000);
        let decoded = decode_signed_value_at(&keys(), "u", &signed, Some(1.0), None, 1_000_000).unwrap();
        assert_eq!(decoded, b"bob");
    }

    #[test]
    fn wire_shape() {
        let signed = create_signed_value_at(&keys(), "u", b"bob", 1_000_000);
        let fields: Vec<&str> = signed.split('|').collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0], BASE64.encode(b"bob"));
        assert_eq!(fields[1], "1000000");
        // hmac-sha1 is 20 bytes, 40 hex characters.
        assert_eq!(fields[2].len(), 40);
        assert!(fields[2].bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn any_single_bit_flip_is_rejected() {
        let signed = create_signed_value_at(&keys(), "u", b"bob", 1_000_000);
        let bytes = signed.as_bytes();
        for i in 0..bytes.len() {
            for bit in 0..8 {
                let mut corrupted = bytes.to_vec();
                corrupted[i] ^= 1 << bit;
                let Ok(corrupted) = String::from_utf8(corrupted) else {
                    continue;
                };
                if corrupted == signed {
                    continue;
                }
                assert_eq!(
                    decode_signed_value_at(&keys(), "u", &corrupted, Some(1.0), None, 1_000_000),
                    None,
                    "flip at byte {i} bit {bit} must not validate"
                );
            }
        }
    }

    #[test]
    fn expiry_after_two_days() {
        let signed = create_signed_value_at(&keys(), "u", b"bob", 1_000_000);
        let two_days_later = 1_000_000 + 2 * 86400;
        assert_eq!(
            decode_signed_value_at(&keys(), "u", &signed, Some(1.0), None, two_days_later),
            None
        );
        // still valid within the window.
        assert!(decode_signed_value_at(&keys(), "u", &signed, Some(31.0), None, two_days_later).is_some());
    }

    #[test]
    fn name_binds_the_signature() {
        let signed = create_signed_value_at(&keys(), "user", b"bob", 1_000_000);
        assert_eq!(
            decode_signed_value_at(&keys(), "admin", &signed, Some(1.0), None, 1_000_000),
            None
        );
    }

    #[test]
    fn key_rotation() {
        let mut map = BTreeMap::new();
        map.insert(1u32, b"old-secret".to_vec());
        map.insert(2u32, b"new-secret".to_vec());
        let rotating = KeySet::versioned(map.clone());

        let signed = create_signed_value_at(&rotating, "u", b"bob", 1_000_000);
        assert_eq!(signature_key_version(&signed), Some(2));
        assert_eq!(
            decode_signed_value_at(&rotating, "u", &signed, Some(1.0), None, 1_000_000).unwrap(),
            b"bob"
        );

        // a value signed by the old key still verifies.
        let mut old_only = BTreeMap::new();
        old_only.insert(1u32, b"old-secret".to_vec());
        let old = KeySet::versioned(old_only);
        let old_signed = create_signed_value_at(&old, "u", b"alice", 1_000_000);
        assert_eq!(
            decode_signed_value_at(&rotating, "u", &old_signed, Some(1.0), None, 1_000_000).unwrap(),
            b"alice"
        );

        // unless min_version forbids it.
        assert_eq!(
            decode_signed_value_at(&rotating, "u", &old_signed, Some(1.0), Some(2), 1_000_000),
            None
        );
    }

    #[test]
    fn unknown_key_version_rejected() {
        let mut map = BTreeMap::new();
        map.insert(1u32, b"k".to_vec());
        let keys = KeySet::versioned(map);
        let signed = create_signed_value_at(&keys, "u", b"bob", 1_000_000);
        let renamed = format!("{}|9", signed.strip_suffix("|1").unwrap());
        assert_eq!(decode_signed_value_at(&keys, "u", &renamed, Some(1.0), None, 1_000_000), None);
    }
}
