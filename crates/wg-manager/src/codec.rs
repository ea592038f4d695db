//! Base64 text form of `WireGuard` keys.
//!
//! A 32-byte key always encodes to 44 characters ending in a single `=`.
//! Decoding is strict: anything that is not exactly that shape is rejected,
//! even if it is otherwise valid Base64.

use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, WireGuardError};

/// `WireGuard` key size in bytes (256-bit Curve25519 keys).
pub const KEY_SIZE: usize = 32;

/// Length of the canonical Base64 form of a key.
pub const ENCODED_KEY_LEN: usize = 44;

static BASE64_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9+/]{4})*(?:[A-Za-z0-9+/]{2}==|[A-Za-z0-9+/]{3}=|[A-Za-z0-9+/]{4})$")
        .unwrap_or_else(|_| unreachable!())
});

/// Decodes the canonical text form of a key.
///
/// # Errors
///
/// Returns [`WireGuardError::InvalidKeyEncoding`] if the text is not 44
/// characters of padded Base64 or does not decode to exactly 32 bytes.
pub fn decode(text: &str) -> Result<[u8; KEY_SIZE]> {
    if text.len() != ENCODED_KEY_LEN {
        return Err(WireGuardError::InvalidKeyEncoding(format!(
            "expected {ENCODED_KEY_LEN} characters, got {}",
            text.len()
        )));
    }
    if !BASE64_REGEX.is_match(text) {
        return Err(WireGuardError::InvalidKeyEncoding(
            "not a padded Base64 string".to_string(),
        ));
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| WireGuardError::InvalidKeyEncoding(e.to_string()))?;

    <[u8; KEY_SIZE]>::try_from(bytes.as_slice()).map_err(|_| {
        WireGuardError::InvalidKeyEncoding(format!(
            "expected {KEY_SIZE} bytes, got {}",
            bytes.len()
        ))
    })
}

/// Decodes an optional key field. Empty (or all-whitespace) text is absent.
///
/// # Errors
///
/// Same as [`decode`] for non-empty input.
pub fn decode_optional(text: &str) -> Result<Option<[u8; KEY_SIZE]>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    decode(text).map(Some)
}

/// Encodes a key in canonical Base64 (always 44 characters).
#[must_use]
pub fn encode(key: &[u8; KEY_SIZE]) -> String {
    base64::engine::general_purpose::STANDARD.encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const SAMPLE: &str = "GEd85EVCEFq5NfKEeTbRUHRutLF0+1WNEP4WG8Aq1kc=";

    #[test]
    fn decodes_real_key() {
        let key = decode(SAMPLE).expect("valid key");
        assert_eq!(encode(&key), SAMPLE);
    }

    #[test]
    fn encode_is_always_44_chars() {
        assert_eq!(encode(&[0u8; KEY_SIZE]).len(), ENCODED_KEY_LEN);
        assert_eq!(encode(&[0xffu8; KEY_SIZE]).len(), ENCODED_KEY_LEN);
    }

    #[test_case("" ; "empty")]
    #[test_case("GEd85EVCEFq5NfKEeTbRUHRutLF0+1WNEP4WG8Aq1k=" ; "43 chars")]
    #[test_case("GEd85EVCEFq5NfKEeTbRUHRutLF0+1WNEP4WG8Aq1kc==" ; "45 chars")]
    #[test_case("GEd85EVCEFq5NfKEeTbRUHRutLF0+1WNEP4WG8Aq1kcA" ; "no padding")]
    #[test_case("GEd85EVCEFq5NfKEeTbRUHRutLF0+1WNEP4WG8Aq1g==" ; "double padding decodes to 31 bytes")]
    #[test_case("GEd85EVCEFq5NfKEeTbRUHRutLF0-1WNEP4WG8Aq1kc=" ; "url-safe alphabet")]
    #[test_case("GEd85EVCEFq5NfKEeTbRUHRutLF0+1WNEP4WG8A=q1kc" ; "padding in the middle")]
    #[test_case("GEd85EVCEFq5NfKEeTbRUHRutLF0+1WNEP4WG8Aq1kd=" ; "non-canonical trailing bits")]
    fn rejects_malformed(text: &str) {
        assert!(matches!(
            decode(text),
            Err(WireGuardError::InvalidKeyEncoding(_))
        ));
    }

    #[test]
    fn optional_treats_empty_as_absent() {
        assert_eq!(decode_optional("").expect("empty is fine"), None);
        assert_eq!(decode_optional("   ").expect("blank is fine"), None);
        assert!(decode_optional(SAMPLE).expect("valid").is_some());
        assert!(decode_optional("abc").is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_inverts_encode(bytes in prop::array::uniform32(any::<u8>())) {
                let text = encode(&bytes);
                prop_assert_eq!(text.len(), ENCODED_KEY_LEN);
                prop_assert!(text.ends_with('=') && !text.ends_with("=="));
                prop_assert_eq!(decode(&text).ok(), Some(bytes));
            }

            #[test]
            fn wrong_length_always_rejected(text in "[A-Za-z0-9+/=]{0,80}") {
                prop_assume!(text.len() != ENCODED_KEY_LEN);
                prop_assert!(decode(&text).is_err());
            }
        }
    }
}
