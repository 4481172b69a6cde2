use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{CapsuleError, CapsuleResult};

pub const HMAC_ALG: &str = "HMAC-SHA256";

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over the UTF-8 message, keyed with the raw UTF-8 secret.
///
/// The secret is not stretched. This is a weaker keying path than anchor
/// encryption and verifiers in the wild expect exactly this construction.
pub fn hmac_sign(secret: &str, message: &str) -> CapsuleResult<String> {
    let mac = keyed(secret, message)?;
    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a base64 tag produced by [`hmac_sign`].
pub fn hmac_verify(secret: &str, message: &str, tag: &str) -> CapsuleResult<bool> {
    let expected = BASE64_STANDARD
        .decode(tag.as_bytes())
        .map_err(|source| CapsuleError::Base64 {
            field: "hmac",
            source,
        })?;
    let mac = keyed(secret, message)?;
    Ok(mac.verify_slice(&expected).is_ok())
}

fn keyed(secret: &str, message: &str) -> CapsuleResult<HmacSha256> {
    if secret.is_empty() {
        return Err(CapsuleError::EmptySecret);
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| CapsuleError::Encrypt(format!("hmac key rejected: {err}")))?;
    mac.update(message.as_bytes());
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonicalize;
    use serde_json::json;

    #[test]
    fn matches_rfc4231_case_two() {
        let tag = hmac_sign("Jefe", "what do ya want for nothing?").unwrap();
        let expected = BASE64_STANDARD.encode(
            [
                0x5b, 0xdc, 0xc1, 0x46, 0xbf, 0x60, 0x75, 0x4e, 0x6a, 0x04, 0x24, 0x26, 0x08, 0x95,
                0x75, 0xc7, 0x5a, 0x00, 0x3f, 0x08, 0x9d, 0x27, 0x39, 0x83, 0x9d, 0xec, 0x58, 0xb9,
                0x64, 0xec, 0x38, 0x43,
            ],
        );
        assert_eq!(tag, expected);
    }

    #[test]
    fn signing_is_deterministic_and_value_sensitive() {
        let data = json!({"b": [1, 2], "a": "x"});
        let first = hmac_sign("secret", &canonicalize(&data).unwrap()).unwrap();
        let second = hmac_sign("secret", &canonicalize(&data).unwrap()).unwrap();
        assert_eq!(first, second);

        let reordered: serde_json::Value = serde_json::from_str(r#"{"a":"x","b":[1,2]}"#).unwrap();
        assert_eq!(
            first,
            hmac_sign("secret", &canonicalize(&reordered).unwrap()).unwrap()
        );

        let changed = json!({"b": [1, 3], "a": "x"});
        assert_ne!(
            first,
            hmac_sign("secret", &canonicalize(&changed).unwrap()).unwrap()
        );
    }

    #[test]
    fn verify_accepts_own_tags_only() {
        let tag = hmac_sign("k", "message").unwrap();
        assert!(hmac_verify("k", "message", &tag).unwrap());
        assert!(!hmac_verify("k", "messagf", &tag).unwrap());
        assert!(!hmac_verify("other", "message", &tag).unwrap());
        assert!(hmac_verify("k", "message", "%%%").is_err());
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(matches!(
            hmac_sign("", "message"),
            Err(CapsuleError::EmptySecret)
        ));
    }
}
