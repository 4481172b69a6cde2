use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value, json};
use sha2::Sha256;

use crate::floats::{pack_floats, unpack_floats};
use crate::{CapsuleError, CapsuleResult};

pub const ANCHOR_ALG: &str = "AES-GCM";
pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;
const KEY_LEN: usize = 32;

const ANCHOR_FIELD: &str = "anchor";
const ANCHOR_ENC_FIELD: &str = "anchor_enc";

/// Encrypted replacement for a constellation's plaintext `anchor`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorEnc {
    pub alg: String,
    pub iv: String,
    pub salt: String,
    pub ct: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyUsage {
    Encrypt,
    Decrypt,
}

/// AES-256-GCM key stretched from a passphrase, usable for exactly one direction.
pub struct DerivedKey {
    usage: KeyUsage,
    cipher: Aes256Gcm,
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

impl DerivedKey {
    pub fn usage(&self) -> KeyUsage {
        self.usage
    }

    pub fn encrypt(&self, iv: &[u8], plaintext: &[u8], aad: &[u8]) -> CapsuleResult<Vec<u8>> {
        self.require(KeyUsage::Encrypt)?;
        if iv.len() != IV_LEN {
            return Err(CapsuleError::Encrypt(format!(
                "unexpected iv length {}",
                iv.len()
            )));
        }
        self.cipher
            .encrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|err| CapsuleError::Encrypt(err.to_string()))
    }

    pub fn decrypt(&self, iv: &[u8], ciphertext: &[u8], aad: &[u8]) -> CapsuleResult<Vec<u8>> {
        self.require(KeyUsage::Decrypt)?;
        if iv.len() != IV_LEN {
            return Err(CapsuleError::Decrypt(format!(
                "unexpected iv length {}",
                iv.len()
            )));
        }
        self.cipher
            .decrypt(
                Nonce::from_slice(iv),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|err| CapsuleError::Decrypt(err.to_string()))
    }

    fn require(&self, requested: KeyUsage) -> CapsuleResult<()> {
        if self.usage == requested {
            Ok(())
        } else {
            Err(CapsuleError::KeyUsage {
                requested,
                actual: self.usage,
            })
        }
    }
}

/// PBKDF2-HMAC-SHA256 (100k rounds) over the UTF-8 passphrase.
pub fn derive_key(passphrase: &str, salt: &[u8], usage: KeyUsage) -> CapsuleResult<DerivedKey> {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|err| CapsuleError::Encrypt(format!("invalid key: {err}")))?;
    Ok(DerivedKey { usage, cipher })
}

/// Additional authenticated data binding a ciphertext to its constellation id.
///
/// Falsy ids (missing, null, empty string, zero, false) bind to `""`.
pub fn anchor_aad(id: Option<&Value>) -> CapsuleResult<Vec<u8>> {
    let id = match id {
        Some(value) if is_truthy(value) => value.clone(),
        _ => Value::String(String::new()),
    };
    Ok(serde_json::to_vec(&json!({ "id": id }))?)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Encrypt one constellation's `anchor` in place.
///
/// Returns `Ok(false)` when the constellation has no plaintext anchor. On error
/// the constellation is left untouched.
pub fn encrypt_anchor(constellation: &mut Map<String, Value>, passphrase: &str) -> CapsuleResult<bool> {
    let Some(anchor) = constellation.get(ANCHOR_FIELD) else {
        return Ok(false);
    };
    let values = anchor_values(anchor)?;

    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);

    let key = derive_key(passphrase, &salt, KeyUsage::Encrypt)?;
    let aad = anchor_aad(constellation.get("id"))?;
    let ciphertext = key.encrypt(&iv, &pack_floats(&values), &aad)?;

    let sealed = AnchorEnc {
        alg: ANCHOR_ALG.to_string(),
        iv: BASE64_STANDARD.encode(iv),
        salt: BASE64_STANDARD.encode(salt),
        ct: BASE64_STANDARD.encode(ciphertext),
    };
    let sealed = serde_json::to_value(sealed)?;
    replace_field(constellation, ANCHOR_FIELD, ANCHOR_ENC_FIELD, sealed);
    Ok(true)
}

/// Decrypt one constellation's `anchor_enc` in place.
///
/// Returns `Ok(false)` when the constellation carries no ciphertext. On error
/// the ciphertext stays where it was.
pub fn decrypt_anchor(constellation: &mut Map<String, Value>, passphrase: &str) -> CapsuleResult<bool> {
    let Some(sealed) = constellation.get(ANCHOR_ENC_FIELD) else {
        return Ok(false);
    };
    let sealed: AnchorEnc = serde_json::from_value(sealed.clone())
        .map_err(|err| CapsuleError::AnchorShape(format!("anchor_enc: {err}")))?;
    if sealed.alg != ANCHOR_ALG {
        return Err(CapsuleError::AnchorShape(format!(
            "unsupported alg {}",
            sealed.alg
        )));
    }

    let iv = decode_field("iv", &sealed.iv)?;
    let salt = decode_field("salt", &sealed.salt)?;
    let ciphertext = decode_field("ct", &sealed.ct)?;

    let key = derive_key(passphrase, &salt, KeyUsage::Decrypt)?;
    let aad = anchor_aad(constellation.get("id"))?;
    let plaintext = key.decrypt(&iv, &ciphertext, &aad)?;
    let values = unpack_floats(&plaintext)?;

    let anchor = Value::Array(
        values
            .into_iter()
            .map(|v| Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null))
            .collect(),
    );
    replace_field(constellation, ANCHOR_ENC_FIELD, ANCHOR_FIELD, anchor);
    Ok(true)
}

#[derive(Debug)]
pub struct AnchorFailure {
    pub super_node: usize,
    pub constellation: usize,
    pub id: Option<String>,
    pub error: CapsuleError,
}

#[derive(Debug, Default)]
pub struct AnchorReport {
    pub processed: usize,
    pub failures: Vec<AnchorFailure>,
}

impl AnchorReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A decrypted copy of a payload plus what went wrong along the way.
#[derive(Debug)]
pub struct AnchorPass {
    pub payload: Value,
    pub report: AnchorReport,
}

impl AnchorPass {
    /// Fail on the first constellation that could not be decrypted.
    pub fn strict(self) -> CapsuleResult<Value> {
        match self.report.failures.into_iter().next() {
            Some(failure) => Err(failure.error),
            None => Ok(self.payload),
        }
    }
}

/// Encrypt every plaintext anchor in the payload, in place.
///
/// Each constellation gets its own salt and IV. A constellation that fails keeps
/// its plaintext anchor and is listed in the report; the others still encrypt.
pub fn encrypt_anchors(payload: &mut Value, passphrase: &str) -> AnchorReport {
    let mut report = AnchorReport::default();
    for_each_constellation(payload, |super_node, index, constellation| {
        match encrypt_anchor(constellation, passphrase) {
            Ok(true) => report.processed += 1,
            Ok(false) => {}
            Err(error) => {
                let id = constellation_id(constellation);
                tracing::warn!(
                    target: "capsule_codec",
                    super_node,
                    constellation = index,
                    id = id.as_deref().unwrap_or(""),
                    error = %error,
                    "encrypt failed"
                );
                report.failures.push(AnchorFailure {
                    super_node,
                    constellation: index,
                    id,
                    error,
                });
            }
        }
    });
    report
}

/// Decrypt every `anchor_enc` in a deep copy of the payload.
pub fn decrypt_anchors(payload: &Value, passphrase: &str) -> AnchorPass {
    let mut copy = payload.clone();
    let mut report = AnchorReport::default();
    for_each_constellation(&mut copy, |super_node, index, constellation| {
        match decrypt_anchor(constellation, passphrase) {
            Ok(true) => report.processed += 1,
            Ok(false) => {}
            Err(error) => {
                let id = constellation_id(constellation);
                tracing::warn!(
                    target: "capsule_codec",
                    super_node,
                    constellation = index,
                    id = id.as_deref().unwrap_or(""),
                    error = %error,
                    "decrypt failed"
                );
                report.failures.push(AnchorFailure {
                    super_node,
                    constellation: index,
                    id,
                    error,
                });
            }
        }
    });
    AnchorPass {
        payload: copy,
        report,
    }
}

fn for_each_constellation<F>(payload: &mut Value, mut visit: F)
where
    F: FnMut(usize, usize, &mut Map<String, Value>),
{
    let Some(super_nodes) = payload.get_mut("super_nodes").and_then(Value::as_array_mut) else {
        return;
    };
    for (node_index, node) in super_nodes.iter_mut().enumerate() {
        let Some(constellations) = node.get_mut("constellations").and_then(Value::as_array_mut)
        else {
            continue;
        };
        for (index, constellation) in constellations.iter_mut().enumerate() {
            if let Some(map) = constellation.as_object_mut() {
                visit(node_index, index, map);
            }
        }
    }
}

fn constellation_id(constellation: &Map<String, Value>) -> Option<String> {
    constellation.get("id").map(|id| match id {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    })
}

fn anchor_values(anchor: &Value) -> CapsuleResult<Vec<f64>> {
    let items = anchor
        .as_array()
        .ok_or_else(|| CapsuleError::AnchorShape("anchor is not an array".into()))?;
    items
        .iter()
        .map(|item| {
            item.as_f64()
                .ok_or_else(|| CapsuleError::AnchorShape(format!("non-numeric anchor value {item}")))
        })
        .collect()
}

fn decode_field(field: &'static str, encoded: &str) -> CapsuleResult<Vec<u8>> {
    BASE64_STANDARD
        .decode(encoded.as_bytes())
        .map_err(|source| CapsuleError::Base64 { field, source })
}

/// Swap `old` for `new_key` at the same position, keeping every other key in order.
fn replace_field(map: &mut Map<String, Value>, old: &str, new_key: &str, value: Value) {
    let entries = std::mem::take(map);
    let mut value = Some(value);
    for (key, existing) in entries {
        if key == old {
            if let Some(value) = value.take() {
                map.insert(new_key.to_string(), value);
            }
        } else if key != new_key {
            map.insert(key, existing);
        }
    }
    if let Some(value) = value {
        map.insert(new_key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_with(anchors: Vec<(&str, Vec<f64>)>) -> Value {
        let constellations: Vec<Value> = anchors
            .into_iter()
            .map(|(id, anchor)| json!({"id": id, "anchor": anchor, "points": [[0, 0]]}))
            .collect();
        json!({"super_nodes": [{"constellations": constellations}]})
    }

    fn constellation(payload: &Value, index: usize) -> &Map<String, Value> {
        payload["super_nodes"][0]["constellations"][index]
            .as_object()
            .expect("constellation object")
    }

    #[test]
    fn anchors_round_trip_at_f32_precision() {
        let anchor = vec![1.5, -0.25, 0.0, 3.25, -1000.125];
        let mut payload = payload_with(vec![("x", anchor.clone())]);

        let report = encrypt_anchors(&mut payload, "open sesame");
        assert!(report.is_clean());
        assert_eq!(report.processed, 1);
        let sealed = constellation(&payload, 0);
        assert!(sealed.get("anchor").is_none());
        assert_eq!(sealed["anchor_enc"]["alg"], ANCHOR_ALG);

        let restored = decrypt_anchors(&payload, "open sesame")
            .strict()
            .expect("decrypt");
        let restored = constellation(&restored, 0);
        assert!(restored.get("anchor_enc").is_none());
        let values: Vec<f64> = restored["anchor"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect();
        let expected: Vec<f64> = anchor.iter().map(|v| *v as f32 as f64).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn wrong_passphrase_fails_instead_of_returning_garbage() {
        let mut payload = payload_with(vec![("x", vec![1.0, 2.0])]);
        encrypt_anchors(&mut payload, "right");

        let pass = decrypt_anchors(&payload, "wrong");
        assert_eq!(pass.report.failures.len(), 1);
        let kept = constellation(&pass.payload, 0);
        assert!(kept.get("anchor").is_none());
        assert!(kept.get("anchor_enc").is_some());
        assert!(matches!(pass.strict(), Err(CapsuleError::Decrypt(_))));
    }

    #[test]
    fn each_constellation_gets_its_own_salt_and_iv() {
        let mut payload = payload_with(vec![("a", vec![1.0]), ("b", vec![1.0])]);
        encrypt_anchors(&mut payload, "shared");
        let first = &constellation(&payload, 0)["anchor_enc"];
        let second = &constellation(&payload, 1)["anchor_enc"];
        assert_ne!(first["iv"], second["iv"]);
        assert_ne!(first["salt"], second["salt"]);
    }

    #[test]
    fn ciphertext_is_bound_to_the_constellation_id() {
        let mut payload = payload_with(vec![("a", vec![4.0])]);
        encrypt_anchors(&mut payload, "pw");
        payload["super_nodes"][0]["constellations"][0]["id"] = json!("b");
        let pass = decrypt_anchors(&payload, "pw");
        assert_eq!(pass.report.failures.len(), 1);
    }

    #[test]
    fn bad_constellation_keeps_plaintext_and_others_still_encrypt() {
        let mut payload = json!({"super_nodes": [{"constellations": [
            {"id": "bad", "anchor": [1.0, "two"]},
            {"id": "good", "anchor": [3.0]},
            {"id": "plain"}
        ]}]});
        let report = encrypt_anchors(&mut payload, "pw");
        assert_eq!(report.processed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id.as_deref(), Some("bad"));
        assert_eq!(constellation(&payload, 0)["anchor"], json!([1.0, "two"]));
        assert!(constellation(&payload, 1).get("anchor_enc").is_some());
        assert!(constellation(&payload, 2).get("anchor_enc").is_none());
    }

    #[test]
    fn decrypt_isolates_failures_per_constellation() {
        let mut payload = payload_with(vec![("a", vec![1.0]), ("b", vec![2.0])]);
        encrypt_anchors(&mut payload, "pw");
        payload["super_nodes"][0]["constellations"][0]["anchor_enc"]["ct"] = json!("!!not base64");

        let pass = decrypt_anchors(&payload, "pw");
        assert_eq!(pass.report.processed, 1);
        assert!(matches!(
            pass.report.failures[0].error,
            CapsuleError::Base64 { field: "ct", .. }
        ));
        assert_eq!(constellation(&pass.payload, 1)["anchor"], json!([2.0]));
    }

    #[test]
    fn decrypt_leaves_the_input_untouched() {
        let mut payload = payload_with(vec![("a", vec![1.0])]);
        encrypt_anchors(&mut payload, "pw");
        let before = payload.clone();
        let _ = decrypt_anchors(&payload, "pw");
        assert_eq!(payload, before);
    }

    #[test]
    fn replacement_keeps_field_position() {
        let mut payload: Value =
            serde_json::from_str(r#"{"super_nodes":[{"constellations":[{"id":"a","anchor":[1],"points":[]}]}]}"#)
                .unwrap();
        encrypt_anchors(&mut payload, "pw");
        let keys: Vec<&String> = constellation(&payload, 0).keys().collect();
        assert_eq!(keys, ["id", "anchor_enc", "points"]);
    }

    #[test]
    fn falsy_ids_bind_to_empty_string() {
        assert_eq!(anchor_aad(None).unwrap(), br#"{"id":""}"#.to_vec());
        assert_eq!(anchor_aad(Some(&json!(0))).unwrap(), br#"{"id":""}"#.to_vec());
        assert_eq!(anchor_aad(Some(&json!("c1"))).unwrap(), br#"{"id":"c1"}"#.to_vec());
        assert_eq!(anchor_aad(Some(&json!(7))).unwrap(), br#"{"id":7}"#.to_vec());
    }

    #[test]
    fn keys_are_scoped_to_one_usage() {
        let salt = [9u8; SALT_LEN];
        let iv = [1u8; IV_LEN];
        let encrypt_key = derive_key("pw", &salt, KeyUsage::Encrypt).unwrap();
        let decrypt_key = derive_key("pw", &salt, KeyUsage::Decrypt).unwrap();
        let ciphertext = encrypt_key.encrypt(&iv, b"abc", b"").unwrap();
        assert!(matches!(
            encrypt_key.decrypt(&iv, &ciphertext, b""),
            Err(CapsuleError::KeyUsage { .. })
        ));
        assert!(matches!(
            decrypt_key.encrypt(&iv, b"abc", b""),
            Err(CapsuleError::KeyUsage { .. })
        ));
        assert_eq!(decrypt_key.decrypt(&iv, &ciphertext, b"").unwrap(), b"abc");
    }
}
