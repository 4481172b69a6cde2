//! Canonical serialization, signing and anchor encryption for shape capsules.
//!
//! Everything in this crate is pure: no sockets, no files, no clocks other
//! than the capsule timestamp helper. Callers own the "best effort" policy and
//! decide what to do with a failed operation.

mod anchors;
mod canonical;
mod capsule;
mod floats;
mod signature;

use thiserror::Error;

pub use anchors::{
    ANCHOR_ALG, AnchorEnc, AnchorFailure, AnchorPass, AnchorReport, DerivedKey, IV_LEN,
    KeyUsage, PBKDF2_ITERATIONS, SALT_LEN, anchor_aad, decrypt_anchor, decrypt_anchors,
    derive_key, encrypt_anchor, encrypt_anchors,
};
pub use canonical::canonicalize;
pub use capsule::{
    CAPSULE_KIND, Capsule, CapsuleSignature, EXPORT_TYPE, ExportDocument, export_file_name,
    now_millis,
};
pub use floats::{pack_floats, unpack_floats};
pub use signature::{HMAC_ALG, hmac_sign, hmac_verify};

#[derive(Debug, Error)]
pub enum CapsuleError {
    #[error("encrypt failed: {0}")]
    Encrypt(String),
    #[error("decrypt failed: {0}")]
    Decrypt(String),
    #[error("invalid base64 in {field}: {source}")]
    Base64 {
        field: &'static str,
        source: base64::DecodeError,
    },
    #[error("unexpected anchor shape: {0}")]
    AnchorShape(String),
    #[error("key derived for {actual:?} cannot be used to {requested:?}")]
    KeyUsage {
        requested: KeyUsage,
        actual: KeyUsage,
    },
    #[error("packed floats truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("sign failed: secret must not be empty")]
    EmptySecret,
    #[error("serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type CapsuleResult<T> = Result<T, CapsuleError>;
