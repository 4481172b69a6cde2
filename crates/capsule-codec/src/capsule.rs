use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::signature::{HMAC_ALG, hmac_sign, hmac_verify};
use crate::{CapsuleResult, canonicalize};

pub const CAPSULE_KIND: &str = "cgp";
pub const EXPORT_TYPE: &str = "shape-capsule";

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleSignature {
    pub alg: String,
    pub hmac: String,
}

/// Envelope around a geometry payload exchanged between peers.
///
/// The signature covers `canonicalize(data)` only; `kind`, `ts` and `from` can
/// change without invalidating it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capsule {
    pub kind: String,
    pub data: Value,
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<CapsuleSignature>,
}

impl Capsule {
    pub fn new(data: Value) -> Self {
        Self {
            kind: CAPSULE_KIND.to_string(),
            data,
            ts: now_millis(),
            from: None,
            sig: None,
        }
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn signing_input(&self) -> CapsuleResult<String> {
        canonicalize(&self.data)
    }

    /// Attach an HMAC signature. On error the capsule stays unsigned.
    pub fn sign(&mut self, secret: &str) -> CapsuleResult<()> {
        let hmac = hmac_sign(secret, &self.signing_input()?)?;
        self.sig = Some(CapsuleSignature {
            alg: HMAC_ALG.to_string(),
            hmac,
        });
        Ok(())
    }

    pub fn is_signed(&self) -> bool {
        self.sig.is_some()
    }

    /// `Ok(false)` for unsigned capsules, unknown algorithms and bad tags.
    pub fn verify(&self, secret: &str) -> CapsuleResult<bool> {
        let Some(sig) = &self.sig else {
            return Ok(false);
        };
        if sig.alg != HMAC_ALG {
            return Ok(false);
        }
        hmac_verify(secret, &self.signing_input()?, &sig.hmac)
    }

    pub fn export(&self) -> ExportDocument {
        ExportDocument::new(self.clone())
    }
}

/// On-disk form of a capsule: `{ "type": "shape-capsule", "capsule": ... }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    #[serde(rename = "type")]
    pub kind: String,
    pub capsule: Capsule,
}

impl ExportDocument {
    pub fn new(capsule: Capsule) -> Self {
        Self {
            kind: EXPORT_TYPE.to_string(),
            capsule,
        }
    }

    pub fn to_json_pretty(&self) -> CapsuleResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> CapsuleResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

pub fn export_file_name(unix_millis: u64) -> String {
    format!("shape-capsule-{unix_millis}.json")
}
