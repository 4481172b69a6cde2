use crate::{CapsuleError, CapsuleResult};

const COUNT_LEN: usize = 4;
const FLOAT_LEN: usize = 4;

/// Pack numbers as a little-endian u32 count followed by that many f32 values.
///
/// Values are narrowed to f32; callers must not expect f64 fidelity back.
pub fn pack_floats(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(COUNT_LEN + values.len() * FLOAT_LEN);
    out.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for value in values {
        out.extend_from_slice(&(*value as f32).to_le_bytes());
    }
    out
}

pub fn unpack_floats(bytes: &[u8]) -> CapsuleResult<Vec<f64>> {
    if bytes.len() < COUNT_LEN {
        return Err(CapsuleError::Truncated {
            expected: COUNT_LEN,
            found: bytes.len(),
        });
    }
    let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let expected = COUNT_LEN + count * FLOAT_LEN;
    if bytes.len() < expected {
        return Err(CapsuleError::Truncated {
            expected,
            found: bytes.len(),
        });
    }
    Ok(bytes[COUNT_LEN..expected]
        .chunks_exact(FLOAT_LEN)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64)
        .collect())
}
