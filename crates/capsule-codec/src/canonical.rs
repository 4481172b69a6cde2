use std::io;

use serde::Serialize;
use serde_json::Value;
use serde_json::ser::Formatter;

use crate::CapsuleResult;

/// Serialize `value` for signing.
///
/// Only the top-level object keys are sorted. Nested objects keep the key order
/// they were authored with, so two payloads that differ only in nested key order
/// produce different strings. Existing signed capsules depend on this exact
/// output; do not make it recursive.
///
/// Floating-point numbers are written the way JavaScript's `Number#toString`
/// writes them (`1.0` as `1`, `-0.0` as `0`, `1e21` as `1e+21`), so signatures
/// match those produced by browser peers.
pub fn canonicalize(value: &Value) -> CapsuleResult<String> {
    let Value::Object(map) = value else {
        return to_string(value);
    };

    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    let mut out = String::with_capacity(64);
    out.push('{');
    for (index, key) in keys.into_iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        out.push_str(&to_string(key)?);
        out.push(':');
        out.push_str(&to_string(&map[key])?);
    }
    out.push('}');
    Ok(out)
}

fn to_string<T: Serialize + ?Sized>(value: &T) -> CapsuleResult<String> {
    let mut buf = Vec::with_capacity(32);
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, EcmaFormatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Compact JSON with ECMAScript number rendering for `f64` values.
struct EcmaFormatter;

impl Formatter for EcmaFormatter {
    fn write_f64<W: ?Sized + io::Write>(&mut self, writer: &mut W, value: f64) -> io::Result<()> {
        writer.write_all(ecma_number(value).as_bytes())
    }
}

fn ecma_number(value: f64) -> String {
    if value.is_nan() || value.is_infinite() {
        return "null".to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }

    // Shortest round-trip digits, e.g. "1.2345e-7".
    let scientific = format!("{:e}", value.abs());
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((scientific.as_str(), "0"));
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    let n = exponent.parse::<i32>().unwrap_or(0) + 1;

    let mut out = String::with_capacity(k as usize + 8);
    if value < 0.0 {
        out.push('-');
    }
    if k <= n && n <= 21 {
        out.push_str(&digits);
        out.extend(std::iter::repeat_n('0', (n - k) as usize));
    } else if 0 < n && n <= 21 {
        out.push_str(&digits[..n as usize]);
        out.push('.');
        out.push_str(&digits[n as usize..]);
    } else if -6 < n && n <= 0 {
        out.push_str("0.");
        out.extend(std::iter::repeat_n('0', (-n) as usize));
        out.push_str(&digits);
    } else {
        out.push_str(&digits[..1]);
        if k > 1 {
            out.push('.');
            out.push_str(&digits[1..]);
        }
        out.push('e');
        out.push(if n > 0 { '+' } else { '-' });
        out.push_str(&(n - 1).abs().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_top_level_keys() {
        let value = json!({"b": 1, "a": 2});
        assert_eq!(canonicalize(&value).unwrap(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn nested_key_order_is_kept_as_authored() {
        let value: Value = serde_json::from_str(r#"{"a":{"z":1,"y":2}}"#).unwrap();
        assert_eq!(canonicalize(&value).unwrap(), r#"{"a":{"z":1,"y":2}}"#);
    }

    #[test]
    fn nested_order_changes_the_output() {
        let first: Value = serde_json::from_str(r#"{"a":{"z":1,"y":2}}"#).unwrap();
        let second: Value = serde_json::from_str(r#"{"a":{"y":2,"z":1}}"#).unwrap();
        assert_ne!(
            canonicalize(&first).unwrap(),
            canonicalize(&second).unwrap()
        );
    }

    #[test]
    fn non_objects_serialize_plainly() {
        assert_eq!(canonicalize(&json!([3, 1, 2])).unwrap(), "[3,1,2]");
        assert_eq!(canonicalize(&json!("text")).unwrap(), r#""text""#);
        assert_eq!(canonicalize(&json!({})).unwrap(), "{}");
    }

    #[test]
    fn floats_render_like_javascript() {
        let value: Value = serde_json::from_str(r#"{"b":1.0,"a":[-0.0]}"#).unwrap();
        assert_eq!(canonicalize(&value).unwrap(), r#"{"a":[0],"b":1}"#);

        let value: Value = serde_json::from_str(r#"{"b":1.0,"a":[2.50,1e21,-0.0]}"#).unwrap();
        assert_eq!(canonicalize(&value).unwrap(), r#"{"a":[2.5,1e+21,0],"b":1}"#);
    }

    #[test]
    fn number_formatting_edges() {
        assert_eq!(ecma_number(1e-7), "1e-7");
        assert_eq!(ecma_number(0.000001), "0.000001");
        assert_eq!(ecma_number(-1.5), "-1.5");
        assert_eq!(ecma_number(100.0), "100");
        assert_eq!(ecma_number(1.2345678901234568e20), "123456789012345680000");
        assert_eq!(ecma_number(-2.5e-10), "-2.5e-10");
    }

    #[test]
    fn nested_floats_use_the_same_rendering() {
        let value: Value = serde_json::from_str(r#"{"x":{"w":3.0,"v":0.1}}"#).unwrap();
        assert_eq!(canonicalize(&value).unwrap(), r#"{"x":{"w":3,"v":0.1}}"#);
    }
}
