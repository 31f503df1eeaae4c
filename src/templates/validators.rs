//! Parameter validation for SQL templates.
//!
//! Every template owns a pure validator that maps a parameter vector to a
//! validated parameter vector or fails with `ValidationError` naming the
//! offending parameter. Validation is the only gate between caller input and
//! the bind vector handed to a connection; nothing here is ever formatted
//! into SQL text.
//!
//! Normalization is idempotent: running a validator over its own output
//! yields the same vector.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{RelayError, RelayResult};

/// Character sequences that could alter statement structure. Identifier-like
/// and free-text string parameters are rejected outright if they contain any
/// of these.
const INJECTION_SEQUENCES: &[&str] = &["'", "\"", ";", "--", "/*", "*/", "\\", "`", "${"];

/// Maximum serialized size for opaque document parameters.
const MAX_DOC_BYTES: usize = 256 * 1024;

/// Maximum length for identifier-like parameters (customer keys, session ids).
pub const MAX_IDENT_LEN: usize = 256;

fn param_name(idx: usize, name: &str) -> String {
    format!("{name} (param {idx})")
}

fn as_str<'a>(params: &'a [Value], idx: usize, name: &str) -> RelayResult<&'a str> {
    params
        .get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::validation(param_name(idx, name), "expected a string"))
}

fn reject_injection(s: &str, idx: usize, name: &str) -> RelayResult<()> {
    if s.bytes().any(|b| b.is_ascii_control()) {
        return Err(RelayError::validation(
            param_name(idx, name),
            "control characters are not allowed",
        ));
    }
    for seq in INJECTION_SEQUENCES {
        if s.contains(seq) {
            return Err(RelayError::validation(
                param_name(idx, name),
                format!("sequence `{seq}` is not allowed"),
            ));
        }
    }
    Ok(())
}

/// Identifier-like parameter: bounded length, conservative charset, no
/// injection sequences. Covers customer keys, session keys, subjects,
/// metric names, template names.
pub fn identifier(params: &[Value], idx: usize, name: &str) -> RelayResult<Value> {
    let s = as_str(params, idx, name)?;
    if s.is_empty() {
        return Err(RelayError::validation(param_name(idx, name), "must not be empty"));
    }
    if s.len() > MAX_IDENT_LEN {
        return Err(RelayError::validation(
            param_name(idx, name),
            format!("longer than {MAX_IDENT_LEN} bytes"),
        ));
    }
    reject_injection(s, idx, name)?;
    if !s
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':' | b'@'))
    {
        return Err(RelayError::validation(
            param_name(idx, name),
            "allowed characters are [A-Za-z0-9_.:@-]",
        ));
    }
    Ok(Value::String(s.to_string()))
}

/// UUID parameter, normalized to lowercase hyphenated form.
pub fn uuid_param(params: &[Value], idx: usize, name: &str) -> RelayResult<Value> {
    let s = as_str(params, idx, name)?;
    let parsed = Uuid::parse_str(s)
        .map_err(|_| RelayError::validation(param_name(idx, name), "not a well-formed UUID"))?;
    Ok(Value::String(parsed.hyphenated().to_string()))
}

/// Exactly 16 lowercase hex characters (provenance hashes, ingest ids).
pub fn hex16(params: &[Value], idx: usize, name: &str) -> RelayResult<Value> {
    let s = as_str(params, idx, name)?;
    let ok = s.len() == 16
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !ok {
        return Err(RelayError::validation(
            param_name(idx, name),
            "expected exactly 16 lowercase hex characters",
        ));
    }
    Ok(Value::String(s.to_string()))
}

/// Correlation tag: `cdesk_` + 16 lowercase hex.
pub fn query_tag(params: &[Value], idx: usize, name: &str) -> RelayResult<Value> {
    let s = as_str(params, idx, name)?;
    if !crate::tag::TagGenerator::is_valid(s) {
        return Err(RelayError::validation(
            param_name(idx, name),
            "not a well-formed correlation tag",
        ));
    }
    Ok(Value::String(s.to_string()))
}

/// RFC 3339 timestamp, normalized to UTC.
pub fn timestamp(params: &[Value], idx: usize, name: &str) -> RelayResult<Value> {
    let s = as_str(params, idx, name)?;
    let parsed: DateTime<Utc> = s
        .parse()
        .map_err(|_| RelayError::validation(param_name(idx, name), "not an RFC 3339 timestamp"))?;
    Ok(Value::String(parsed.to_rfc3339()))
}

/// Optional variant: JSON null passes through, otherwise delegate.
pub fn optional(
    params: &[Value],
    idx: usize,
    name: &str,
    inner: fn(&[Value], usize, &str) -> RelayResult<Value>,
) -> RelayResult<Value> {
    match params.get(idx) {
        None | Some(Value::Null) => Ok(Value::Null),
        Some(_) => inner(params, idx, name),
    }
}

/// Finite numeric parameter (revenue impact, insight values).
pub fn finite_number(params: &[Value], idx: usize, name: &str) -> RelayResult<Value> {
    let n = params
        .get(idx)
        .and_then(Value::as_f64)
        .ok_or_else(|| RelayError::validation(param_name(idx, name), "expected a number"))?;
    if !n.is_finite() {
        return Err(RelayError::validation(
            param_name(idx, name),
            "must be finite",
        ));
    }
    Ok(params[idx].clone())
}

/// Integer within an inclusive range (occurrence numbers, row limits).
pub fn int_in_range(
    params: &[Value],
    idx: usize,
    name: &str,
    min: i64,
    max: i64,
) -> RelayResult<Value> {
    let n = params
        .get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| RelayError::validation(param_name(idx, name), "expected an integer"))?;
    if n < min || n > max {
        return Err(RelayError::validation(
            param_name(idx, name),
            format!("must be between {min} and {max}"),
        ));
    }
    Ok(params[idx].clone())
}

/// Opaque document parameter: any JSON value, bounded serialized size.
/// Passed to the warehouse as a serialized string bind.
pub fn json_doc(params: &[Value], idx: usize, name: &str) -> RelayResult<Value> {
    let value = params
        .get(idx)
        .ok_or_else(|| RelayError::validation(param_name(idx, name), "missing document"))?;
    let serialized = serde_json::to_string(value)
        .map_err(|e| RelayError::validation(param_name(idx, name), format!("not serializable: {e}")))?;
    if serialized.len() > MAX_DOC_BYTES {
        return Err(RelayError::validation(
            param_name(idx, name),
            format!("document exceeds {MAX_DOC_BYTES} bytes"),
        ));
    }
    Ok(value.clone())
}

/// URL parameter: http(s) only, parseable, no injection sequences.
pub fn url(params: &[Value], idx: usize, name: &str) -> RelayResult<Value> {
    let s = as_str(params, idx, name)?;
    reject_injection(s, idx, name)?;
    let parsed = reqwest::Url::parse(s)
        .map_err(|_| RelayError::validation(param_name(idx, name), "not a well-formed URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RelayError::validation(
            param_name(idx, name),
            "only http(s) URLs are allowed",
        ));
    }
    Ok(Value::String(s.to_string()))
}

/// Activity name in the `cdesk.` namespace.
pub fn activity_name(params: &[Value], idx: usize, name: &str) -> RelayResult<Value> {
    let s = as_str(params, idx, name)?;
    let normalized = crate::events::normalize_activity(s)?;
    Ok(Value::String(normalized))
}

/// Check the parameter vector has exactly the expected arity.
pub fn expect_arity(params: &[Value], arity: usize, template: &str) -> RelayResult<()> {
    if params.len() != arity {
        return Err(RelayError::validation(
            "params",
            format!(
                "template `{template}` takes {arity} parameters, got {}",
                params.len()
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identifier_accepts_customer_keys() {
        let params = vec![json!("customer_0042")];
        assert_eq!(
            identifier(&params, 0, "customer").unwrap(),
            json!("customer_0042")
        );
    }

    #[test]
    fn test_identifier_rejects_injection() {
        for bad in ["'; DROP TABLE X; --", "a;b", "x'y", "a--b", "a/*b*/", "a${b}"] {
            let params = vec![json!(bad)];
            let err = identifier(&params, 0, "customer").unwrap_err();
            assert_eq!(err.kind(), "ValidationError", "input: {bad}");
        }
    }

    #[test]
    fn test_identifier_rejects_control_chars_and_overlong() {
        assert!(identifier(&[json!("a\x00b")], 0, "customer").is_err());
        assert!(identifier(&[json!("\n")], 0, "customer").is_err());
        let long = "x".repeat(MAX_IDENT_LEN + 1);
        assert!(identifier(&[json!(long)], 0, "customer").is_err());
    }

    #[test]
    fn test_uuid_normalizes_case() {
        let params = vec![json!("0E984725-C51C-4BF4-9960-E1C80E27ABA0")];
        assert_eq!(
            uuid_param(&params, 0, "id").unwrap(),
            json!("0e984725-c51c-4bf4-9960-e1c80e27aba0")
        );
    }

    #[test]
    fn test_hex16() {
        assert!(hex16(&[json!("0123456789abcdef")], 0, "hash").is_ok());
        assert!(hex16(&[json!("0123456789ABCDEF")], 0, "hash").is_err());
        assert!(hex16(&[json!("0123456789abcde")], 0, "hash").is_err());
        assert!(hex16(&[json!("0123456789abcdeg")], 0, "hash").is_err());
    }

    #[test]
    fn test_finite_number_rejects_non_finite() {
        assert!(finite_number(&[json!(12.5)], 0, "revenue").is_ok());
        assert!(finite_number(&[Value::from(f64::NAN)], 0, "revenue").is_err());
        assert!(finite_number(&[json!("12")], 0, "revenue").is_err());
    }

    #[test]
    fn test_url_rules() {
        assert!(url(&[json!("https://example.com/doc?id=3")], 0, "link").is_ok());
        assert!(url(&[json!("ftp://example.com")], 0, "link").is_err());
        assert!(url(&[json!("not a url")], 0, "link").is_err());
        assert!(url(&[json!("https://example.com/'--")], 0, "link").is_err());
    }

    #[test]
    fn test_optional_passes_null_through() {
        assert_eq!(optional(&[Value::Null], 0, "link", url).unwrap(), Value::Null);
        assert!(optional(&[json!("bogus")], 0, "link", url).is_err());
    }

    #[test]
    fn test_validators_are_idempotent() {
        // V(V(p)) = V(p) on accepted inputs.
        let p = vec![json!("0E984725-C51C-4BF4-9960-E1C80E27ABA0")];
        let once = uuid_param(&p, 0, "id").unwrap();
        let twice = uuid_param(&[once.clone()], 0, "id").unwrap();
        assert_eq!(once, twice);

        let p = vec![json!("2025-06-01T12:00:00Z")];
        let once = timestamp(&p, 0, "ts").unwrap();
        let twice = timestamp(&[once.clone()], 0, "ts").unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_json_doc_size_cap() {
        let doc = json!({"k": "v".repeat(MAX_DOC_BYTES)});
        assert!(json_doc(&[doc], 0, "metadata").is_err());
        assert!(json_doc(&[json!({"k": "v"})], 0, "metadata").is_ok());
    }
}
