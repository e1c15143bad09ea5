//! Canonical request signing.
//!
//! Every queue payload is signed with the app's shared secret so the server
//! can authenticate it. The canonical form is deterministic: keys sorted
//! lexicographically, values rendered the same way on every platform, so
//! the same payload always produces the same signature no matter the
//! insertion order.

use serde_json::{Map, Value};

/// All queue traffic is POST; the method is part of the signed string.
const METHOD: &str = "POST";

/// Output of [`sign_payload`]: the canonical string, its signature, and the
/// ready-to-send form body.
#[derive(Debug, Clone)]
pub struct SignedForm {
    /// `POST\n{hostname}\n{endpoint}\n{k=v&...}`, the exact bytes the HMAC covers.
    pub string_to_sign: String,
    /// Base64 HMAC-SHA256 of `string_to_sign`.
    pub signature: String,
    /// URL-encoded `k=v&...&sig=...` body, content type
    /// `application/x-www-form-urlencoded`.
    pub body: String,
}

/// Render a payload value into its canonical wire form: strings bare,
/// scalars via display, maps and arrays as compact JSON.
fn canonical_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(_) | Value::Array(_) => value.to_string(),
        other => other.to_string(),
    }
}

/// Payload keys in canonical (sorted) order, null values dropped.
fn canonical_keys(payload: &Map<String, Value>) -> Vec<&String> {
    let mut keys: Vec<&String> = payload
        .iter()
        .filter_map(|(k, v)| {
            if v.is_null() {
                tracing::warn!(key = %k, "request.null_value_dropped");
                None
            } else {
                Some(k)
            }
        })
        .collect();
    keys.sort();
    keys
}

/// Build the string the HMAC covers.
pub fn string_to_sign(hostname: &str, endpoint: &str, payload: &Map<String, Value>) -> String {
    let joined = canonical_keys(payload)
        .iter()
        .map(|k| format!("{}={}", k, canonical_value(&payload[k.as_str()])))
        .collect::<Vec<_>>()
        .join("&");
    format!("{METHOD}\n{hostname}\n{endpoint}\n{joined}")
}

/// Sign `payload` for `hostname`/`endpoint` and produce the form body with
/// the signature appended as the `sig` parameter.
pub fn sign_payload(
    hostname: &str,
    endpoint: &str,
    payload: &Map<String, Value>,
    secret: &str,
) -> SignedForm {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let string_to_sign = string_to_sign(hostname, endpoint, payload);

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take keys of any size");
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let mut body = canonical_keys(payload)
        .iter()
        .map(|k| {
            format!(
                "{}={}",
                k,
                urlencoding::encode(&canonical_value(&payload[k.as_str()]))
            )
        })
        .collect::<Vec<_>>()
        .join("&");
    if !body.is_empty() {
        body.push('&');
    }
    body.push_str("sig=");
    body.push_str(&urlencoding::encode(&signature));

    SignedForm {
        string_to_sign,
        signature,
        body,
    }
}
