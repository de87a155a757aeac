//! Webhook request signatures.
//!
//! Payment provider: header `t=<unix seconds>,v1=<hex hmac>` where the
//! HMAC-SHA256 covers `"<t>.<raw body>"`. Several `v1` entries may be present
//! during secret rotation; any match is accepted.
//!
//! SMS provider: `X-Twilio-Signature` is base64(HMAC-SHA1(auth token, data))
//! where data is the full request URL followed by every form parameter,
//! sorted by name, as `name` + `value`.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is malformed")]
    MalformedHeader,
    #[error("signature timestamp is outside the tolerance window")]
    TimestampOutsideTolerance,
    #[error("signature does not match payload")]
    Mismatch,
}

pub fn sign_payload(secret: &[u8], timestamp: i64, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn signature_header(secret: &[u8], timestamp: i64, body: &[u8]) -> String {
    format!("t={timestamp},v1={}", sign_payload(secret, timestamp, body))
}

pub fn verify_signature(
    secret: &[u8],
    header: &str,
    body: &[u8],
    now: DateTime<Utc>,
    tolerance_secs: u64,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse::<i64>().map_err(|_| SignatureError::MalformedHeader)?)
            }
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
    if candidates.is_empty() {
        return Err(SignatureError::MalformedHeader);
    }

    let tolerance = i64::try_from(tolerance_secs).unwrap_or(i64::MAX);
    if now.timestamp().saturating_sub(timestamp).abs() > tolerance {
        return Err(SignatureError::TimestampOutsideTolerance);
    }

    for candidate in candidates {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac =
            HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::MalformedHeader)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    Err(SignatureError::Mismatch)
}

fn twilio_mac(auth_token: &[u8], url: &str, params: &BTreeMap<String, String>) -> Option<HmacSha1> {
    let mut mac = HmacSha1::new_from_slice(auth_token).ok()?;
    mac.update(url.as_bytes());
    for (name, value) in params {
        mac.update(name.as_bytes());
        mac.update(value.as_bytes());
    }
    Some(mac)
}

/// Computes the `X-Twilio-Signature` value for a form POST to `url`.
pub fn twilio_signature(auth_token: &[u8], url: &str, params: &BTreeMap<String, String>) -> String {
    twilio_mac(auth_token, url, params)
        .map(|mac| STANDARD.encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

pub fn verify_twilio_signature(
    auth_token: &[u8],
    header: &str,
    url: &str,
    params: &BTreeMap<String, String>,
) -> Result<(), SignatureError> {
    let provided = STANDARD.decode(header.trim()).map_err(|_| SignatureError::MalformedHeader)?;
    let mac = twilio_mac(auth_token, url, params).ok_or(SignatureError::MalformedHeader)?;
    mac.verify_slice(&provided).map_err(|_| SignatureError::Mismatch)
}
