//! Wire records exchanged between two replicas, and login signing.

use crate::core::apply::ApplyReport;
use crate::core::content_hash::SectorHashes;
use crate::core::entity_change::WireChange;
use crate::{ArborError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Version both sides must agree on; bumped on any incompatible wire change.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted difference between the login timestamp and the peer's clock.
pub const MAX_CLOCK_SKEW_SECS: i64 = 5 * 60;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// RFC 3339 timestamp; the signed message.
    pub timestamp: String,
    pub protocol_version: u32,
    /// Base64 HMAC-SHA256 of `timestamp` keyed with the document secret.
    pub auth_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub instance_id: String,
    pub max_sequence_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub changes: Vec<WireChange>,
    /// Watermark the requester stores once `changes` are applied.
    pub last_sequence_id: i64,
    pub outstanding_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub entities: Vec<WireChange>,
    pub origin_instance_id: String,
}

pub type PushResponse = ApplyReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashCheckResponse {
    pub sector_hashes: SectorHashes,
    pub max_sequence_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSectorResponse {
    pub requeued: usize,
}

fn mac(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ArborError::Crypto(format!("Invalid document secret: {e}")))
}

/// Signs a login timestamp with the document secret.
pub fn sign_login(secret: &str, timestamp: &str) -> Result<String> {
    let mut mac = mac(secret)?;
    mac.update(timestamp.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Builds a signed login request stamped with `now`.
pub fn login_request(secret: &str, now: DateTime<Utc>) -> Result<LoginRequest> {
    let timestamp = now.to_rfc3339();
    Ok(LoginRequest {
        auth_hash: sign_login(secret, &timestamp)?,
        timestamp,
        protocol_version: PROTOCOL_VERSION,
    })
}

/// Checks a login request against the local secret and clock.
///
/// # Errors
///
/// Returns [`ArborError::Protocol`] on a version mismatch and
/// [`ArborError::Unauthorized`] for a malformed or skewed timestamp or a bad
/// signature.
pub fn verify_login(secret: &str, request: &LoginRequest, now: DateTime<Utc>) -> Result<()> {
    if request.protocol_version != PROTOCOL_VERSION {
        return Err(ArborError::Protocol(format!(
            "Protocol version {} does not match local version {PROTOCOL_VERSION}",
            request.protocol_version
        )));
    }

    let sent = DateTime::parse_from_rfc3339(&request.timestamp)
        .map_err(|e| ArborError::Unauthorized(format!("Bad login timestamp: {e}")))?;
    let skew = (now - sent.with_timezone(&Utc)).num_seconds().abs();
    if skew > MAX_CLOCK_SKEW_SECS {
        return Err(ArborError::Unauthorized(format!(
            "Clocks differ by {skew}s, more than the allowed {MAX_CLOCK_SKEW_SECS}s"
        )));
    }

    let signature = BASE64
        .decode(&request.auth_hash)
        .map_err(|_| ArborError::Unauthorized("Login signature is not base64".to_string()))?;
    let mut mac = mac(secret)?;
    mac.update(request.timestamp.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| ArborError::Unauthorized("Login signature does not match".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_signed_login_verifies() {
        let now = Utc::now();
        let request = login_request("secret", now).unwrap();
        assert!(verify_login("secret", &request, now).is_ok());
        assert!(verify_login("secret", &request, now + Duration::minutes(4)).is_ok());
    }

    #[test]
    fn test_wrong_secret_is_unauthorized() {
        let now = Utc::now();
        let request = login_request("secret", now).unwrap();
        assert!(matches!(
            verify_login("other", &request, now),
            Err(ArborError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_clock_skew_is_rejected() {
        let now = Utc::now();
        let request = login_request("secret", now - Duration::minutes(6)).unwrap();
        assert!(matches!(
            verify_login("secret", &request, now),
            Err(ArborError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_version_mismatch_is_protocol_error() {
        let now = Utc::now();
        let mut request = login_request("secret", now).unwrap();
        request.protocol_version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            verify_login("secret", &request, now),
            Err(ArborError::Protocol(_))
        ));
    }

    #[test]
    fn test_records_use_camel_case() {
        let json = serde_json::to_string(&LoginResponse {
            instance_id: "inst-a".to_string(),
            max_sequence_id: 4,
        })
        .unwrap();
        assert!(json.contains("maxSequenceId"));
    }
}
