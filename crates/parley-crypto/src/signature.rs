//! Webhook signature verification (Svix scheme, as used by Clerk).
//!
//! The signed content is `"{id}.{timestamp}.{body}"` over the raw request
//! bytes. The signature header holds one or more space-separated
//! `v1,<base64 HMAC-SHA256>` entries; any one matching is enough.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const HEADER_ID: &str = "svix-id";
pub const HEADER_TIMESTAMP: &str = "svix-timestamp";
pub const HEADER_SIGNATURE: &str = "svix-signature";

const SECRET_PREFIX: &str = "whsec_";
const SIGNATURE_VERSION: &str = "v1";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("missing required header '{0}'")]
    MissingHeader(&'static str),

    #[error("webhook secret is empty or not valid base64")]
    MalformedSecret,

    #[error("invalid webhook timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("webhook timestamp is outside the accepted window")]
    TimestampOutOfTolerance,

    #[error("webhook signature verification failed")]
    Mismatch,
}

/// The three verification headers of an inbound event, as received.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignedHeaders<'a> {
    pub id: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub signature: Option<&'a str>,
}

#[derive(Clone)]
pub struct WebhookVerifier {
    key: Vec<u8>,
    tolerance: Option<Duration>,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("key", &"<redacted>")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl WebhookVerifier {
    /// `secret` is either a `whsec_`-prefixed base64 key or raw key text.
    /// `tolerance` bounds the distance between the event timestamp and now;
    /// `None` disables the check.
    pub fn new(secret: &str, tolerance: Option<Duration>) -> Result<Self, SignatureError> {
        let secret = secret.trim();
        let key = match secret.strip_prefix(SECRET_PREFIX) {
            Some(encoded) => B64.decode(encoded).map_err(|_| SignatureError::MalformedSecret)?,
            None => secret.as_bytes().to_vec(),
        };
        if key.is_empty() {
            return Err(SignatureError::MalformedSecret);
        }
        Ok(Self { key, tolerance })
    }

    /// Produce a `v1,<base64>` signature for the given event.
    pub fn sign(&self, id: &str, timestamp: &str, payload: &[u8]) -> Result<String, SignatureError> {
        let mac = self.mac(id, timestamp, payload)?;
        Ok(format!(
            "{SIGNATURE_VERSION},{}",
            B64.encode(mac.finalize().into_bytes())
        ))
    }

    /// Check an inbound event. Nothing about the event may be trusted unless
    /// this returns `Ok`.
    pub fn verify(
        &self,
        headers: &SignedHeaders<'_>,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let id = required(headers.id, HEADER_ID)?;
        let timestamp = required(headers.timestamp, HEADER_TIMESTAMP)?;
        let signature = required(headers.signature, HEADER_SIGNATURE)?;

        let sent_at: i64 = timestamp
            .parse()
            .map_err(|_| SignatureError::InvalidTimestamp(timestamp.to_string()))?;
        if let Some(tolerance) = self.tolerance {
            let skew = now.timestamp().abs_diff(sent_at);
            if skew > tolerance.as_secs() {
                return Err(SignatureError::TimestampOutOfTolerance);
            }
        }

        let mac = self.mac(id, timestamp, payload)?;

        for entry in signature.split_whitespace() {
            let Some((version, encoded)) = entry.split_once(',') else {
                continue;
            };
            if version != SIGNATURE_VERSION {
                continue;
            }
            let Ok(candidate) = B64.decode(encoded) else {
                continue;
            };
            // verify_slice compares in constant time
            if mac.clone().verify_slice(&candidate).is_ok() {
                return Ok(());
            }
        }

        Err(SignatureError::Mismatch)
    }

    fn mac(&self, id: &str, timestamp: &str, payload: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|_| SignatureError::MalformedSecret)?;
        mac.update(id.as_bytes());
        mac.update(b".");
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }
}

fn required<'a>(value: Option<&'a str>, name: &'static str) -> Result<&'a str, SignatureError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(SignatureError::MissingHeader(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";
    const BODY: &[u8] = br#"{"type":"user.created","data":{"id":"user_1"}}"#;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new(SECRET, Some(Duration::from_secs(300))).unwrap()
    }

    #[test]
    fn accepts_valid_signature() {
        let v = verifier();
        let sig = v.sign("msg_1", "1700000000", BODY).unwrap();
        let headers = SignedHeaders {
            id: Some("msg_1"),
            timestamp: Some("1700000000"),
            signature: Some(&sig),
        };
        assert_eq!(v.verify(&headers, BODY, at(1_700_000_010)), Ok(()));
    }

    #[test]
    fn accepts_any_matching_entry_in_list() {
        let v = verifier();
        let sig = v.sign("msg_1", "1700000000", BODY).unwrap();
        let list = format!("v1,bm90LXRoZS1zaWduYXR1cmU= v2,ignored {sig}");
        let headers = SignedHeaders {
            id: Some("msg_1"),
            timestamp: Some("1700000000"),
            signature: Some(&list),
        };
        assert_eq!(v.verify(&headers, BODY, at(1_700_000_000)), Ok(()));
    }

    #[test]
    fn rejects_tampered_body() {
        let v = verifier();
        let sig = v.sign("msg_1", "1700000000", BODY).unwrap();
        let headers = SignedHeaders {
            id: Some("msg_1"),
            timestamp: Some("1700000000"),
            signature: Some(&sig),
        };
        let tampered = br#"{"type":"user.created","data":{"id":"user_2"}}"#;
        assert_eq!(
            v.verify(&headers, tampered, at(1_700_000_000)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_signature_from_other_secret() {
        let other = WebhookVerifier::new("another-secret", None).unwrap();
        let sig = other.sign("msg_1", "1700000000", BODY).unwrap();
        let headers = SignedHeaders {
            id: Some("msg_1"),
            timestamp: Some("1700000000"),
            signature: Some(&sig),
        };
        assert_eq!(
            verifier().verify(&headers, BODY, at(1_700_000_000)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_missing_headers() {
        let v = verifier();
        let headers = SignedHeaders {
            id: Some("msg_1"),
            timestamp: None,
            signature: Some("v1,abc"),
        };
        assert_eq!(
            v.verify(&headers, BODY, at(1_700_000_000)),
            Err(SignatureError::MissingHeader(HEADER_TIMESTAMP))
        );

        let blank_id = SignedHeaders {
            id: Some("  "),
            ..headers
        };
        assert_eq!(
            v.verify(&blank_id, BODY, at(1_700_000_000)),
            Err(SignatureError::MissingHeader(HEADER_ID))
        );
    }

    #[test]
    fn rejects_stale_timestamp() {
        let v = verifier();
        let sig = v.sign("msg_1", "1700000000", BODY).unwrap();
        let headers = SignedHeaders {
            id: Some("msg_1"),
            timestamp: Some("1700000000"),
            signature: Some(&sig),
        };
        assert_eq!(
            v.verify(&headers, BODY, at(1_700_001_000)),
            Err(SignatureError::TimestampOutOfTolerance)
        );

        let lenient = WebhookVerifier::new(SECRET, None).unwrap();
        assert_eq!(lenient.verify(&headers, BODY, at(1_700_001_000)), Ok(()));
    }

    #[test]
    fn rejects_malformed_secret() {
        assert_eq!(
            WebhookVerifier::new("whsec_***", None).unwrap_err(),
            SignatureError::MalformedSecret
        );
        assert_eq!(
            WebhookVerifier::new("   ", None).unwrap_err(),
            SignatureError::MalformedSecret
        );
    }
}
