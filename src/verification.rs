use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::{Choice, ConstantTimeEq};
use thiserror::Error;

use crate::types::WebhookDelivery;

type HmacSha256 = Hmac<Sha256>;

const SECRET_PREFIX: &str = "whsec_";
const SIGNATURE_SCHEME: &str = "v1";

/// Outcome of checking a delivery against the signing secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVerdict {
    Valid,
    InvalidSignature,
    MissingHeaders,
    /// No signing secret is configured; the delivery is accepted unchecked.
    VerificationSkipped,
}

impl SignatureVerdict {
    /// Whether the caller should go on to publish the delivery.
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Valid | Self::VerificationSkipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::InvalidSignature => "invalid-signature",
            Self::MissingHeaders => "missing-headers",
            Self::VerificationSkipped => "verification-skipped",
        }
    }
}

impl std::fmt::Display for SignatureVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signing secret is not valid base64: {0}")]
    InvalidSecret(#[from] base64::DecodeError),
    #[error("signing key rejected by HMAC")]
    InvalidKey,
}

/// Decode a `whsec_<base64>` secret into raw key bytes.
pub fn decode_secret(secret: &str) -> Result<Vec<u8>, SignatureError> {
    let encoded = secret.strip_prefix(SECRET_PREFIX).unwrap_or(secret);
    Ok(base64::engine::general_purpose::STANDARD.decode(encoded)?)
}

/// HMAC-SHA256 over `"{id}.{timestamp}.{payload}"`, base64 encoded.
/// The payload goes in as raw bytes, never re-serialized.
fn compute_signature(
    key: &[u8],
    msg_id: &str,
    timestamp: &str,
    payload: &[u8],
) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(msg_id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    Ok(base64::engine::general_purpose::STANDARD.encode(digest))
}

/// Produce a signature header value (`v1,<base64>`) for a payload, the way
/// the upstream signs its deliveries.
pub fn sign(
    secret: &str,
    msg_id: &str,
    timestamp: &str,
    payload: &[u8],
) -> Result<String, SignatureError> {
    let key = decode_secret(secret)?;
    let signature = compute_signature(&key, msg_id, timestamp, payload)?;
    Ok(format!("{SIGNATURE_SCHEME},{signature}"))
}

/// Verify a delivery signed with the Svix / Standard Webhooks scheme.
///
/// An unset or empty secret yields [`SignatureVerdict::VerificationSkipped`].
/// Every candidate in the signature header is compared in constant time; a
/// single match is enough. Any decoding failure fails closed.
pub fn verify(delivery: &WebhookDelivery, signing_secret: Option<&str>) -> SignatureVerdict {
    let secret = match signing_secret {
        Some(s) if !s.is_empty() => s,
        _ => return SignatureVerdict::VerificationSkipped,
    };

    let (msg_id, timestamp, header) =
        match (delivery.id(), delivery.timestamp(), delivery.signature()) {
            (Some(id), Some(ts), Some(sig)) => (id, ts, sig),
            _ => return SignatureVerdict::MissingHeaders,
        };

    let computed = match decode_secret(secret)
        .and_then(|key| compute_signature(&key, msg_id, timestamp, delivery.raw_payload()))
    {
        Ok(sig) => sig,
        Err(e) => {
            tracing::warn!(error = %e, "signature computation failed");
            return SignatureVerdict::InvalidSignature;
        }
    };

    // Fold over every candidate so the number of comparisons does not depend
    // on which one matched.
    let matched = header
        .candidates
        .iter()
        .fold(Choice::from(0), |acc, candidate| {
            acc | computed.as_bytes().ct_eq(candidate.signature.as_bytes())
        });

    if bool::from(matched) {
        SignatureVerdict::Valid
    } else {
        SignatureVerdict::InvalidSignature
    }
}

/// Holds the configured signing secret for the lifetime of the server.
#[derive(Debug, Clone, Default)]
pub struct SignatureVerifier {
    secret: Option<String>,
}

impl SignatureVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    pub fn verify(&self, delivery: &WebhookDelivery) -> SignatureVerdict {
        verify(delivery, self.secret.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_YWJjZGVm";
    const PAYLOAD: &str = r#"{"a":1}"#;
    // base64(HMAC-SHA256("abcdef", "msg_1.1700000000.{\"a\":1}"))
    const EXPECTED: &str = "ltwXeZ4L2nNpQBRQgbPABP9yzCrU+TMBtggMKl+j6no=";

    fn delivery(id: &str, ts: &str, sig: &str, payload: &str) -> WebhookDelivery {
        WebhookDelivery::new(
            Some(id.to_string()),
            Some(ts.to_string()),
            Some(sig),
            payload.to_string(),
        )
        .unwrap()
    }

    fn signed(payload: &str) -> WebhookDelivery {
        delivery("msg_1", "1700000000", &format!("v1,{EXPECTED}"), payload)
    }

    #[test]
    fn decodes_prefixed_secret() {
        assert_eq!(decode_secret(SECRET).unwrap(), b"abcdef");
        assert_eq!(decode_secret("YWJjZGVm").unwrap(), b"abcdef");
    }

    #[test]
    fn sign_matches_reference_digest() {
        let header = sign(SECRET, "msg_1", "1700000000", PAYLOAD.as_bytes()).unwrap();
        assert_eq!(header, format!("v1,{EXPECTED}"));
    }

    #[test]
    fn known_signature_is_valid() {
        assert_eq!(verify(&signed(PAYLOAD), Some(SECRET)), SignatureVerdict::Valid);
    }

    #[test]
    fn verdict_is_deterministic() {
        let d = signed(PAYLOAD);
        let first = verify(&d, Some(SECRET));
        for _ in 0..10 {
            assert_eq!(verify(&d, Some(SECRET)), first);
        }
    }

    #[test]
    fn tampered_payload_is_rejected() {
        assert_eq!(
            verify(&signed(r#"{"a":2}"#), Some(SECRET)),
            SignatureVerdict::InvalidSignature
        );
        // Same JSON value, different bytes.
        assert_eq!(
            verify(&signed(r#"{"a": 1}"#), Some(SECRET)),
            SignatureVerdict::InvalidSignature
        );
    }

    #[test]
    fn altered_id_or_timestamp_is_rejected() {
        let sig = format!("v1,{EXPECTED}");
        let cases = [
            delivery("msg_2", "1700000000", &sig, PAYLOAD),
            delivery("msg_1", "1700000001", &sig, PAYLOAD),
            delivery("1700000000", "msg_1", &sig, PAYLOAD),
        ];
        for d in &cases {
            assert_eq!(verify(d, Some(SECRET)), SignatureVerdict::InvalidSignature);
        }
    }

    #[test]
    fn any_matching_candidate_is_enough() {
        let header = format!("v1,AAAA v1,{EXPECTED}");
        let d = delivery("msg_1", "1700000000", &header, PAYLOAD);
        assert_eq!(verify(&d, Some(SECRET)), SignatureVerdict::Valid);

        let chained = format!("v1,AAAA,v1,{EXPECTED}");
        let d = delivery("msg_1", "1700000000", &chained, PAYLOAD);
        assert_eq!(verify(&d, Some(SECRET)), SignatureVerdict::Valid);
    }

    #[test]
    fn missing_secret_skips_verification() {
        let unsigned = WebhookDelivery::new(None, None, None, "{}").unwrap();
        assert_eq!(verify(&unsigned, None), SignatureVerdict::VerificationSkipped);
        assert_eq!(verify(&unsigned, Some("")), SignatureVerdict::VerificationSkipped);
        assert_eq!(
            verify(&signed(r#"{"a":2}"#), None),
            SignatureVerdict::VerificationSkipped
        );
        assert!(SignatureVerdict::VerificationSkipped.is_accepted());
    }

    #[test]
    fn missing_headers_are_reported() {
        let no_sig = WebhookDelivery::new(
            Some("msg_1".into()),
            Some("1700000000".into()),
            None,
            PAYLOAD,
        )
        .unwrap();
        assert_eq!(verify(&no_sig, Some(SECRET)), SignatureVerdict::MissingHeaders);

        let no_id = WebhookDelivery::new(None, Some("1".into()), Some("v1,x"), PAYLOAD).unwrap();
        assert_eq!(verify(&no_id, Some(SECRET)), SignatureVerdict::MissingHeaders);
        assert!(!SignatureVerdict::MissingHeaders.is_accepted());
    }

    #[test]
    fn undecodable_secret_fails_closed() {
        assert_eq!(
            verify(&signed(PAYLOAD), Some("whsec_!!!not-base64")),
            SignatureVerdict::InvalidSignature
        );
    }

    #[test]
    fn verifier_treats_empty_secret_as_unset() {
        let verifier = SignatureVerifier::new(Some(String::new()));
        assert!(!verifier.is_enabled());
        assert_eq!(
            verifier.verify(&signed(PAYLOAD)),
            SignatureVerdict::VerificationSkipped
        );

        let verifier = SignatureVerifier::new(Some(SECRET.to_string()));
        assert!(verifier.is_enabled());
        assert_eq!(verifier.verify(&signed(PAYLOAD)), SignatureVerdict::Valid);
    }
}
