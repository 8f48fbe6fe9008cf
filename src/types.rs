use axum::body::Bytes;
use axum::http::HeaderMap;
use serde_json::Value;

/// Header names carrying the delivery id, checked in order.
pub const ID_HEADERS: [&str; 2] = ["svix-id", "webhook-id"];
pub const TIMESTAMP_HEADERS: [&str; 2] = ["svix-timestamp", "webhook-timestamp"];
pub const SIGNATURE_HEADERS: [&str; 2] = ["svix-signature", "webhook-signature"];

/// One `scheme,signature` pair out of a signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureCandidate {
    /// Key version that produced the signature, e.g. `v1`.
    pub scheme: String,
    /// Base64 digest as sent by the upstream.
    pub signature: String,
}

/// Every candidate signature found on a delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureHeader {
    pub candidates: Vec<SignatureCandidate>,
}

impl SignatureHeader {
    /// Parse `v1,<b64>` pairs. Pairs may be separated by whitespace
    /// (`v1,a v1,b`) or chained with commas (`v1,a,v1,b`); a dangling
    /// scheme without a signature is dropped.
    pub fn parse(value: &str) -> Self {
        let mut candidates = Vec::new();
        for token in value.split_whitespace() {
            let parts: Vec<&str> = token.split(',').collect();
            for pair in parts.chunks_exact(2) {
                let (scheme, signature) = (pair[0].trim(), pair[1].trim());
                if scheme.is_empty() || signature.is_empty() {
                    continue;
                }
                candidates.push(SignatureCandidate {
                    scheme: scheme.to_string(),
                    signature: signature.to_string(),
                });
            }
        }
        Self { candidates }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// An inbound webhook delivery. The raw body is kept byte-for-byte so the
/// signature can be recomputed over exactly what was received.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    id: Option<String>,
    timestamp: Option<String>,
    signature: Option<SignatureHeader>,
    raw_payload: Bytes,
    payload: Value,
}

impl WebhookDelivery {
    /// Build a delivery from its parts. Fails if the body is not JSON.
    pub fn new(
        id: Option<String>,
        timestamp: Option<String>,
        signature: Option<&str>,
        raw_payload: impl Into<Bytes>,
    ) -> Result<Self, serde_json::Error> {
        let raw_payload = raw_payload.into();
        let payload = serde_json::from_slice(&raw_payload)?;
        Ok(Self {
            id: id.filter(|s| !s.is_empty()),
            timestamp: timestamp.filter(|s| !s.is_empty()),
            signature: signature
                .map(SignatureHeader::parse)
                .filter(|h| !h.is_empty()),
            raw_payload,
            payload,
        })
    }

    /// Build a delivery from request headers and the untouched request body.
    pub fn from_request(headers: &HeaderMap, body: Bytes) -> Result<Self, serde_json::Error> {
        Self::new(
            header_value(headers, &ID_HEADERS).map(str::to_string),
            header_value(headers, &TIMESTAMP_HEADERS).map(str::to_string),
            header_value(headers, &SIGNATURE_HEADERS),
            body,
        )
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    pub fn signature(&self) -> Option<&SignatureHeader> {
        self.signature.as_ref()
    }

    pub fn raw_payload(&self) -> &[u8] {
        &self.raw_payload
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

/// First non-empty, valid UTF-8 value among `names`.
fn header_value<'a>(headers: &'a HeaderMap, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parses_single_pair() {
        let header = SignatureHeader::parse("v1,abc=");
        assert_eq!(
            header.candidates,
            vec![SignatureCandidate {
                scheme: "v1".to_string(),
                signature: "abc=".to_string(),
            }]
        );
    }

    #[test]
    fn parses_space_and_comma_separated_lists() {
        let spaced = SignatureHeader::parse("v1,aaa v2,bbb");
        let chained = SignatureHeader::parse("v1,aaa,v2,bbb");
        assert_eq!(spaced, chained);
        assert_eq!(spaced.candidates.len(), 2);
        assert_eq!(spaced.candidates[1].scheme, "v2");
        assert_eq!(spaced.candidates[1].signature, "bbb");
    }

    #[test]
    fn drops_incomplete_pairs() {
        assert!(SignatureHeader::parse("v1").is_empty());
        assert!(SignatureHeader::parse("v1,").is_empty());
        assert_eq!(SignatureHeader::parse("v1,a,v1").candidates.len(), 1);
    }

    #[test]
    fn delivery_keeps_raw_bytes() {
        let raw = "{ \"a\" :  1 }";
        let delivery =
            WebhookDelivery::new(Some("msg_1".into()), Some("1".into()), Some("v1,x"), raw)
                .unwrap();
        assert_eq!(delivery.raw_payload(), raw.as_bytes());
        assert_eq!(delivery.payload()["a"], 1);
    }

    #[test]
    fn delivery_rejects_non_json_body() {
        assert!(WebhookDelivery::new(None, None, None, "not json").is_err());
    }

    #[test]
    fn delivery_reads_svix_then_standard_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("webhook-id", HeaderValue::from_static("msg_std"));
        headers.insert("svix-timestamp", HeaderValue::from_static("1700000000"));
        headers.insert("svix-signature", HeaderValue::from_static("v1,sig"));

        let delivery = WebhookDelivery::from_request(&headers, Bytes::from_static(b"{}")).unwrap();
        assert_eq!(delivery.id(), Some("msg_std"));
        assert_eq!(delivery.timestamp(), Some("1700000000"));
        assert_eq!(delivery.signature().unwrap().candidates.len(), 1);
    }

    #[test]
    fn empty_headers_count_as_missing() {
        let mut headers = HeaderMap::new();
        headers.insert("svix-id", HeaderValue::from_static(""));
        let delivery = WebhookDelivery::from_request(&headers, Bytes::from_static(b"{}")).unwrap();
        assert!(delivery.id().is_none());
        assert!(delivery.signature().is_none());
    }
}
