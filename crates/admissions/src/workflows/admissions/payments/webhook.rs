//! Signed gateway event verification.
//!
//! Events carry a `Stripe-Signature`-style header, `t=<unix seconds>,v1=<hex>`, where each `v1`
//! value is an HMAC-SHA256 of `"<t>.<raw payload>"` under the shared webhook secret. An event is
//! trusted only when one `v1` value matches and `t` is within the configured tolerance.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::gateway::SessionPaymentStatus;
use super::stripe::parse_payment_status;
use crate::workflows::admissions::domain::ApplicationId;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COMPLETED: &str = "checkout.session.completed";
pub const SESSION_ASYNC_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";
pub const SESSION_EXPIRED: &str = "checkout.session.expired";

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("webhook secret is not configured")]
    MissingSecret,
    #[error("malformed signature header")]
    MalformedHeader,
    #[error("signature does not match payload")]
    SignatureMismatch,
    #[error("signature timestamp outside tolerance")]
    TimestampOutsideTolerance,
    #[error("event api version {received} does not match {expected}")]
    UnsupportedVersion { expected: String, received: String },
    #[error("malformed event payload: {0}")]
    Malformed(String),
}

/// Checkout session fields relevant to reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session_id: String,
    pub application_id: Option<ApplicationId>,
    pub payment_intent: Option<String>,
    pub payment_status: SessionPaymentStatus,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    SessionCompleted(SessionEvent),
    SessionExpired(SessionEvent),
    Other,
}

/// A verified gateway event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEvent {
    pub id: String,
    pub event_type: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance: Duration,
    api_version: Option<String>,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration, api_version: Option<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
            api_version,
        }
    }

    /// Verifies the signature header and decodes the event. Fails closed.
    pub fn verify(
        &self,
        payload: &[u8],
        header: &str,
        now: DateTime<Utc>,
    ) -> Result<GatewayEvent, EventError> {
        if self.secret.is_empty() {
            return Err(EventError::MissingSecret);
        }

        let (timestamp, signatures) = parse_header(header)?;
        let expected = compute_signature(&self.secret, timestamp, payload);
        let matched = signatures
            .iter()
            .any(|candidate| bool::from(expected.as_slice().ct_eq(candidate.as_slice())));
        if !matched {
            return Err(EventError::SignatureMismatch);
        }

        let signed_at =
            DateTime::<Utc>::from_timestamp(timestamp, 0).ok_or(EventError::MalformedHeader)?;
        let skew = now - signed_at;
        if skew > self.tolerance || skew < -self.tolerance {
            return Err(EventError::TimestampOutsideTolerance);
        }

        let event = decode_event(payload)?;
        if let (Some(expected), Some(received)) = (&self.api_version, &event.api_version) {
            if expected != received {
                return Err(EventError::UnsupportedVersion {
                    expected: expected.clone(),
                    received: received.clone(),
                });
            }
        }
        event.into_gateway_event()
    }
}

/// Hex HMAC-SHA256 of `"<timestamp>.<payload>"`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    hex::encode(compute_signature(secret, timestamp, payload))
}

/// Full signature header value for `payload`, as the gateway would send it.
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    format!("t={timestamp},v1={}", sign_payload(secret, timestamp, payload))
}

fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

fn parse_header(header: &str) -> Result<(i64, Vec<Vec<u8>>), EventError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            return Err(EventError::MalformedHeader);
        };
        match key {
            "t" => {
                timestamp = Some(value.parse::<i64>().map_err(|_| EventError::MalformedHeader)?)
            }
            "v1" => {
                // Undecodable candidates simply never match.
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok((timestamp, signatures)),
        Some(_) => Err(EventError::SignatureMismatch),
        None => Err(EventError::MalformedHeader),
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    api_version: Option<String>,
    data: RawData,
}

#[derive(Debug, Deserialize)]
struct RawData {
    object: Value,
}

#[derive(Debug, Deserialize)]
struct RawSession {
    id: String,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: Option<std::collections::HashMap<String, String>>,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
}

fn decode_event(payload: &[u8]) -> Result<RawEvent, EventError> {
    serde_json::from_slice(payload).map_err(|err| EventError::Malformed(err.to_string()))
}

impl RawEvent {
    fn into_gateway_event(self) -> Result<GatewayEvent, EventError> {
        let kind = match self.event_type.as_str() {
            SESSION_COMPLETED | SESSION_ASYNC_SUCCEEDED => {
                EventKind::SessionCompleted(session_event(self.data.object)?)
            }
            SESSION_EXPIRED => EventKind::SessionExpired(session_event(self.data.object)?),
            _ => EventKind::Other,
        };
        Ok(GatewayEvent {
            id: self.id,
            event_type: self.event_type,
            kind,
        })
    }
}

fn session_event(object: Value) -> Result<SessionEvent, EventError> {
    let raw: RawSession =
        serde_json::from_value(object).map_err(|err| EventError::Malformed(err.to_string()))?;

    let application_id = raw
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.get("application_id").cloned())
        .or(raw.client_reference_id)
        .filter(|reference| !reference.is_empty())
        .map(ApplicationId);
    let payment_status = match raw.payment_status.as_deref() {
        Some(status) => {
            parse_payment_status(status).map_err(|err| EventError::Malformed(err.to_string()))?
        }
        None => SessionPaymentStatus::Unpaid,
    };

    Ok(SessionEvent {
        session_id: raw.id,
        application_id,
        payment_intent: raw.payment_intent,
        payment_status,
        amount_total: raw.amount_total,
        currency: raw.currency,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SECRET: &str = "whsec_test";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 3, 9, 0, 0).unwrap()
    }

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new(SECRET, Duration::seconds(300), None)
    }

    fn completed_payload() -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": SESSION_COMPLETED,
            "api_version": "2024-06-20",
            "data": {"object": {
                "id": "cs_1",
                "client_reference_id": "app-1",
                "metadata": {"application_id": "app-1"},
                "payment_intent": "pi_1",
                "payment_status": "paid",
                "amount_total": 150000,
                "currency": "mxn"
            }}
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn accepts_a_correctly_signed_event() {
        let payload = completed_payload();
        let header = signature_header(SECRET, now().timestamp(), &payload);
        let event = verifier().verify(&payload, &header, now()).expect("valid");

        match event.kind {
            EventKind::SessionCompleted(session) => {
                assert_eq!(session.session_id, "cs_1");
                assert_eq!(session.application_id, Some(ApplicationId::from("app-1")));
                assert_eq!(session.payment_status, SessionPaymentStatus::Paid);
                assert_eq!(session.payment_intent.as_deref(), Some("pi_1"));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn rejects_tampered_payload() {
        let payload = completed_payload();
        let header = signature_header(SECRET, now().timestamp(), &payload);
        let mut tampered = payload.clone();
        tampered.extend_from_slice(b" ");
        assert!(matches!(
            verifier().verify(&tampered, &header, now()),
            Err(EventError::SignatureMismatch)
        ));
    }

    #[test]
    fn rejects_wrong_secret_and_stale_timestamp() {
        let payload = completed_payload();
        let forged = signature_header("whsec_other", now().timestamp(), &payload);
        assert!(matches!(
            verifier().verify(&payload, &forged, now()),
            Err(EventError::SignatureMismatch)
        ));

        let stale_at = now().timestamp() - 301;
        let stale = signature_header(SECRET, stale_at, &payload);
        assert!(matches!(
            verifier().verify(&payload, &stale, now()),
            Err(EventError::TimestampOutsideTolerance)
        ));
    }

    #[test]
    fn rejects_missing_secret_and_malformed_headers() {
        let payload = completed_payload();
        let unconfigured = WebhookVerifier::new("", Duration::seconds(300), None);
        let header = signature_header(SECRET, now().timestamp(), &payload);
        assert!(matches!(
            unconfigured.verify(&payload, &header, now()),
            Err(EventError::MissingSecret)
        ));
        assert!(matches!(
            verifier().verify(&payload, "garbage", now()),
            Err(EventError::MalformedHeader)
        ));
        assert!(matches!(
            verifier().verify(&payload, "v1=abcd", now()),
            Err(EventError::MalformedHeader)
        ));
    }

    #[test]
    fn enforces_declared_api_version() {
        let payload = completed_payload();
        let header = signature_header(SECRET, now().timestamp(), &payload);
        let pinned =
            WebhookVerifier::new(SECRET, Duration::seconds(300), Some("2025-01-01".to_string()));
        assert!(matches!(
            pinned.verify(&payload, &header, now()),
            Err(EventError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn unknown_event_types_decode_as_other() {
        let payload = br#"{"id":"evt_2","type":"customer.created","data":{"object":{}}}"#;
        let header = signature_header(SECRET, now().timestamp(), payload);
        let event = verifier().verify(payload, &header, now()).expect("valid");
        assert_eq!(event.kind, EventKind::Other);
        assert_eq!(event.event_type, "customer.created");
    }
}
