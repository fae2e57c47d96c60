//! In-process gateway used by the demo, by tests, and by servers running without an API key.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::gateway::{
    CheckoutRequest, CheckoutSession, GatewayError, PaymentGateway, Refund, RefundRequest,
    SessionPaymentStatus, SessionStatus,
};
use super::webhook::{SESSION_COMPLETED, SESSION_EXPIRED};
use crate::workflows::admissions::domain::{ApplicationId, Money};

#[derive(Debug, Clone)]
struct SandboxSession {
    session: CheckoutSession,
    application_id: ApplicationId,
    amount: Money,
    currency: String,
}

#[derive(Debug, Default)]
struct SandboxState {
    sessions: HashMap<String, SandboxSession>,
    refunds: Vec<RefundRequest>,
    next_id: u32,
    unreachable: bool,
    latency: Option<Duration>,
}

/// Deterministic gateway: sessions are numbered `cs_sandbox_0001`, `cs_sandbox_0002`, ...
#[derive(Debug, Default)]
pub struct SandboxGateway {
    state: Mutex<SandboxState>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SandboxState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulates an outage: every call fails with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Delays session lookups, to exercise probe timeouts.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    pub fn sessions_created(&self) -> usize {
        self.state().sessions.len()
    }

    pub fn refunds(&self) -> Vec<RefundRequest> {
        self.state().refunds.clone()
    }

    /// Marks the session paid and returns the matching `checkout.session.completed` payload.
    pub fn complete(&self, session_id: &str) -> Result<String, GatewayError> {
        let mut state = self.state();
        let entry = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;
        entry.session.status = SessionStatus::Complete;
        entry.session.payment_status = SessionPaymentStatus::Paid;
        entry.session.payment_intent = Some(session_id.replace("cs_", "pi_"));
        Ok(event_payload(SESSION_COMPLETED, entry))
    }

    /// Expires the session and returns the matching `checkout.session.expired` payload.
    pub fn expire(&self, session_id: &str) -> Result<String, GatewayError> {
        let mut state = self.state();
        let entry = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found(session_id))?;
        entry.session.status = SessionStatus::Expired;
        Ok(event_payload(SESSION_EXPIRED, entry))
    }

    fn ensure_reachable(&self) -> Result<(), GatewayError> {
        if self.state().unreachable {
            Err(GatewayError::Transport("sandbox gateway is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

fn not_found(session_id: &str) -> GatewayError {
    GatewayError::Rejected {
        status: 404,
        message: format!("no such checkout session: {session_id}"),
    }
}

fn event_payload(event_type: &str, entry: &SandboxSession) -> String {
    let payment_status = match entry.session.payment_status {
        SessionPaymentStatus::Paid => "paid",
        SessionPaymentStatus::Unpaid => "unpaid",
        SessionPaymentStatus::NoPaymentRequired => "no_payment_required",
    };
    json!({
        "id": format!("evt_{}_{}", event_type.rsplit('.').next().unwrap_or("event"), entry.session.id),
        "type": event_type,
        "data": {
            "object": {
                "id": entry.session.id,
                "object": "checkout.session",
                "client_reference_id": entry.application_id,
                "metadata": {"application_id": entry.application_id},
                "payment_intent": entry.session.payment_intent,
                "payment_status": payment_status,
                "amount_total": entry.amount.cents(),
                "currency": entry.currency,
            }
        }
    })
    .to_string()
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        self.ensure_reachable()?;
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("cs_sandbox_{:04}", state.next_id);
        let session = CheckoutSession {
            id: id.clone(),
            url: Some(format!("https://sandbox.invalid/checkout/{id}")),
            status: SessionStatus::Open,
            payment_status: SessionPaymentStatus::Unpaid,
            expires_at: Some(request.expires_at),
            payment_intent: None,
        };
        state.sessions.insert(
            id,
            SandboxSession {
                session: session.clone(),
                application_id: request.application_id,
                amount: request.amount,
                currency: request.currency,
            },
        );
        Ok(session)
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession, GatewayError> {
        self.ensure_reachable()?;
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.state()
            .sessions
            .get(session_id)
            .map(|entry| entry.session.clone())
            .ok_or_else(|| not_found(session_id))
    }

    async fn create_refund(&self, request: RefundRequest) -> Result<Refund, GatewayError> {
        self.ensure_reachable()?;
        let mut state = self.state();
        state.refunds.push(request.clone());
        Ok(Refund {
            id: format!("re_sandbox_{:04}", state.refunds.len()),
            status: "succeeded".to_string(),
            amount: request.amount,
        })
    }
}
