use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::workflows::admissions::domain::{ApplicationId, Money};

/// Parameters for a hosted checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    /// Opaque reference echoed back in gateway events.
    pub application_id: ApplicationId,
    pub amount: Money,
    pub currency: String,
    pub description: String,
    pub customer_email: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Complete,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPaymentStatus {
    Paid,
    Unpaid,
    NoPaymentRequired,
}

/// Checkout session as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
    pub status: SessionStatus,
    pub payment_status: SessionPaymentStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub payment_intent: Option<String>,
}

impl CheckoutSession {
    /// The session can still take a payment.
    pub fn is_payable(&self) -> bool {
        self.status == SessionStatus::Open && self.payment_status == SessionPaymentStatus::Unpaid
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    pub application_id: ApplicationId,
    pub payment_intent: String,
    /// Full refund when omitted.
    pub amount: Option<Money>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Refund {
    pub id: String,
    pub status: String,
    pub amount: Option<Money>,
}

/// Outbound contract with the payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError>;

    async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession, GatewayError>;

    async fn create_refund(&self, request: RefundRequest) -> Result<Refund, GatewayError>;
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("payment gateway unreachable: {0}")]
    Transport(String),
    #[error("payment gateway rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected payment gateway response: {0}")]
    Decode(String),
    #[error("payment gateway timed out")]
    Timeout,
}
