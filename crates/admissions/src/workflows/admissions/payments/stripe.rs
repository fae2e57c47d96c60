//! Stripe-compatible REST client for checkout sessions and refunds.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;

use super::gateway::{
    CheckoutRequest, CheckoutSession, GatewayError, PaymentGateway, Refund, RefundRequest,
    SessionPaymentStatus, SessionStatus,
};
use crate::workflows::admissions::domain::Money;

/// Connection settings for [`StripeGateway`].
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub base_url: String,
    pub api_key: String,
    /// Sent as `Stripe-Version` when set.
    pub api_version: Option<String>,
    pub timeout: Duration,
}

pub struct StripeGateway {
    client: Client,
    config: StripeConfig,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.bearer_auth(&self.config.api_key);
        match &self.config.api_version {
            Some(version) => request.header("Stripe-Version", version),
            None => request,
        }
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, GatewayError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport_error)?;
        decode(response).await
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        let mut form = vec![
            ("mode", "payment".to_string()),
            ("success_url", request.success_url.clone()),
            ("cancel_url", request.cancel_url.clone()),
            ("client_reference_id", request.application_id.to_string()),
            ("metadata[application_id]", request.application_id.to_string()),
            ("line_items[0][quantity]", "1".to_string()),
            ("line_items[0][price_data][currency]", request.currency.clone()),
            (
                "line_items[0][price_data][unit_amount]",
                request.amount.cents().to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]",
                request.description.clone(),
            ),
            ("expires_at", request.expires_at.timestamp().to_string()),
        ];
        if let Some(email) = &request.customer_email {
            form.push(("customer_email", email.clone()));
        }

        debug!(application_id = %request.application_id, "creating checkout session");
        let session: StripeSession = self
            .send(self.client.post(self.url("checkout/sessions")).form(&form))
            .await?;
        session.into_checkout()
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<CheckoutSession, GatewayError> {
        let session: StripeSession = self
            .send(
                self.client
                    .get(self.url(&format!("checkout/sessions/{session_id}"))),
            )
            .await?;
        session.into_checkout()
    }

    async fn create_refund(&self, request: RefundRequest) -> Result<Refund, GatewayError> {
        let mut form = vec![
            ("payment_intent", request.payment_intent.clone()),
            ("metadata[application_id]", request.application_id.to_string()),
        ];
        if let Some(amount) = request.amount {
            form.push(("amount", amount.cents().to_string()));
        }

        let refund: StripeRefund = self
            .send(self.client.post(self.url("refunds")).form(&form))
            .await?;
        Ok(Refund {
            id: refund.id,
            status: refund.status.unwrap_or_else(|| "pending".to_string()),
            amount: refund.amount.map(Money::from_cents),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StripeSession {
    id: String,
    url: Option<String>,
    status: Option<String>,
    payment_status: String,
    expires_at: Option<i64>,
    payment_intent: Option<String>,
}

impl StripeSession {
    fn into_checkout(self) -> Result<CheckoutSession, GatewayError> {
        let status = match self.status.as_deref() {
            Some("open") | None => SessionStatus::Open,
            Some("complete") => SessionStatus::Complete,
            Some("expired") => SessionStatus::Expired,
            Some(other) => {
                return Err(GatewayError::Decode(format!("unknown session status '{other}'")))
            }
        };
        let payment_status = parse_payment_status(&self.payment_status)?;
        let expires_at = self
            .expires_at
            .map(|ts| {
                DateTime::<Utc>::from_timestamp(ts, 0)
                    .ok_or_else(|| GatewayError::Decode(format!("invalid expires_at {ts}")))
            })
            .transpose()?;

        Ok(CheckoutSession {
            id: self.id,
            url: self.url,
            status,
            payment_status,
            expires_at,
            payment_intent: self.payment_intent,
        })
    }
}

pub(crate) fn parse_payment_status(raw: &str) -> Result<SessionPaymentStatus, GatewayError> {
    match raw {
        "paid" => Ok(SessionPaymentStatus::Paid),
        "unpaid" => Ok(SessionPaymentStatus::Unpaid),
        "no_payment_required" => Ok(SessionPaymentStatus::NoPaymentRequired),
        other => Err(GatewayError::Decode(format!(
            "unknown payment status '{other}'"
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: Option<String>,
    amount: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Transport(err.to_string())
    }
}

async fn decode<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, GatewayError> {
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;
    if !status.is_success() {
        let message = serde_json::from_str::<StripeErrorBody>(&body)
            .ok()
            .and_then(|body| body.error.message)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
        return Err(GatewayError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    serde_json::from_str(&body).map_err(|err| GatewayError::Decode(err.to_string()))
}
