//! Checkout sessions, signed gateway events, and promotion to student.

mod gateway;
mod sandbox;
mod service;
mod stripe;
mod webhook;

pub use gateway::{
    CheckoutRequest, CheckoutSession, GatewayError, PaymentGateway, Refund, RefundRequest,
    SessionPaymentStatus, SessionStatus,
};
pub use sandbox::SandboxGateway;
pub use service::{PaymentService, PaymentSettings, WebhookOutcome};
pub use stripe::{StripeConfig, StripeGateway};
pub use webhook::{
    sign_payload, signature_header, EventError, EventKind, GatewayEvent, SessionEvent,
    WebhookVerifier, SESSION_ASYNC_SUCCEEDED, SESSION_COMPLETED, SESSION_EXPIRED,
};
