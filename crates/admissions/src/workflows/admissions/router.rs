use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use super::documents::DocumentStorage;
use super::domain::{
    ActorId, ApplicantId, ApplicationId, Money, TicketId, WaitlistEntryId, WaitlistStatus,
};
use super::enrollment::{DocumentUpload, EnrollmentSubmission};
use super::error::{AdmissionsError, ErrorKind};
use super::payments::PaymentGateway;
use super::registry::ApplicantData;
use super::service::AdmissionsService;
use super::store::{run_blocking, AdmissionsStore};
use super::tickets::{ExamResult, ExamSchedule};

pub const ACTOR_HEADER: &str = "x-actor-id";
pub const SIGNATURE_HEADER: &str = "stripe-signature";

type Shared<S, G, D> = State<Arc<AdmissionsService<S, G, D>>>;

/// Router exposing the admissions lifecycle under `/api/v1/admissions`.
pub fn admissions_router<S, G, D>(service: Arc<AdmissionsService<S, G, D>>) -> Router
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    Router::new()
        .route("/api/v1/admissions/tickets", post(issue_ticket::<S, G, D>))
        .route(
            "/api/v1/admissions/tickets/:ticket_id/schedule",
            post(schedule_exam::<S, G, D>),
        )
        .route(
            "/api/v1/admissions/tickets/:ticket_id/result",
            post(record_result::<S, G, D>),
        )
        .route("/api/v1/admissions/waitlist", get(list_waitlist::<S, G, D>))
        .route(
            "/api/v1/admissions/waitlist/:entry_id/accept",
            post(accept_entry::<S, G, D>),
        )
        .route(
            "/api/v1/admissions/waitlist/:entry_id/reject",
            post(reject_entry::<S, G, D>),
        )
        .route(
            "/api/v1/admissions/applicants/:applicant_id",
            get(applicant_overview::<S, G, D>).delete(purge_applicant::<S, G, D>),
        )
        .route(
            "/api/v1/admissions/applicants/:applicant_id/audit",
            get(audit_trail::<S, G, D>),
        )
        .route(
            "/api/v1/admissions/applicants/:applicant_id/application",
            post(submit_application::<S, G, D>),
        )
        .route(
            "/api/v1/admissions/applications/:application_id/documents",
            post(attach_document::<S, G, D>),
        )
        .route(
            "/api/v1/admissions/applications/:application_id/checkout",
            post(create_checkout::<S, G, D>),
        )
        .route(
            "/api/v1/admissions/applications/:application_id/refund",
            post(refund_payment::<S, G, D>),
        )
        .route(
            "/api/v1/admissions/payments/webhook",
            post(gateway_webhook::<S, G, D>),
        )
        .route(
            "/api/v1/admissions/retention/sweep",
            post(run_sweep::<S, G, D>),
        )
        .with_state(service)
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Conflict | ErrorKind::PreconditionFailed => StatusCode::CONFLICT,
        ErrorKind::InvalidSignature => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ExternalDependencyError => StatusCode::BAD_GATEWAY,
        ErrorKind::IntegrityFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `{"error": {"kind", "message", "retriable"}}`. Server-side detail is withheld unless
/// `expose_internal` is set.
pub fn error_response(err: &AdmissionsError, expose_internal: bool) -> Response {
    let kind = err.kind();
    let message = match kind {
        ErrorKind::IntegrityFailure if !expose_internal => {
            "the operation could not be completed; retry later".to_string()
        }
        ErrorKind::ExternalDependencyError if !expose_internal => {
            "an external service is unavailable; retry later".to_string()
        }
        _ => err.to_string(),
    };
    let payload = json!({
        "error": {
            "kind": kind,
            "message": message,
            "retriable": kind.is_retriable(),
        }
    });
    (status_for(kind), Json(payload)).into_response()
}

fn respond<S, G, D, T>(
    service: &AdmissionsService<S, G, D>,
    status: StatusCode,
    result: Result<T, AdmissionsError>,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
    T: serde::Serialize,
{
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(err) => error_response(&err, service.expose_internal_errors()),
    }
}

/// Runs a synchronous service call on the blocking pool.
async fn blocking<S, G, D, T, F>(
    service: &Arc<AdmissionsService<S, G, D>>,
    work: F,
) -> Result<T, AdmissionsError>
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
    T: Send + 'static,
    F: FnOnce(&AdmissionsService<S, G, D>) -> Result<T, AdmissionsError> + Send + 'static,
{
    let service = Arc::clone(service);
    run_blocking(move || work(&service)).await
}

fn actor(headers: &HeaderMap) -> Result<ActorId, AdmissionsError> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| ActorId(value.to_string()))
        .ok_or_else(|| AdmissionsError::validation(format!("missing {ACTOR_HEADER} header")))
}

#[derive(Debug, Deserialize)]
pub struct IssueTicketRequest {
    #[serde(flatten)]
    pub applicant: ApplicantData,
    pub career_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundBody {
    /// Decimal amount such as `"750.00"`; full refund when absent.
    #[serde(default)]
    pub amount: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WaitlistQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SweepQuery {
    pub grace_days: Option<u32>,
}

async fn issue_ticket<S, G, D>(
    State(service): Shared<S, G, D>,
    Json(request): Json<IssueTicketRequest>,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    let result = blocking(&service, move |service| {
        service
            .tickets
            .issue_ticket(request.applicant, &request.career_id)
    })
    .await;
    respond(&service, StatusCode::CREATED, result)
}

async fn schedule_exam<S, G, D>(
    State(service): Shared<S, G, D>,
    Path(ticket_id): Path<String>,
    Json(schedule): Json<ExamSchedule>,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    let result = blocking(&service, move |service| {
        service.tickets.schedule_exam(&TicketId(ticket_id), schedule)
    })
    .await;
    respond(&service, StatusCode::OK, result)
}

async fn record_result<S, G, D>(
    State(service): Shared<S, G, D>,
    Path(ticket_id): Path<String>,
    Json(exam): Json<ExamResult>,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    let result = blocking(&service, move |service| {
        service.tickets.record_exam_result(&TicketId(ticket_id), exam)
    })
    .await;
    respond(&service, StatusCode::OK, result)
}

async fn list_waitlist<S, G, D>(
    State(service): Shared<S, G, D>,
    Query(query): Query<WaitlistQuery>,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match WaitlistStatus::from_label(raw) {
            Some(status) => Some(status),
            None => {
                let err = AdmissionsError::validation(format!("unknown waitlist status '{raw}'"));
                return error_response(&err, service.expose_internal_errors());
            }
        },
    };
    let result = blocking(&service, move |service| service.waitlist.list(status)).await;
    respond(&service, StatusCode::OK, result)
}

async fn accept_entry<S, G, D>(
    State(service): Shared<S, G, D>,
    Path(entry_id): Path<String>,
    headers: HeaderMap,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    let actor = match actor(&headers) {
        Ok(actor) => actor,
        Err(err) => return error_response(&err, service.expose_internal_errors()),
    };
    let result = blocking(&service, move |service| {
        service.waitlist.accept(&WaitlistEntryId(entry_id), &actor)
    })
    .await;
    respond(&service, StatusCode::OK, result)
}

async fn reject_entry<S, G, D>(
    State(service): Shared<S, G, D>,
    Path(entry_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RejectRequest>,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    let actor = match actor(&headers) {
        Ok(actor) => actor,
        Err(err) => return error_response(&err, service.expose_internal_errors()),
    };
    let result = blocking(&service, move |service| {
        service
            .waitlist
            .reject(&WaitlistEntryId(entry_id), &request.reason, &actor)
    })
    .await;
    respond(&service, StatusCode::OK, result)
}

async fn applicant_overview<S, G, D>(
    State(service): Shared<S, G, D>,
    Path(applicant_id): Path<String>,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    let result = blocking(&service, move |service| {
        service.registry.overview(&ApplicantId(applicant_id))
    })
    .await;
    respond(&service, StatusCode::OK, result)
}

async fn audit_trail<S, G, D>(
    State(service): Shared<S, G, D>,
    Path(applicant_id): Path<String>,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    let result = blocking(&service, move |service| {
        service.registry.audit_trail(&ApplicantId(applicant_id))
    })
    .await;
    respond(&service, StatusCode::OK, result)
}

async fn purge_applicant<S, G, D>(
    State(service): Shared<S, G, D>,
    Path(applicant_id): Path<String>,
    headers: HeaderMap,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    let actor = match actor(&headers) {
        Ok(actor) => actor,
        Err(err) => return error_response(&err, service.expose_internal_errors()),
    };
    let result = blocking(&service, move |service| {
        service.retention.purge(&ApplicantId(applicant_id), &actor)
    })
    .await;
    respond(&service, StatusCode::OK, result)
}

async fn submit_application<S, G, D>(
    State(service): Shared<S, G, D>,
    Path(applicant_id): Path<String>,
    headers: HeaderMap,
    Json(submission): Json<EnrollmentSubmission>,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    // Applicants submit their own form; the header is only present for staff-assisted entry.
    let actor = actor(&headers).unwrap_or_else(|_| ActorId(applicant_id.clone()));
    let result = blocking(&service, move |service| {
        service
            .enrollment
            .submit(&ApplicantId(applicant_id), submission, &actor)
    })
    .await;
    respond(&service, StatusCode::CREATED, result)
}

async fn attach_document<S, G, D>(
    State(service): Shared<S, G, D>,
    Path(application_id): Path<String>,
    Json(upload): Json<DocumentUpload>,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    let result = blocking(&service, move |service| {
        service
            .enrollment
            .attach_document(&ApplicationId(application_id), upload)
    })
    .await;
    respond(&service, StatusCode::CREATED, result)
}

async fn create_checkout<S, G, D>(
    State(service): Shared<S, G, D>,
    Path(application_id): Path<String>,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    let result = service
        .payments
        .create_checkout_session(&ApplicationId(application_id))
        .await;
    respond(&service, StatusCode::OK, result)
}

async fn refund_payment<S, G, D>(
    State(service): Shared<S, G, D>,
    Path(application_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<RefundBody>>,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    let actor = match actor(&headers) {
        Ok(actor) => actor,
        Err(err) => return error_response(&err, service.expose_internal_errors()),
    };
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let amount = match body.amount.as_deref().map(|raw| {
        Money::parse(raw)
            .ok_or_else(|| AdmissionsError::validation(format!("'{raw}' is not a valid amount")))
    }) {
        Some(Ok(amount)) => Some(amount),
        Some(Err(err)) => return error_response(&err, service.expose_internal_errors()),
        None => None,
    };

    let result = service
        .payments
        .refund(&ApplicationId(application_id), amount, &actor)
        .await;
    respond(&service, StatusCode::OK, result)
}

async fn gateway_webhook<S, G, D>(
    State(service): Shared<S, G, D>,
    headers: HeaderMap,
    payload: Bytes,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let result = service
        .payments
        .handle_gateway_event(&payload, signature)
        .await;
    respond(&service, StatusCode::OK, result)
}

async fn run_sweep<S, G, D>(
    State(service): Shared<S, G, D>,
    headers: HeaderMap,
    Query(query): Query<SweepQuery>,
) -> Response
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    if let Err(err) = actor(&headers) {
        return error_response(&err, service.expose_internal_errors());
    }
    let result = blocking(&service, move |service| match query.grace_days {
        Some(days) => service.retention.sweep_with_grace(days),
        None => service.retention.sweep(),
    })
    .await;
    respond(&service, StatusCode::OK, result)
}
