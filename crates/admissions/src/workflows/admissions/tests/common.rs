use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::response::Response;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use serde_json::{json, Value};

use crate::workflows::admissions::documents::{DocumentStorage, DocumentStorageError};
use crate::workflows::admissions::payments::{signature_header, WebhookOutcome};
use crate::workflows::admissions::{
    admissions_router, ActorId, Clock, AdmissionsResult, AdmissionsService, AdmissionsSettings,
    ApplicantData, EnrollmentApplication, EnrollmentSubmission, ExamResult, FeeSchedule,
    FixedClock, MemoryStore, Money, PaymentSettings, PersonalData, RetentionSettings,
    SandboxGateway, Shift, TicketIssued, WebhookVerifier,
};

pub(super) const WEBHOOK_SECRET: &str = "whsec_admissions_test";

pub(super) type TestService = AdmissionsService<MemoryStore, SandboxGateway, RecordingDocuments>;

/// 3 November 2025, 09:00 UTC.
pub(super) fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 3, 9, 0, 0)
        .single()
        .expect("valid start instant")
}

pub(super) fn admin() -> ActorId {
    ActorId("admin-ortega".to_string())
}

/// Document storage that only remembers which keys were removed.
#[derive(Debug, Default)]
pub(super) struct RecordingDocuments {
    removed: Mutex<Vec<String>>,
}

impl RecordingDocuments {
    pub(super) fn removed(&self) -> Vec<String> {
        self.removed.lock().expect("documents mutex").clone()
    }
}

impl DocumentStorage for RecordingDocuments {
    fn remove(&self, storage_key: &str) -> Result<(), DocumentStorageError> {
        self.removed
            .lock()
            .expect("documents mutex")
            .push(storage_key.to_string());
        Ok(())
    }
}

pub(super) fn settings() -> AdmissionsSettings {
    AdmissionsSettings {
        fees: FeeSchedule::new(Some(Money::from_cents(150_000)))
            .with_program("MED", Money::from_cents(300_000)),
        payments: PaymentSettings {
            currency: "mxn".to_string(),
            success_url: "http://localhost:3000/enrollment/payment/success".to_string(),
            cancel_url: "http://localhost:3000/enrollment/payment/cancel".to_string(),
            session_ttl: ChronoDuration::minutes(60),
            probe_timeout: Duration::from_millis(100),
        },
        webhook: WebhookVerifier::new(WEBHOOK_SECRET, ChronoDuration::seconds(300), None),
        retention: RetentionSettings::default(),
        expose_internal_errors: true,
    }
}

pub(super) struct Harness {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<SandboxGateway>,
    pub documents: Arc<RecordingDocuments>,
    pub clock: Arc<FixedClock>,
    pub service: Arc<TestService>,
}

impl Harness {
    pub(super) fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(SandboxGateway::new());
        let documents = Arc::new(RecordingDocuments::default());
        let clock = Arc::new(FixedClock::new(start()));
        let service = Arc::new(AdmissionsService::new(
            store.clone(),
            gateway.clone(),
            documents.clone(),
            clock.clone(),
            settings(),
        ));
        Self {
            store,
            gateway,
            documents,
            clock,
            service,
        }
    }

    pub(super) fn router(&self) -> axum::Router {
        admissions_router(self.service.clone())
    }

    pub(super) fn issue(&self, n: u32) -> TicketIssued {
        self.service
            .tickets
            .issue_ticket(applicant_data(n), "ING-SIS")
            .expect("ticket issued")
    }

    /// Issued, exam passed, and accepted from the waitlist.
    pub(super) fn accepted(&self, n: u32) -> TicketIssued {
        let issued = self.issue(n);
        self.service
            .tickets
            .record_exam_result(
                &issued.ticket_id,
                ExamResult {
                    score: 87,
                    passed: true,
                },
            )
            .expect("exam recorded");
        self.service
            .waitlist
            .accept(&issued.waitlist_entry_id, &admin())
            .expect("entry accepted");
        issued
    }

    /// Accepted and enrollment form submitted.
    pub(super) fn pending_payment(&self, n: u32) -> (TicketIssued, EnrollmentApplication) {
        let issued = self.accepted(n);
        let application = self
            .service
            .enrollment
            .submit(&issued.applicant_id, submission(n), &admin())
            .expect("application submitted");
        (issued, application)
    }

    pub(super) fn sign(&self, payload: &str) -> String {
        signature_header(WEBHOOK_SECRET, self.clock.now().timestamp(), payload.as_bytes())
    }

    pub(super) async fn deliver(&self, payload: &str) -> AdmissionsResult<WebhookOutcome> {
        let header = self.sign(payload);
        self.service
            .payments
            .handle_gateway_event(payload.as_bytes(), Some(&header))
            .await
    }

    /// Runs an application through checkout and a paid completion event.
    pub(super) async fn enroll(&self, n: u32) -> (TicketIssued, EnrollmentApplication, WebhookOutcome) {
        let (issued, application) = self.pending_payment(n);
        let session = self
            .service
            .payments
            .create_checkout_session(&application.id)
            .await
            .expect("checkout session created");
        let payload = self
            .gateway
            .complete(&session.session_id)
            .expect("sandbox session completes");
        let outcome = self.deliver(&payload).await.expect("event handled");
        (issued, application, outcome)
    }
}

pub(super) fn applicant_data(n: u32) -> ApplicantData {
    ApplicantData {
        full_name: format!("  Ana   López {n} "),
        email: format!("Ana.Lopez{n}@Example.MX"),
        national_id: format!("lopa010203hdfrrn{n:02}"),
        phone: Some("+52 55 1234 5678".to_string()),
    }
}

pub(super) fn submission(n: u32) -> EnrollmentSubmission {
    EnrollmentSubmission {
        personal: PersonalData {
            full_name: format!("Ana López {n}"),
            national_id: format!("LOPA010203HDFRRN{n:02}"),
            email: format!("ana.lopez{n}@example.mx"),
            birth_date: NaiveDate::from_ymd_opt(2001, 2, 3).expect("valid birth date"),
            phone: None,
            address: Some("Av. Reforma 100, CDMX".to_string()),
        },
        academic: json!({"previous_school": "Prepa 6", "average": 9.1}),
        guardian: None,
        program_id: "ING-SIS".to_string(),
        shift: Shift::Morning,
        section: "A".to_string(),
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
