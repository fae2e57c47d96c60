use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use admissions::workflows::admissions::payments::signature_header;
use admissions::workflows::admissions::{
    ActorId, AdmissionsService, AdmissionsSettings, ApplicantData, ApplicantStatus, Clock,
    DocumentCategory, DocumentUpload, EnrollmentSubmission, ErrorKind, ExamResult, FeeSchedule,
    FixedClock, LocalDocumentStorage, Money, PaymentSettings, PersonalData, RetentionSettings,
    SandboxGateway, Shift, SqliteStore, WebhookOutcome, WebhookVerifier,
};
use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use serde_json::json;

const SECRET: &str = "whsec_sqlite";

type SqliteService = AdmissionsService<SqliteStore, SandboxGateway, LocalDocumentStorage>;

struct Fixture {
    _dir: tempfile::TempDir,
    database: std::path::PathBuf,
    documents: std::path::PathBuf,
    store: Arc<SqliteStore>,
    gateway: Arc<SandboxGateway>,
    clock: Arc<FixedClock>,
    service: SqliteService,
}

fn settings() -> AdmissionsSettings {
    AdmissionsSettings {
        fees: FeeSchedule::new(Some(Money::from_cents(150_000))),
        payments: PaymentSettings {
            currency: "mxn".to_string(),
            success_url: "http://localhost/success".to_string(),
            cancel_url: "http://localhost/cancel".to_string(),
            session_ttl: ChronoDuration::minutes(60),
            probe_timeout: Duration::from_millis(100),
        },
        webhook: WebhookVerifier::new(SECRET, ChronoDuration::seconds(300), None),
        retention: RetentionSettings::default(),
        expose_internal_errors: false,
    }
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("temp dir");
    let database = dir.path().join("db").join("admissions.sqlite3");
    let documents = dir.path().join("documents");
    let store = Arc::new(SqliteStore::open(&database).expect("database opens"));
    let gateway = Arc::new(SandboxGateway::new());
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 11, 3, 9, 0, 0)
            .single()
            .expect("valid instant"),
    ));
    let service = AdmissionsService::new(
        store.clone(),
        gateway.clone(),
        Arc::new(LocalDocumentStorage::new(&documents)),
        clock.clone(),
        settings(),
    );
    Fixture {
        _dir: dir,
        database,
        documents,
        store,
        gateway,
        clock,
        service,
    }
}

fn applicant(n: u32) -> ApplicantData {
    ApplicantData {
        full_name: format!("María Hernández {n}"),
        email: format!("maria{n}@example.mx"),
        national_id: format!("HEMM020304MDFRRR{n:02}"),
        phone: None,
    }
}

fn form(n: u32) -> EnrollmentSubmission {
    EnrollmentSubmission {
        personal: PersonalData {
            full_name: format!("María Hernández {n}"),
            national_id: format!("HEMM020304MDFRRR{n:02}"),
            email: format!("maria{n}@example.mx"),
            birth_date: NaiveDate::from_ymd_opt(2002, 3, 4).expect("valid date"),
            phone: Some("55 8765 4321".to_string()),
            address: None,
        },
        academic: json!({"previous_school": "CCH Sur"}),
        guardian: Some(json!({"name": "Rosa Hernández"})),
        program_id: "ARQ".to_string(),
        shift: Shift::Afternoon,
        section: "B".to_string(),
    }
}

fn admin() -> ActorId {
    ActorId("admin-sqlite".to_string())
}

#[tokio::test]
async fn full_lifecycle_on_sqlite() {
    let fx = fixture();

    let issued = fx
        .service
        .tickets
        .issue_ticket(applicant(1), "ARQ")
        .expect("ticket issued");
    assert_eq!(issued.folio, "FE-2025-0001");

    fx.service
        .tickets
        .record_exam_result(
            &issued.ticket_id,
            ExamResult {
                score: 78,
                passed: true,
            },
        )
        .expect("graded");
    fx.service
        .waitlist
        .accept(&issued.waitlist_entry_id, &admin())
        .expect("accepted");
    let application = fx
        .service
        .enrollment
        .submit(&issued.applicant_id, form(1), &ActorId(issued.applicant_id.to_string()))
        .expect("submitted");

    let session = fx
        .service
        .payments
        .create_checkout_session(&application.id)
        .await
        .expect("checkout");
    let payload = fx.gateway.complete(&session.session_id).expect("complete");
    let header = signature_header(SECRET, fx.clock.now().timestamp(), payload.as_bytes());

    let outcome = fx
        .service
        .payments
        .handle_gateway_event(payload.as_bytes(), Some(&header))
        .await
        .expect("promoted");
    assert!(matches!(
        outcome,
        WebhookOutcome::Promoted { ref control_number, .. } if control_number == "25110001"
    ));

    let replay = fx
        .service
        .payments
        .handle_gateway_event(payload.as_bytes(), Some(&header))
        .await
        .expect("replay acknowledged");
    assert!(matches!(replay, WebhookOutcome::AlreadyPaid { .. }));

    let overview = fx
        .service
        .registry
        .overview(&issued.applicant_id)
        .expect("overview");
    assert_eq!(overview.applicant.status, ApplicantStatus::Enrolled);
    assert_eq!(
        overview.application.and_then(|application| application.guardian),
        Some(json!({"name": "Rosa Hernández"}))
    );

    let counts = fx.store.counts().expect("counts");
    assert_eq!(counts.students, 1);
    assert_eq!(counts.payments, 1);
    assert_eq!(counts.audit_entries, 4);
}

#[test]
fn duplicate_identity_is_refused_by_sqlite() {
    let fx = fixture();
    fx.service
        .tickets
        .issue_ticket(applicant(1), "ARQ")
        .expect("ticket issued");

    let err = fx
        .service
        .tickets
        .issue_ticket(applicant(1), "ARQ")
        .expect_err("same identity");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(fx.store.counts().expect("counts").applicants, 1);
}

#[test]
fn sweep_respects_foreign_keys_and_removes_files() {
    let fx = fixture();
    let issued = fx
        .service
        .tickets
        .issue_ticket(applicant(1), "ARQ")
        .expect("ticket issued");
    fx.service
        .tickets
        .record_exam_result(
            &issued.ticket_id,
            ExamResult {
                score: 88,
                passed: true,
            },
        )
        .expect("graded");
    fx.service
        .waitlist
        .accept(&issued.waitlist_entry_id, &admin())
        .expect("accepted");
    let application = fx
        .service
        .enrollment
        .submit(&issued.applicant_id, form(1), &admin())
        .expect("submitted");

    let key = "applications/maria/acta.pdf";
    let file = fx.documents.join(key);
    std::fs::create_dir_all(file.parent().expect("parent dir")).expect("create dirs");
    std::fs::write(&file, b"%PDF-1.7").expect("write file");
    fx.service
        .enrollment
        .attach_document(
            &application.id,
            DocumentUpload {
                name: "Acta".to_string(),
                category: DocumentCategory::BirthCertificate,
                storage_key: key.to_string(),
            },
        )
        .expect("attached");

    fx.service
        .waitlist
        .reject(&issued.waitlist_entry_id, "never paid", &admin())
        .expect("rejected");

    fx.clock.advance(ChronoDuration::days(8));
    let report = fx.service.retention.sweep().expect("sweep");
    assert_eq!(report.deleted, 1);
    assert_eq!(report.failed, 0);
    assert!(!file.exists());
    assert_eq!(fx.store.counts().expect("counts"), Default::default());
}

#[test]
fn records_and_sequences_survive_reopening() {
    let fx = fixture();
    let issued = fx
        .service
        .tickets
        .issue_ticket(applicant(1), "ARQ")
        .expect("ticket issued");
    fx.service
        .waitlist
        .reject(&issued.waitlist_entry_id, "duplicate", &admin())
        .expect("rejected");
    fx.service
        .retention
        .sweep_with_grace(0)
        .expect("sweep");

    let reopened = Arc::new(SqliteStore::open(&fx.database).expect("reopen"));
    let service: SqliteService = AdmissionsService::new(
        reopened,
        Arc::new(SandboxGateway::new()),
        Arc::new(LocalDocumentStorage::new(&fx.documents)),
        fx.clock.clone(),
        settings(),
    );
    let next = service
        .tickets
        .issue_ticket(applicant(2), "ARQ")
        .expect("ticket issued");
    assert_eq!(next.folio, "FE-2025-0002");
    assert_eq!(next.position, 2);
}

#[test]
fn two_handles_on_one_database_never_share_a_folio() {
    let fx = fixture();
    let second: SqliteService = AdmissionsService::new(
        Arc::new(SqliteStore::open(&fx.database).expect("second handle")),
        Arc::new(SandboxGateway::new()),
        Arc::new(LocalDocumentStorage::new(&fx.documents)),
        fx.clock.clone(),
        settings(),
    );

    let issued = std::thread::scope(|scope| {
        let handles: Vec<_> = (1..=12)
            .map(|n| {
                let service = if n % 2 == 0 { &fx.service } else { &second };
                scope.spawn(move || service.tickets.issue_ticket(applicant(n), "ARQ"))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .expect("issuing thread")
                    .expect("ticket issued")
            })
            .collect::<Vec<_>>()
    });

    let folios: BTreeSet<_> = issued.iter().map(|ticket| ticket.folio.clone()).collect();
    let positions: BTreeSet<_> = issued.iter().map(|ticket| ticket.position).collect();
    assert_eq!(folios.len(), 12);
    assert_eq!(positions.len(), 12);
    assert_eq!(fx.store.counts().expect("counts").applicants, 12);
}
