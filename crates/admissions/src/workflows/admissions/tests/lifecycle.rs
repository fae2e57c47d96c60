use std::collections::BTreeSet;

use chrono::Duration as ChronoDuration;

use super::common::*;
use crate::workflows::admissions::{
    ApplicantStatus, AuditAction, DocumentCategory, DocumentUpload, ErrorKind, ExamResult,
    ExamSchedule, ExamTicketStatus, FaultPoint, PaymentStatus, WaitlistStatus,
};

#[test]
fn issuing_a_ticket_registers_applicant_ticket_and_waitlist_entry() {
    let harness = Harness::new();

    let first = harness.issue(1);
    let second = harness.issue(2);

    assert_eq!(first.folio, "FE-2025-0001");
    assert_eq!(second.folio, "FE-2025-0002");
    assert_eq!((first.position, second.position), (1, 2));

    let applicant = harness
        .service
        .registry
        .applicant(&first.applicant_id)
        .expect("applicant exists");
    assert_eq!(applicant.status, ApplicantStatus::UnderReview);
    assert!(applicant.temporary);
    assert_eq!(applicant.full_name, "Ana López 1");
    assert_eq!(applicant.email, "ana.lopez1@example.mx");
    assert_eq!(applicant.national_id, "LOPA010203HDFRRN01");

    let trail = harness
        .service
        .registry
        .audit_trail(&first.applicant_id)
        .expect("audit trail");
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].action, AuditAction::Registered);
    assert_eq!(trail[0].from_status, None);
    assert_eq!(trail[0].to_status, ApplicantStatus::UnderReview);

    let counts = harness.store.counts();
    assert_eq!(counts.applicants, 2);
    assert_eq!(counts.tickets, 2);
    assert_eq!(counts.waitlist_entries, 2);
}

#[test]
fn duplicate_identity_is_refused_without_side_effects() {
    let harness = Harness::new();
    harness.issue(1);

    let mut same_national_id = applicant_data(2);
    same_national_id.national_id = applicant_data(1).national_id;
    let err = harness
        .service
        .tickets
        .issue_ticket(same_national_id, "ING-SIS")
        .expect_err("national id already registered");
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let mut same_email = applicant_data(3);
    same_email.email = "ANA.LOPEZ1@example.mx".to_string();
    let err = harness
        .service
        .tickets
        .issue_ticket(same_email, "ING-SIS")
        .expect_err("email already registered");
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(harness.store.counts().applicants, 1);
    assert_eq!(harness.store.counts().tickets, 1);
}

#[test]
fn malformed_identity_is_a_validation_error() {
    let harness = Harness::new();

    let mut data = applicant_data(1);
    data.email = "not-an-email".to_string();
    let err = harness
        .service
        .tickets
        .issue_ticket(data, "ING-SIS")
        .expect_err("email is malformed");
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    let mut data = applicant_data(1);
    data.national_id = "SHORT".to_string();
    let err = harness
        .service
        .tickets
        .issue_ticket(data, "ING-SIS")
        .expect_err("national id is malformed");
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert_eq!(harness.store.counts().applicants, 0);
}

#[test]
fn failed_issuance_rolls_back_and_does_not_burn_a_folio() {
    let harness = Harness::new();
    harness.store.inject_fault(FaultPoint::InsertWaitlistEntry);

    let err = harness
        .service
        .tickets
        .issue_ticket(applicant_data(1), "ING-SIS")
        .expect_err("injected fault");
    assert_eq!(err.kind(), ErrorKind::IntegrityFailure);
    assert!(err.kind().is_retriable());
    assert_eq!(harness.store.counts(), Default::default());

    let issued = harness.issue(1);
    assert_eq!(issued.folio, "FE-2025-0001");
    assert_eq!(issued.position, 1);
}

#[test]
fn exam_can_be_scheduled_taken_and_graded() {
    let harness = Harness::new();
    let issued = harness.issue(1);
    let exam_date = start() + ChronoDuration::days(10);

    let ticket = harness
        .service
        .tickets
        .schedule_exam(
            &issued.ticket_id,
            ExamSchedule {
                exam_date,
                venue: " Aula Magna ".to_string(),
            },
        )
        .expect("exam scheduled");
    assert_eq!(ticket.status, ExamTicketStatus::Scheduled);
    assert_eq!(ticket.venue.as_deref(), Some("Aula Magna"));

    let ticket = harness
        .service
        .tickets
        .mark_taken(&issued.ticket_id)
        .expect("exam taken");
    assert_eq!(ticket.status, ExamTicketStatus::Taken);

    let err = harness
        .service
        .tickets
        .record_exam_result(
            &issued.ticket_id,
            ExamResult {
                score: 101,
                passed: true,
            },
        )
        .expect_err("score out of range");
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    let ticket = harness
        .service
        .tickets
        .record_exam_result(
            &issued.ticket_id,
            ExamResult {
                score: 92,
                passed: true,
            },
        )
        .expect("result recorded");
    assert_eq!(ticket.status, ExamTicketStatus::Approved);
    assert_eq!(ticket.score, Some(92));

    let err = harness
        .service
        .tickets
        .record_exam_result(
            &issued.ticket_id,
            ExamResult {
                score: 40,
                passed: false,
            },
        )
        .expect_err("ticket already graded");
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

#[test]
fn failed_exam_only_marks_the_ticket_and_blocks_acceptance() {
    let harness = Harness::new();
    let issued = harness.issue(1);

    harness
        .service
        .tickets
        .record_exam_result(
            &issued.ticket_id,
            ExamResult {
                score: 41,
                passed: false,
            },
        )
        .expect("result recorded");

    let err = harness
        .service
        .waitlist
        .accept(&issued.waitlist_entry_id, &admin())
        .expect_err("ticket is not approved");
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    let overview = harness
        .service
        .registry
        .overview(&issued.applicant_id)
        .expect("overview");
    assert_eq!(overview.applicant.status, ApplicantStatus::UnderReview);
    assert_eq!(
        overview.ticket.map(|ticket| ticket.status),
        Some(ExamTicketStatus::Rejected)
    );
    assert_eq!(
        overview.waitlist_entry.map(|entry| entry.status),
        Some(WaitlistStatus::Waiting)
    );
}

#[test]
fn accepting_an_approved_entry_opens_the_enrollment_form() {
    let harness = Harness::new();
    let issued = harness.accepted(1);

    let applicant = harness
        .service
        .registry
        .applicant(&issued.applicant_id)
        .expect("applicant");
    assert_eq!(applicant.status, ApplicantStatus::PendingForm);

    let trail = harness
        .service
        .registry
        .audit_trail(&issued.applicant_id)
        .expect("audit trail");
    let last = trail.last().expect("entries recorded");
    assert_eq!(last.action, AuditAction::WaitlistAccepted);
    assert_eq!(last.from_status, Some(ApplicantStatus::UnderReview));
    assert_eq!(last.actor, admin());

    let err = harness
        .service
        .waitlist
        .accept(&issued.waitlist_entry_id, &admin())
        .expect_err("entry already accepted");
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

#[test]
fn rejection_overrides_an_approved_ticket_and_starts_retention() {
    let harness = Harness::new();
    let issued = harness.issue(1);
    harness
        .service
        .tickets
        .record_exam_result(
            &issued.ticket_id,
            ExamResult {
                score: 95,
                passed: true,
            },
        )
        .expect("result recorded");

    let err = harness
        .service
        .waitlist
        .reject(&issued.waitlist_entry_id, "   ", &admin())
        .expect_err("reason required");
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    let decision = harness
        .service
        .waitlist
        .reject(&issued.waitlist_entry_id, "incomplete documents", &admin())
        .expect("entry rejected");
    assert_eq!(decision.entry.status, WaitlistStatus::Rejected);
    assert_eq!(
        decision.entry.decision_reason.as_deref(),
        Some("incomplete documents")
    );
    assert_eq!(decision.ticket.status, ExamTicketStatus::Rejected);
    assert_eq!(decision.applicant.status, ApplicantStatus::Rejected);
    assert_eq!(decision.applicant.rejection_date, Some(start()));

    let trail = harness
        .service
        .registry
        .audit_trail(&issued.applicant_id)
        .expect("audit trail");
    let last = trail.last().expect("entries recorded");
    assert_eq!(last.action, AuditAction::WaitlistRejected);
    assert_eq!(last.reason.as_deref(), Some("incomplete documents"));
}

#[test]
fn waitlist_is_listed_in_position_order() {
    let harness = Harness::new();
    let first = harness.issue(1);
    let second = harness.issue(2);
    let third = harness.issue(3);
    harness
        .service
        .waitlist
        .reject(&second.waitlist_entry_id, "duplicate request", &admin())
        .expect("rejected");

    let all = harness.service.waitlist.list(None).expect("list");
    let positions: Vec<u32> = all.iter().map(|entry| entry.position).collect();
    assert_eq!(positions, vec![1, 2, 3]);

    let waiting = harness
        .service
        .waitlist
        .list(Some(WaitlistStatus::Waiting))
        .expect("list waiting");
    let ids: Vec<_> = waiting.iter().map(|entry| entry.id.clone()).collect();
    assert_eq!(ids, vec![first.waitlist_entry_id, third.waitlist_entry_id]);
}

#[test]
fn enrollment_form_is_accepted_once() {
    let harness = Harness::new();
    let (issued, application) = harness.pending_payment(1);

    assert_eq!(application.amount_due.to_string(), "1500.00");
    assert_eq!(application.payment_status, PaymentStatus::Pending);
    assert_eq!(
        harness
            .service
            .registry
            .applicant(&issued.applicant_id)
            .expect("applicant")
            .status,
        ApplicantStatus::PendingPayment
    );

    let err = harness
        .service
        .enrollment
        .submit(&issued.applicant_id, submission(1), &admin())
        .expect_err("second submission");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(harness.store.counts().applications, 1);
}

#[test]
fn enrollment_form_requires_an_accepted_applicant() {
    let harness = Harness::new();
    let issued = harness.issue(1);

    let err = harness
        .service
        .enrollment
        .submit(&issued.applicant_id, submission(1), &admin())
        .expect_err("applicant is still under review");
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert_eq!(harness.store.counts().applications, 0);
}

#[test]
fn programs_without_a_fee_fall_back_to_the_default() {
    let harness = Harness::new();
    let issued = harness.accepted(1);
    let mut form = submission(1);
    form.program_id = "MED".to_string();

    let application = harness
        .service
        .enrollment
        .submit(&issued.applicant_id, form, &admin())
        .expect("submitted");
    assert_eq!(application.amount_due.cents(), 300_000);
}

#[test]
fn documents_attach_to_live_applications_only() {
    let harness = Harness::new();
    let (issued, application) = harness.pending_payment(1);

    let document = harness
        .service
        .enrollment
        .attach_document(
            &application.id,
            DocumentUpload {
                name: "Acta de nacimiento".to_string(),
                category: DocumentCategory::BirthCertificate,
                storage_key: "applications/1/acta.pdf".to_string(),
            },
        )
        .expect("document attached");
    assert_eq!(document.application_id, application.id);

    harness
        .service
        .waitlist
        .reject(&issued.waitlist_entry_id, "never paid", &admin())
        .expect("rejected from pending payment");

    let err = harness
        .service
        .enrollment
        .attach_document(
            &application.id,
            DocumentUpload {
                name: "CURP".to_string(),
                category: DocumentCategory::Identification,
                storage_key: "applications/1/curp.pdf".to_string(),
            },
        )
        .expect_err("applicant is rejected");
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert_eq!(harness.store.counts().documents, 1);
}

#[test]
fn document_keys_must_stay_inside_the_document_root() {
    let harness = Harness::new();
    let (_, application) = harness.pending_payment(1);

    for key in ["../outside.pdf", "/etc/passwd", "applications/../../x.pdf"] {
        let err = harness
            .service
            .enrollment
            .attach_document(
                &application.id,
                DocumentUpload {
                    name: "Comprobante de domicilio".to_string(),
                    category: DocumentCategory::ProofOfAddress,
                    storage_key: key.to_string(),
                },
            )
            .expect_err("key escapes the document root");
        assert_eq!(err.kind(), ErrorKind::ValidationError, "{key}");
    }
    assert_eq!(harness.store.counts().documents, 0);
}

#[test]
fn concurrent_issuance_never_repeats_a_folio_or_position() {
    let harness = Harness::new();

    let issued = std::thread::scope(|scope| {
        let handles: Vec<_> = (1..=16)
            .map(|n| {
                let harness = &harness;
                scope.spawn(move || harness.issue(n))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("issuing thread"))
            .collect::<Vec<_>>()
    });

    let folios: BTreeSet<_> = issued.iter().map(|ticket| ticket.folio.clone()).collect();
    let positions: BTreeSet<_> = issued.iter().map(|ticket| ticket.position).collect();
    assert_eq!(folios.len(), 16);
    assert_eq!(positions, (1..=16).collect::<BTreeSet<u32>>());
    assert!(folios.contains("FE-2025-0001"));
    assert!(folios.contains("FE-2025-0016"));
    assert_eq!(harness.store.counts().applicants, 16);
}
