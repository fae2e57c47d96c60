use admissions::error::AppError;
use admissions::workflows::admissions::payments::signature_header;
use admissions::workflows::admissions::{
    ActorId, AdmissionsError, AdmissionsService, AdmissionsSettings, ApplicantData, Clock,
    EnrollmentSubmission, ExamResult, FeeSchedule, FixedClock, LocalDocumentStorage, MemoryStore,
    Money, PaymentSettings, PersonalData, RetentionSettings, SandboxGateway, Shift,
    WebhookOutcome, WebhookVerifier,
};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use clap::Args;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const DEMO_SECRET: &str = "whsec_demo";

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Skip the retention sweep at the end of the walkthrough
    #[arg(long)]
    pub(crate) skip_retention: bool,
}

type DemoService = AdmissionsService<MemoryStore, SandboxGateway, LocalDocumentStorage>;

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let clock = Arc::new(FixedClock::new(demo_start()?));
    let gateway = Arc::new(SandboxGateway::new());
    let documents = std::env::temp_dir().join("admissions-demo-documents");
    let service: DemoService = AdmissionsService::new(
        Arc::new(MemoryStore::new()),
        gateway.clone(),
        Arc::new(LocalDocumentStorage::new(documents)),
        clock.clone(),
        demo_settings(),
    );
    let admin = ActorId("admin-demo".to_string());

    println!("Admissions lifecycle demo");
    println!("  Clock pinned at {}", clock.now().to_rfc3339());

    let issued = service.tickets.issue_ticket(
        applicant("Valeria Núñez Campos", "valeria.nunez@example.mx", "NUCV060512MDFXMLA4"),
        "ING-SIS",
    )?;
    println!(
        "\nExam ticket {} issued; waitlist position {}",
        issued.folio, issued.position
    );

    service.tickets.record_exam_result(
        &issued.ticket_id,
        ExamResult {
            score: 91,
            passed: true,
        },
    )?;
    service.waitlist.accept(&issued.waitlist_entry_id, &admin)?;
    println!("  Exam graded 91/100 and waitlist entry accepted");

    let birth_date =
        NaiveDate::from_ymd_opt(2006, 5, 12).ok_or_else(|| invalid("birth date"))?;
    let application = service.enrollment.submit(
        &issued.applicant_id,
        EnrollmentSubmission {
            personal: PersonalData {
                full_name: "Valeria Núñez Campos".to_string(),
                national_id: "NUCV060512MDFXMLA4".to_string(),
                email: "valeria.nunez@example.mx".to_string(),
                birth_date,
                phone: Some("55 1234 5678".to_string()),
                address: None,
            },
            academic: json!({"previous_school": "Preparatoria 6", "average": 9.1}),
            guardian: None,
            program_id: "ING-SIS".to_string(),
            shift: Shift::Morning,
            section: "A".to_string(),
        },
        &ActorId(issued.applicant_id.to_string()),
    )?;
    println!(
        "  Enrollment form {} submitted; amount due {}",
        application.id, application.amount_due
    );

    let session = service
        .payments
        .create_checkout_session(&application.id)
        .await?;
    println!("\nCheckout session {} opened", session.session_id);

    let payload = gateway
        .complete(&session.session_id)
        .map_err(AdmissionsError::from)?;
    let header = signature_header(DEMO_SECRET, clock.now().timestamp(), payload.as_bytes());

    match service
        .payments
        .handle_gateway_event(payload.as_bytes(), Some(&header))
        .await?
    {
        WebhookOutcome::Promoted {
            control_number,
            student_id,
            ..
        } => println!(
            "  Payment settled; student {student_id} holds control number {control_number}"
        ),
        other => println!("  Unexpected webhook outcome: {other:?}"),
    }

    let replay = service
        .payments
        .handle_gateway_event(payload.as_bytes(), Some(&header))
        .await?;
    println!("  Redelivered event acknowledged as {replay:?}");

    let second = service.tickets.issue_ticket(
        applicant("Diego Ramírez Soto", "diego.ramirez@example.mx", "RASD050918HDFMTGA1"),
        "ING-SIS",
    )?;
    service
        .waitlist
        .reject(&second.waitlist_entry_id, "did not attend the exam", &admin)?;
    println!(
        "\nExam ticket {} issued and its applicant rejected",
        second.folio
    );

    let overview = service.registry.overview(&issued.applicant_id)?;
    match serde_json::to_string_pretty(&overview.student) {
        Ok(json) => println!("\nStudent record:\n{json}"),
        Err(err) => println!("\nStudent record unavailable: {err}"),
    }

    if args.skip_retention {
        return Ok(());
    }

    clock.advance(ChronoDuration::days(8));
    let report = service.retention.sweep()?;
    println!(
        "\nRetention sweep after 8 days: {} candidate(s), {} deleted, {} failed",
        report.candidates, report.deleted, report.failed
    );
    match service.registry.applicant(&second.applicant_id) {
        Ok(_) => println!("  Rejected applicant still on record"),
        Err(err) => println!("  Rejected applicant purged ({err})"),
    }

    Ok(())
}

fn demo_start() -> Result<DateTime<Utc>, AppError> {
    Utc.with_ymd_and_hms(2025, 11, 3, 9, 0, 0)
        .single()
        .ok_or_else(|| invalid("demo start"))
}

fn invalid(what: &str) -> AppError {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid {what}")).into()
}

fn demo_settings() -> AdmissionsSettings {
    AdmissionsSettings {
        fees: FeeSchedule::new(Some(Money::from_cents(150_000))),
        payments: PaymentSettings {
            currency: "mxn".to_string(),
            success_url: "http://localhost:3000/enrollment/payment/success".to_string(),
            cancel_url: "http://localhost:3000/enrollment/payment/cancel".to_string(),
            session_ttl: ChronoDuration::minutes(60),
            probe_timeout: Duration::from_secs(2),
        },
        webhook: WebhookVerifier::new(DEMO_SECRET, ChronoDuration::seconds(300), None),
        retention: RetentionSettings::default(),
        expose_internal_errors: true,
    }
}

fn applicant(full_name: &str, email: &str, national_id: &str) -> ApplicantData {
    ApplicantData {
        full_name: full_name.to_string(),
        email: email.to_string(),
        national_id: national_id.to_string(),
        phone: None,
    }
}
