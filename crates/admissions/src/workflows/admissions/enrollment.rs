use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::clock::Clock;
use super::documents::is_confined_key;
use super::domain::{
    ActorId, ApplicantId, ApplicantStatus, ApplicationId, AuditAction, DocumentCategory,
    DocumentId, DocumentRecord, EnrollmentApplication, Money, PaymentStatus, PersonalData, Shift,
};
use super::error::{AdmissionsError, AdmissionsResult};
use super::registry::{self, TransitionContext};
use super::store::{AdmissionsStore, StoreTx};

/// Amount due per program, with an optional fallback for programs not listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeSchedule {
    default_fee: Option<Money>,
    programs: BTreeMap<String, Money>,
}

impl FeeSchedule {
    pub fn new(default_fee: Option<Money>) -> Self {
        Self {
            default_fee,
            programs: BTreeMap::new(),
        }
    }

    pub fn with_program(mut self, program_id: impl Into<String>, fee: Money) -> Self {
        self.programs.insert(program_id.into(), fee);
        self
    }

    pub fn amount_for(&self, program_id: &str) -> Option<Money> {
        self.programs.get(program_id).copied().or(self.default_fee)
    }
}

/// Enrollment form as submitted by an accepted applicant.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EnrollmentSubmission {
    pub personal: PersonalData,
    pub academic: Value,
    #[serde(default)]
    pub guardian: Option<Value>,
    pub program_id: String,
    pub shift: Shift,
    pub section: String,
}

/// Reference to a file already stored by the document-storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DocumentUpload {
    pub name: String,
    pub category: DocumentCategory,
    pub storage_key: String,
}

pub struct EnrollmentService<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    fees: FeeSchedule,
}

impl<S> EnrollmentService<S>
where
    S: AdmissionsStore + 'static,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, fees: FeeSchedule) -> Self {
        Self { store, clock, fees }
    }

    /// Creates the application and moves the applicant to `pending_payment`.
    ///
    /// A second submission fails with [`AdmissionsError::AlreadyExists`].
    pub fn submit(
        &self,
        applicant_id: &ApplicantId,
        submission: EnrollmentSubmission,
        actor: &ActorId,
    ) -> AdmissionsResult<EnrollmentApplication> {
        let submission = validate(submission)?;
        let amount_due = self.fees.amount_for(&submission.program_id).ok_or_else(|| {
            AdmissionsError::validation(format!(
                "no fee is configured for program {}",
                submission.program_id
            ))
        })?;

        self.store.read(|tx| ensure_no_application(tx, applicant_id))?;

        let application = self.store.transaction(|tx| {
            ensure_no_application(tx, applicant_id)?;
            let mut applicant = registry::load(tx, applicant_id)?;
            if applicant.status != ApplicantStatus::PendingForm {
                return Err(AdmissionsError::precondition(format!(
                    "applicant {} is {}, not pending_form",
                    applicant.id,
                    applicant.status.label()
                )));
            }

            let now = self.clock.now();
            let application = EnrollmentApplication {
                id: ApplicationId::generate(),
                applicant_id: applicant.id.clone(),
                personal: submission.personal.clone(),
                academic: submission.academic.clone(),
                guardian: submission.guardian.clone(),
                program_id: submission.program_id.clone(),
                shift: submission.shift,
                section: submission.section.clone(),
                amount_due,
                payment_status: PaymentStatus::Pending,
                checkout_session: None,
                paid_at: None,
                student_id: None,
                created_at: now,
                updated_at: now,
            };
            tx.insert_application(&application)?;

            registry::transition(
                tx,
                &mut applicant,
                ApplicantStatus::PendingPayment,
                TransitionContext {
                    action: AuditAction::ApplicationSubmitted,
                    actor,
                    reason: None,
                    at: now,
                },
            )?;
            Ok(application)
        })?;

        info!(
            application_id = %application.id,
            applicant_id = %application.applicant_id,
            amount_due = %application.amount_due,
            "enrollment application submitted"
        );
        Ok(application)
    }

    /// Records a document reference against an application.
    pub fn attach_document(
        &self,
        application_id: &ApplicationId,
        upload: DocumentUpload,
    ) -> AdmissionsResult<DocumentRecord> {
        let name = upload.name.trim().to_string();
        let storage_key = upload.storage_key.trim().to_string();
        if name.is_empty() || storage_key.is_empty() {
            return Err(AdmissionsError::validation(
                "document name and storage key are required",
            ));
        }
        if !is_confined_key(&storage_key) {
            return Err(AdmissionsError::validation(format!(
                "storage key '{storage_key}' must be a relative path inside the document root"
            )));
        }

        let document = self.store.transaction(|tx| {
            let application = load_application(tx, application_id)?;
            let applicant = registry::load(tx, &application.applicant_id)?;
            if applicant.status == ApplicantStatus::Rejected {
                return Err(AdmissionsError::precondition(format!(
                    "applicant {} is rejected",
                    applicant.id
                )));
            }

            let document = DocumentRecord {
                id: DocumentId::generate(),
                application_id: application.id,
                name: name.clone(),
                category: upload.category,
                storage_key: storage_key.clone(),
                uploaded_at: self.clock.now(),
            };
            tx.insert_document(&document)?;
            Ok(document)
        })?;

        info!(
            application_id = %document.application_id,
            category = document.category.label(),
            "document attached"
        );
        Ok(document)
    }

    pub fn application(&self, id: &ApplicationId) -> AdmissionsResult<EnrollmentApplication> {
        self.store.read(|tx| load_application(tx, id))
    }
}

fn validate(mut submission: EnrollmentSubmission) -> AdmissionsResult<EnrollmentSubmission> {
    submission.personal.full_name = registry::normalize_name(&submission.personal.full_name)?;
    submission.personal.email = registry::normalize_email(&submission.personal.email)?;
    submission.personal.national_id =
        registry::normalize_national_id(&submission.personal.national_id)?;
    submission.personal.phone = submission
        .personal
        .phone
        .as_deref()
        .map(registry::normalize_phone)
        .transpose()?;

    if !submission.academic.is_object() {
        return Err(AdmissionsError::validation("academic data must be an object"));
    }
    if matches!(&submission.guardian, Some(guardian) if !guardian.is_object()) {
        return Err(AdmissionsError::validation("guardian data must be an object"));
    }

    submission.program_id = submission.program_id.trim().to_string();
    submission.section = submission.section.trim().to_string();
    if submission.program_id.is_empty() {
        return Err(AdmissionsError::validation("program id is required"));
    }
    if submission.section.is_empty() {
        return Err(AdmissionsError::validation("section is required"));
    }
    Ok(submission)
}

fn ensure_no_application(tx: &dyn StoreTx, applicant_id: &ApplicantId) -> AdmissionsResult<()> {
    match tx.application_for_applicant(applicant_id)? {
        Some(existing) => Err(AdmissionsError::AlreadyExists(format!(
            "enrollment application {} for applicant {applicant_id}",
            existing.id
        ))),
        None => Ok(()),
    }
}

pub(crate) fn load_application(
    tx: &dyn StoreTx,
    id: &ApplicationId,
) -> AdmissionsResult<EnrollmentApplication> {
    tx.application(id)?
        .ok_or_else(|| AdmissionsError::not_found(format!("enrollment application {id}")))
}
