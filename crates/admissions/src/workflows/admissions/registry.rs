use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    ActorId, Applicant, ApplicantId, ApplicantStatus, AuditAction, AuditEntry, AuditEntryId,
    DocumentRecord, EnrollmentApplication, ExamTicket, Student, WaitlistEntry,
};
use super::error::{AdmissionsError, AdmissionsResult};
use super::store::{AdmissionsStore, StoreTx};

const NATIONAL_ID_LEN: usize = 18;

/// Identity data captured when an exam ticket is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicantData {
    pub full_name: String,
    pub email: String,
    pub national_id: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl ApplicantData {
    /// Trims and normalizes the identity fields, refusing malformed input.
    pub fn normalized(self) -> AdmissionsResult<Self> {
        Ok(Self {
            full_name: normalize_name(&self.full_name)?,
            email: normalize_email(&self.email)?,
            national_id: normalize_national_id(&self.national_id)?,
            phone: self.phone.as_deref().map(normalize_phone).transpose()?,
        })
    }
}

pub fn normalize_name(raw: &str) -> AdmissionsResult<String> {
    let name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return Err(AdmissionsError::validation("full name is required"));
    }
    if name.chars().count() > 200 {
        return Err(AdmissionsError::validation("full name is too long"));
    }
    Ok(name)
}

pub fn normalize_email(raw: &str) -> AdmissionsResult<String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if valid {
        Ok(email)
    } else {
        Err(AdmissionsError::validation(format!("'{}' is not a valid email", raw.trim())))
    }
}

/// National identity numbers are 18-character alphanumeric codes, stored uppercase.
pub fn normalize_national_id(raw: &str) -> AdmissionsResult<String> {
    let id = raw.trim().to_uppercase();
    if id.len() != NATIONAL_ID_LEN || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AdmissionsError::validation(format!(
            "national id must be {NATIONAL_ID_LEN} alphanumeric characters"
        )));
    }
    Ok(id)
}

pub fn normalize_phone(raw: &str) -> AdmissionsResult<String> {
    let phone = raw.trim();
    let digits = phone.chars().filter(char::is_ascii_digit).count();
    let allowed = phone
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')'));
    if !allowed || !(7..=15).contains(&digits) {
        return Err(AdmissionsError::validation(format!("'{phone}' is not a valid phone number")));
    }
    Ok(phone.to_string())
}

/// Who moved an applicant, why, and when.
#[derive(Debug, Clone)]
pub struct TransitionContext<'a> {
    pub action: AuditAction,
    pub actor: &'a ActorId,
    pub reason: Option<&'a str>,
    pub at: DateTime<Utc>,
}

/// Persists a freshly registered applicant together with its `∅ → under_review` audit entry.
pub fn register(
    tx: &mut dyn StoreTx,
    applicant: &Applicant,
    actor: &ActorId,
) -> AdmissionsResult<()> {
    tx.insert_applicant(applicant)?;
    tx.append_audit(&AuditEntry {
        id: AuditEntryId::generate(),
        applicant_id: applicant.id.clone(),
        action: AuditAction::Registered,
        from_status: None,
        to_status: applicant.status,
        actor: actor.clone(),
        reason: None,
        recorded_at: applicant.created_at,
    })?;
    Ok(())
}

/// Loads the applicant inside the caller's transaction, so the status check that follows sees
/// the latest committed value.
pub fn load(tx: &dyn StoreTx, id: &ApplicantId) -> AdmissionsResult<Applicant> {
    tx.applicant(id)?
        .ok_or_else(|| AdmissionsError::not_found(format!("applicant {id}")))
}

/// Applies a legal status change, persists it, and appends the audit entry.
///
/// On an illegal change nothing is written and the applicant is left untouched.
pub fn transition(
    tx: &mut dyn StoreTx,
    applicant: &mut Applicant,
    to: ApplicantStatus,
    ctx: TransitionContext<'_>,
) -> AdmissionsResult<()> {
    let from = applicant.status;
    let next = from.transition(to)?;

    let mut updated = applicant.clone();
    updated.status = next;
    updated.updated_at = ctx.at;
    match next {
        ApplicantStatus::Rejected => {
            if updated.rejection_date.is_none() {
                updated.rejection_date = Some(ctx.at);
            }
        }
        ApplicantStatus::Enrolled => updated.temporary = false,
        _ => {}
    }

    tx.update_applicant(&updated)?;
    tx.append_audit(&AuditEntry {
        id: AuditEntryId::generate(),
        applicant_id: updated.id.clone(),
        action: ctx.action,
        from_status: Some(from),
        to_status: next,
        actor: ctx.actor.clone(),
        reason: ctx.reason.map(str::to_string),
        recorded_at: ctx.at,
    })?;

    *applicant = updated;
    Ok(())
}

/// Everything known about one applicant, read from a single snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicantOverview {
    pub applicant: Applicant,
    pub ticket: Option<ExamTicket>,
    pub waitlist_entry: Option<WaitlistEntry>,
    pub application: Option<EnrollmentApplication>,
    pub documents: Vec<DocumentRecord>,
    pub student: Option<Student>,
}

/// Read side of the applicant registry.
pub struct ApplicantRegistry<S> {
    store: Arc<S>,
}

impl<S> ApplicantRegistry<S>
where
    S: AdmissionsStore + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn overview(&self, id: &ApplicantId) -> AdmissionsResult<ApplicantOverview> {
        self.store.read(|tx| {
            let applicant = load(tx, id)?;
            let ticket = tx.ticket_for_applicant(id)?;
            let waitlist_entry = match &ticket {
                Some(ticket) => tx.waitlist_entry_for_ticket(&ticket.id)?,
                None => None,
            };
            let application = tx.application_for_applicant(id)?;
            let documents = match &application {
                Some(application) => tx.documents_for_application(&application.id)?,
                None => Vec::new(),
            };
            let student = tx.student_for_applicant(id)?;

            Ok::<_, AdmissionsError>(ApplicantOverview {
                applicant,
                ticket,
                waitlist_entry,
                application,
                documents,
                student,
            })
        })
    }

    pub fn audit_trail(&self, id: &ApplicantId) -> AdmissionsResult<Vec<AuditEntry>> {
        self.store.read(|tx| {
            load(tx, id)?;
            Ok::<_, AdmissionsError>(tx.audit_for_applicant(id)?)
        })
    }

    pub fn applicant(&self, id: &ApplicantId) -> AdmissionsResult<Applicant> {
        self.store.read(|tx| load(tx, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::admissions::store::MemoryStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 3, 9, 0, 0).unwrap()
    }

    fn seeded(store: &MemoryStore) -> Applicant {
        let applicant = Applicant {
            id: ApplicantId::from("apl-1"),
            full_name: "Carla Gómez".to_string(),
            email: "carla@example.com".to_string(),
            national_id: "GOMC050312MDFRRL09".to_string(),
            phone: None,
            status: ApplicantStatus::UnderReview,
            temporary: true,
            rejection_date: None,
            created_at: now(),
            updated_at: now(),
        };
        store
            .transaction(|tx| register(tx, &applicant, &ActorId::system()))
            .expect("register");
        applicant
    }

    #[test]
    fn normalizes_identity_fields() {
        let data = ApplicantData {
            full_name: "  Carla   Gómez ".to_string(),
            email: " Carla@Example.COM ".to_string(),
            national_id: "gomc050312mdfrrl09".to_string(),
            phone: Some(" 55 1234 5678 ".to_string()),
        }
        .normalized()
        .expect("valid data");

        assert_eq!(data.full_name, "Carla Gómez");
        assert_eq!(data.email, "carla@example.com");
        assert_eq!(data.national_id, "GOMC050312MDFRRL09");
        assert_eq!(data.phone.as_deref(), Some("55 1234 5678"));
    }

    #[test]
    fn rejects_malformed_identity_fields() {
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("a@b").is_err());
        assert!(normalize_national_id("SHORT").is_err());
        assert!(normalize_national_id("GOMC050312MDFRRL0!").is_err());
        assert!(normalize_name("   ").is_err());
        assert!(normalize_phone("call me").is_err());
    }

    #[test]
    fn transition_writes_status_and_audit_entry() {
        let store = MemoryStore::new();
        let mut applicant = seeded(&store);
        let admin = ActorId("admin-7".to_string());

        store
            .transaction(|tx| {
                transition(
                    tx,
                    &mut applicant,
                    ApplicantStatus::Rejected,
                    TransitionContext {
                        action: AuditAction::WaitlistRejected,
                        actor: &admin,
                        reason: Some("failed interview"),
                        at: now(),
                    },
                )
            })
            .expect("legal transition");

        assert_eq!(applicant.status, ApplicantStatus::Rejected);
        assert_eq!(applicant.rejection_date, Some(now()));

        let trail = ApplicantRegistry::new(Arc::new(store))
            .audit_trail(&applicant.id)
            .expect("trail");
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].from_status, None);
        assert_eq!(trail[1].from_status, Some(ApplicantStatus::UnderReview));
        assert_eq!(trail[1].to_status, ApplicantStatus::Rejected);
        assert_eq!(trail[1].reason.as_deref(), Some("failed interview"));
    }

    #[test]
    fn illegal_transition_leaves_applicant_untouched() {
        let store = MemoryStore::new();
        let mut applicant = seeded(&store);
        let before = applicant.clone();

        let err = store
            .transaction(|tx| {
                transition(
                    tx,
                    &mut applicant,
                    ApplicantStatus::Enrolled,
                    TransitionContext {
                        action: AuditAction::PaymentConfirmed,
                        actor: &ActorId::system(),
                        reason: None,
                        at: now(),
                    },
                )
            })
            .expect_err("under_review cannot enroll");

        assert!(matches!(err, AdmissionsError::InvalidTransition(_)));
        assert_eq!(applicant, before);
        let stored = store.read(|tx| load(tx, &before.id)).expect("stored");
        assert_eq!(stored, before);
    }
}
