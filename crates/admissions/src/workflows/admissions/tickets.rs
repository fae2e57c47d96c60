use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::clock::Clock;
use super::domain::{
    ActorId, Applicant, ApplicantId, ApplicantStatus, ExamTicket, ExamTicketStatus, TicketId,
    WaitlistEntry, WaitlistEntryId, WaitlistStatus,
};
use super::error::{AdmissionsError, AdmissionsResult};
use super::registry::{self, ApplicantData};
use super::sequence;
use super::store::{AdmissionsStore, StoreTx};

pub const MAX_SCORE: u8 = 100;

/// Result of a successful ticket issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketIssued {
    pub ticket_id: TicketId,
    pub folio: String,
    pub applicant_id: ApplicantId,
    pub waitlist_entry_id: WaitlistEntryId,
    pub position: u32,
}

/// Exam session assignment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExamSchedule {
    pub exam_date: DateTime<Utc>,
    pub venue: String,
}

/// Outcome reported by the examination board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ExamResult {
    pub score: u8,
    pub passed: bool,
}

/// Issues exam tickets and records their outcomes.
pub struct ExamTicketService<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> ExamTicketService<S>
where
    S: AdmissionsStore + 'static,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Creates the applicant account, its ticket, and its waitlist entry in one transaction.
    pub fn issue_ticket(
        &self,
        data: ApplicantData,
        career_id: &str,
    ) -> AdmissionsResult<TicketIssued> {
        let data = data.normalized()?;
        let career_id = career_id.trim();
        if career_id.is_empty() {
            return Err(AdmissionsError::validation("career id is required"));
        }

        self.store.read(|tx| ensure_identity_is_free(tx, &data))?;

        let issued = self.store.transaction(|tx| {
            ensure_identity_is_free(tx, &data)?;

            let now = self.clock.now();
            let folio = sequence::next_folio(tx, now.year())?;

            let applicant = Applicant {
                id: ApplicantId::generate(),
                full_name: data.full_name.clone(),
                email: data.email.clone(),
                national_id: data.national_id.clone(),
                phone: data.phone.clone(),
                status: ApplicantStatus::UnderReview,
                temporary: true,
                rejection_date: None,
                created_at: now,
                updated_at: now,
            };
            registry::register(tx, &applicant, &ActorId::system())?;

            let ticket = ExamTicket {
                id: TicketId::generate(),
                folio,
                applicant_id: Some(applicant.id.clone()),
                career_id: career_id.to_string(),
                full_name: applicant.full_name.clone(),
                email: applicant.email.clone(),
                national_id: applicant.national_id.clone(),
                status: ExamTicketStatus::Pending,
                score: None,
                passed: None,
                exam_date: None,
                venue: None,
                created_at: now,
                updated_at: now,
            };
            tx.insert_ticket(&ticket)?;

            let position = sequence::next_waitlist_position(tx)?;
            let entry = WaitlistEntry {
                id: WaitlistEntryId::generate(),
                ticket_id: ticket.id.clone(),
                position,
                status: WaitlistStatus::Waiting,
                decision_reason: None,
                decided_at: None,
                created_at: now,
                updated_at: now,
            };
            tx.insert_waitlist_entry(&entry)?;

            Ok::<_, AdmissionsError>(TicketIssued {
                ticket_id: ticket.id,
                folio: ticket.folio,
                applicant_id: applicant.id,
                waitlist_entry_id: entry.id,
                position,
            })
        })?;

        info!(
            folio = %issued.folio,
            applicant_id = %issued.applicant_id,
            position = issued.position,
            "exam ticket issued"
        );
        Ok(issued)
    }

    pub fn schedule_exam(
        &self,
        ticket_id: &TicketId,
        schedule: ExamSchedule,
    ) -> AdmissionsResult<ExamTicket> {
        let venue = schedule.venue.trim().to_string();
        if venue.is_empty() {
            return Err(AdmissionsError::validation("exam venue is required"));
        }

        let ticket = self.store.transaction(|tx| {
            let mut ticket = load_ticket(tx, ticket_id)?;
            ensure_applicant_active(tx, &ticket)?;
            ticket.status = ticket.status.transition(ExamTicketStatus::Scheduled)?;
            ticket.exam_date = Some(schedule.exam_date);
            ticket.venue = Some(venue.clone());
            ticket.updated_at = self.clock.now();
            tx.update_ticket(&ticket)?;
            Ok::<_, AdmissionsError>(ticket)
        })?;

        info!(folio = %ticket.folio, venue = %venue, "exam scheduled");
        Ok(ticket)
    }

    pub fn mark_taken(&self, ticket_id: &TicketId) -> AdmissionsResult<ExamTicket> {
        let ticket = self.store.transaction(|tx| {
            let mut ticket = load_ticket(tx, ticket_id)?;
            ensure_applicant_active(tx, &ticket)?;
            ticket.status = ticket.status.transition(ExamTicketStatus::Taken)?;
            ticket.updated_at = self.clock.now();
            tx.update_ticket(&ticket)?;
            Ok::<_, AdmissionsError>(ticket)
        })?;

        info!(folio = %ticket.folio, "exam marked as taken");
        Ok(ticket)
    }

    /// Records the exam outcome on the ticket.
    ///
    /// A failed exam only marks the ticket; the waitlist entry and applicant stay as they are
    /// until an administrator rejects the entry.
    pub fn record_exam_result(
        &self,
        ticket_id: &TicketId,
        result: ExamResult,
    ) -> AdmissionsResult<ExamTicket> {
        if result.score > MAX_SCORE {
            return Err(AdmissionsError::validation(format!(
                "score must be between 0 and {MAX_SCORE}"
            )));
        }

        let ticket = self.store.transaction(|tx| {
            let now = self.clock.now();
            let mut ticket = load_ticket(tx, ticket_id)?;
            ensure_applicant_active(tx, &ticket)?;

            let target = if result.passed {
                ExamTicketStatus::Approved
            } else {
                ExamTicketStatus::Rejected
            };
            ticket.status = ticket.status.transition(target)?;
            ticket.score = Some(result.score);
            ticket.passed = Some(result.passed);
            ticket.updated_at = now;
            tx.update_ticket(&ticket)?;

            if result.passed {
                if let Some(mut entry) = tx.waitlist_entry_for_ticket(&ticket.id)? {
                    if entry.status == WaitlistStatus::Waiting {
                        entry.updated_at = now;
                        tx.update_waitlist_entry(&entry)?;
                    }
                }
            }
            Ok::<_, AdmissionsError>(ticket)
        })?;

        info!(
            folio = %ticket.folio,
            score = result.score,
            passed = result.passed,
            "exam result recorded"
        );
        Ok(ticket)
    }

    pub fn ticket(&self, ticket_id: &TicketId) -> AdmissionsResult<ExamTicket> {
        self.store.read(|tx| {
            tx.ticket(ticket_id)?
                .ok_or_else(|| AdmissionsError::not_found(format!("ticket {ticket_id}")))
        })
    }
}

fn ensure_identity_is_free(tx: &dyn StoreTx, data: &ApplicantData) -> AdmissionsResult<()> {
    if tx.applicant_by_national_id(&data.national_id)?.is_some()
        || tx.ticket_by_national_id(&data.national_id)?.is_some()
    {
        return Err(AdmissionsError::Conflict(format!(
            "national id {} is already registered",
            data.national_id
        )));
    }
    if tx.applicant_by_email(&data.email)?.is_some() || tx.ticket_by_email(&data.email)?.is_some() {
        return Err(AdmissionsError::Conflict(format!(
            "email {} is already registered",
            data.email
        )));
    }
    Ok(())
}

pub(crate) fn load_ticket(tx: &dyn StoreTx, id: &TicketId) -> AdmissionsResult<ExamTicket> {
    tx.ticket(id)?
        .ok_or_else(|| AdmissionsError::not_found(format!("ticket {id}")))
}

fn ensure_applicant_active(tx: &dyn StoreTx, ticket: &ExamTicket) -> AdmissionsResult<()> {
    let Some(applicant_id) = &ticket.applicant_id else {
        return Ok(());
    };
    let applicant = registry::load(tx, applicant_id)?;
    if applicant.status.is_terminal() {
        return Err(AdmissionsError::precondition(format!(
            "applicant {} is {}",
            applicant.id,
            applicant.status.label()
        )));
    }
    Ok(())
}
