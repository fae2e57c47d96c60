use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::clock::Clock;
use super::domain::{
    ActorId, Applicant, ApplicantStatus, AuditAction, ExamTicket, ExamTicketStatus, WaitlistEntry,
    WaitlistEntryId, WaitlistStatus,
};
use super::error::{AdmissionsError, AdmissionsResult};
use super::registry::{self, TransitionContext};
use super::store::{AdmissionsStore, StoreTx};
use super::tickets::load_ticket;

/// State of the three records touched by an adjudication, after commit.
#[derive(Debug, Clone, Serialize)]
pub struct WaitlistDecision {
    pub entry: WaitlistEntry,
    pub ticket: ExamTicket,
    pub applicant: Applicant,
}

/// Decides waitlist entries.
pub struct WaitlistAdjudicator<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> WaitlistAdjudicator<S>
where
    S: AdmissionsStore + 'static,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Entries ordered by position.
    pub fn list(&self, status: Option<WaitlistStatus>) -> AdmissionsResult<Vec<WaitlistEntry>> {
        self.store
            .read(|tx| Ok::<_, AdmissionsError>(tx.waitlist(status)?))
    }

    /// Accepts an entry whose exam ticket is approved, authorizing the enrollment form.
    pub fn accept(
        &self,
        entry_id: &WaitlistEntryId,
        actor: &ActorId,
    ) -> AdmissionsResult<WaitlistDecision> {
        let decision = self.store.transaction(|tx| {
            let now = self.clock.now();
            let mut entry = load_entry(tx, entry_id)?;
            let mut ticket = load_ticket(tx, &entry.ticket_id)?;

            if ticket.status != ExamTicketStatus::Approved {
                return Err(AdmissionsError::precondition(format!(
                    "exam ticket {} is {}, not approved",
                    ticket.folio,
                    ticket.status.label()
                )));
            }
            let mut applicant = linked_applicant(tx, &ticket)?;
            if tx.student_by_national_id(&applicant.national_id)?.is_some() {
                return Err(AdmissionsError::Conflict(format!(
                    "a student with national id {} already exists",
                    applicant.national_id
                )));
            }

            entry.status = entry.status.transition(WaitlistStatus::Accepted)?;
            entry.decided_at = Some(now);
            entry.updated_at = now;
            tx.update_waitlist_entry(&entry)?;

            ticket.updated_at = now;
            tx.update_ticket(&ticket)?;

            registry::transition(
                tx,
                &mut applicant,
                ApplicantStatus::PendingForm,
                TransitionContext {
                    action: AuditAction::WaitlistAccepted,
                    actor,
                    reason: None,
                    at: now,
                },
            )?;

            Ok(WaitlistDecision {
                entry,
                ticket,
                applicant,
            })
        })?;

        info!(
            folio = %decision.ticket.folio,
            applicant_id = %decision.applicant.id,
            actor = %actor,
            "waitlist entry accepted"
        );
        Ok(decision)
    }

    /// Rejects an entry, its ticket, and its applicant. This starts the retention clock.
    pub fn reject(
        &self,
        entry_id: &WaitlistEntryId,
        reason: &str,
        actor: &ActorId,
    ) -> AdmissionsResult<WaitlistDecision> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AdmissionsError::validation("a rejection reason is required"));
        }

        let decision = self.store.transaction(|tx| {
            let now = self.clock.now();
            let mut entry = load_entry(tx, entry_id)?;
            let mut ticket = load_ticket(tx, &entry.ticket_id)?;
            let mut applicant = linked_applicant(tx, &ticket)?;

            entry.status = entry.status.transition(WaitlistStatus::Rejected)?;
            entry.decision_reason = Some(reason.to_string());
            entry.decided_at = Some(now);
            entry.updated_at = now;
            tx.update_waitlist_entry(&entry)?;

            // Administrative rejection overrides any exam outcome.
            ticket.status = ExamTicketStatus::Rejected;
            ticket.updated_at = now;
            tx.update_ticket(&ticket)?;

            registry::transition(
                tx,
                &mut applicant,
                ApplicantStatus::Rejected,
                TransitionContext {
                    action: AuditAction::WaitlistRejected,
                    actor,
                    reason: Some(reason),
                    at: now,
                },
            )?;

            Ok::<_, AdmissionsError>(WaitlistDecision {
                entry,
                ticket,
                applicant,
            })
        })?;

        info!(
            folio = %decision.ticket.folio,
            applicant_id = %decision.applicant.id,
            actor = %actor,
            reason,
            "waitlist entry rejected"
        );
        Ok(decision)
    }
}

fn load_entry(tx: &dyn StoreTx, id: &WaitlistEntryId) -> AdmissionsResult<WaitlistEntry> {
    tx.waitlist_entry(id)?
        .ok_or_else(|| AdmissionsError::not_found(format!("waitlist entry {id}")))
}

fn linked_applicant(tx: &dyn StoreTx, ticket: &ExamTicket) -> AdmissionsResult<Applicant> {
    let applicant_id = ticket.applicant_id.as_ref().ok_or_else(|| {
        AdmissionsError::precondition(format!("exam ticket {} has no applicant", ticket.folio))
    })?;
    registry::load(tx, applicant_id)
}
