use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::{AdmissionsStore, StoreCounts, StoreError, StoreResult, StoreTx};
use crate::workflows::admissions::domain::{
    Applicant, ApplicantId, ApplicantStatus, ApplicationId, AuditEntry, DocumentId, DocumentRecord,
    EnrollmentApplication, ExamTicket, PaymentRecord, PaymentRecordId, Student, StudentId,
    TicketId, WaitlistEntry, WaitlistEntryId, WaitlistStatus,
};

/// Operations that can be made to fail once, to exercise rollback paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    InsertTicket,
    InsertWaitlistEntry,
    UpdateApplication,
    InsertStudent,
    InsertPayment,
    DeleteApplicant,
}

#[derive(Debug, Default, Clone)]
struct StoreState {
    applicants: BTreeMap<ApplicantId, Applicant>,
    tickets: BTreeMap<TicketId, ExamTicket>,
    waitlist: BTreeMap<WaitlistEntryId, WaitlistEntry>,
    applications: BTreeMap<ApplicationId, EnrollmentApplication>,
    documents: BTreeMap<DocumentId, DocumentRecord>,
    students: BTreeMap<StudentId, Student>,
    payments: BTreeMap<PaymentRecordId, PaymentRecord>,
    audit: Vec<AuditEntry>,
    sequences: BTreeMap<String, u32>,
}

/// In-process store. Each transaction works on a private copy that replaces the shared state on
/// commit, so the mutex gives serializable isolation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    faults: Mutex<Vec<FaultPoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next operation hitting `point` fails with [`StoreError::Injected`].
    pub fn inject_fault(&self, point: FaultPoint) {
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(point);
    }

    pub fn counts(&self) -> StoreCounts {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        StoreCounts {
            applicants: state.applicants.len(),
            tickets: state.tickets.len(),
            waitlist_entries: state.waitlist.len(),
            applications: state.applications.len(),
            documents: state.documents.len(),
            students: state.students.len(),
            payments: state.payments.len(),
            audit_entries: state.audit.len(),
        }
    }
}

impl AdmissionsStore for MemoryStore {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store mutex poisoned".to_string()))?;

        let mut working = guard.clone();
        let result = {
            let mut tx = MemoryTx {
                state: &mut working,
                faults: &self.faults,
            };
            work(&mut tx)
        };

        if result.is_ok() {
            *guard = working;
        }
        result
    }

    fn read<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn StoreTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store mutex poisoned".to_string()))?;
        let tx = MemoryTx {
            state: &mut *guard,
            faults: &self.faults,
        };
        work(&tx)
    }
}

struct MemoryTx<'a> {
    state: &'a mut StoreState,
    faults: &'a Mutex<Vec<FaultPoint>>,
}

impl MemoryTx<'_> {
    fn check_fault(&self, point: FaultPoint) -> StoreResult<()> {
        let mut faults = self
            .faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(index) = faults.iter().position(|fault| *fault == point) {
            faults.remove(index);
            return Err(StoreError::Injected(point));
        }
        Ok(())
    }

    fn application_ids_for(&self, applicant_id: &ApplicantId) -> Vec<ApplicationId> {
        self.state
            .applications
            .values()
            .filter(|application| &application.applicant_id == applicant_id)
            .map(|application| application.id.clone())
            .collect()
    }

    fn ticket_ids_for(&self, applicant_id: &ApplicantId) -> Vec<TicketId> {
        self.state
            .tickets
            .values()
            .filter(|ticket| ticket.applicant_id.as_ref() == Some(applicant_id))
            .map(|ticket| ticket.id.clone())
            .collect()
    }
}

impl StoreTx for MemoryTx<'_> {
    fn applicant(&self, id: &ApplicantId) -> StoreResult<Option<Applicant>> {
        Ok(self.state.applicants.get(id).cloned())
    }

    fn applicant_by_email(&self, email: &str) -> StoreResult<Option<Applicant>> {
        Ok(self
            .state
            .applicants
            .values()
            .find(|applicant| applicant.email == email)
            .cloned())
    }

    fn applicant_by_national_id(&self, national_id: &str) -> StoreResult<Option<Applicant>> {
        Ok(self
            .state
            .applicants
            .values()
            .find(|applicant| applicant.national_id == national_id)
            .cloned())
    }

    fn rejected_applicants_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<ApplicantId>> {
        let mut rejected: Vec<_> = self
            .state
            .applicants
            .values()
            .filter(|applicant| applicant.status == ApplicantStatus::Rejected)
            .filter_map(|applicant| {
                applicant
                    .rejection_date
                    .filter(|rejected_at| *rejected_at <= cutoff)
                    .map(|rejected_at| (rejected_at, applicant.id.clone()))
            })
            .collect();
        rejected.sort();
        Ok(rejected.into_iter().map(|(_, id)| id).collect())
    }

    fn insert_applicant(&mut self, applicant: &Applicant) -> StoreResult<()> {
        if self.state.applicants.contains_key(&applicant.id) {
            return Err(StoreError::Conflict(format!("applicant {}", applicant.id)));
        }
        if self.applicant_by_email(&applicant.email)?.is_some() {
            return Err(StoreError::Conflict("applicant email".to_string()));
        }
        if self.applicant_by_national_id(&applicant.national_id)?.is_some() {
            return Err(StoreError::Conflict("applicant national id".to_string()));
        }
        self.state
            .applicants
            .insert(applicant.id.clone(), applicant.clone());
        Ok(())
    }

    fn update_applicant(&mut self, applicant: &Applicant) -> StoreResult<()> {
        match self.state.applicants.get_mut(&applicant.id) {
            Some(existing) => {
                *existing = applicant.clone();
                Ok(())
            }
            None => Err(StoreError::Missing(format!("applicant {}", applicant.id))),
        }
    }

    fn delete_applicant(&mut self, id: &ApplicantId) -> StoreResult<usize> {
        self.check_fault(FaultPoint::DeleteApplicant)?;
        let referenced = !self.ticket_ids_for(id).is_empty()
            || !self.application_ids_for(id).is_empty()
            || self.state.audit.iter().any(|entry| &entry.applicant_id == id);
        if referenced {
            return Err(StoreError::Conflict(format!(
                "applicant {id} is still referenced"
            )));
        }
        Ok(usize::from(self.state.applicants.remove(id).is_some()))
    }

    fn ticket(&self, id: &TicketId) -> StoreResult<Option<ExamTicket>> {
        Ok(self.state.tickets.get(id).cloned())
    }

    fn ticket_for_applicant(&self, applicant_id: &ApplicantId) -> StoreResult<Option<ExamTicket>> {
        Ok(self
            .state
            .tickets
            .values()
            .find(|ticket| ticket.applicant_id.as_ref() == Some(applicant_id))
            .cloned())
    }

    fn ticket_by_email(&self, email: &str) -> StoreResult<Option<ExamTicket>> {
        Ok(self
            .state
            .tickets
            .values()
            .find(|ticket| ticket.email == email)
            .cloned())
    }

    fn ticket_by_national_id(&self, national_id: &str) -> StoreResult<Option<ExamTicket>> {
        Ok(self
            .state
            .tickets
            .values()
            .find(|ticket| ticket.national_id == national_id)
            .cloned())
    }

    fn max_folio(&self, prefix: &str) -> StoreResult<Option<String>> {
        Ok(self
            .state
            .tickets
            .values()
            .map(|ticket| &ticket.folio)
            .filter(|folio| folio.starts_with(prefix))
            .max()
            .cloned())
    }

    fn insert_ticket(&mut self, ticket: &ExamTicket) -> StoreResult<()> {
        self.check_fault(FaultPoint::InsertTicket)?;
        if self.state.tickets.contains_key(&ticket.id)
            || self
                .state
                .tickets
                .values()
                .any(|existing| existing.folio == ticket.folio)
        {
            return Err(StoreError::Conflict(format!("ticket folio {}", ticket.folio)));
        }
        if let Some(applicant_id) = &ticket.applicant_id {
            if !self.state.applicants.contains_key(applicant_id) {
                return Err(StoreError::Missing(format!("applicant {applicant_id}")));
            }
            if self.ticket_for_applicant(applicant_id)?.is_some() {
                return Err(StoreError::Conflict(format!(
                    "applicant {applicant_id} already holds a ticket"
                )));
            }
        }
        self.state.tickets.insert(ticket.id.clone(), ticket.clone());
        Ok(())
    }

    fn update_ticket(&mut self, ticket: &ExamTicket) -> StoreResult<()> {
        match self.state.tickets.get_mut(&ticket.id) {
            Some(existing) => {
                *existing = ticket.clone();
                Ok(())
            }
            None => Err(StoreError::Missing(format!("ticket {}", ticket.id))),
        }
    }

    fn delete_tickets_for_applicant(&mut self, applicant_id: &ApplicantId) -> StoreResult<usize> {
        let ticket_ids = self.ticket_ids_for(applicant_id);
        if self
            .state
            .waitlist
            .values()
            .any(|entry| ticket_ids.contains(&entry.ticket_id))
        {
            return Err(StoreError::Conflict(
                "ticket is still referenced by a waitlist entry".to_string(),
            ));
        }
        for id in &ticket_ids {
            self.state.tickets.remove(id);
        }
        Ok(ticket_ids.len())
    }

    fn waitlist_entry(&self, id: &WaitlistEntryId) -> StoreResult<Option<WaitlistEntry>> {
        Ok(self.state.waitlist.get(id).cloned())
    }

    fn waitlist_entry_for_ticket(
        &self,
        ticket_id: &TicketId,
    ) -> StoreResult<Option<WaitlistEntry>> {
        Ok(self
            .state
            .waitlist
            .values()
            .find(|entry| &entry.ticket_id == ticket_id)
            .cloned())
    }

    fn waitlist(&self, status: Option<WaitlistStatus>) -> StoreResult<Vec<WaitlistEntry>> {
        let mut entries: Vec<_> = self
            .state
            .waitlist
            .values()
            .filter(|entry| status.map_or(true, |status| entry.status == status))
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.position);
        Ok(entries)
    }

    fn max_waitlist_position(&self) -> StoreResult<Option<u32>> {
        Ok(self.state.waitlist.values().map(|entry| entry.position).max())
    }

    fn insert_waitlist_entry(&mut self, entry: &WaitlistEntry) -> StoreResult<()> {
        self.check_fault(FaultPoint::InsertWaitlistEntry)?;
        if !self.state.tickets.contains_key(&entry.ticket_id) {
            return Err(StoreError::Missing(format!("ticket {}", entry.ticket_id)));
        }
        if self.state.waitlist.values().any(|existing| {
            existing.ticket_id == entry.ticket_id || existing.position == entry.position
        }) {
            return Err(StoreError::Conflict(format!(
                "waitlist position {}",
                entry.position
            )));
        }
        self.state.waitlist.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    fn update_waitlist_entry(&mut self, entry: &WaitlistEntry) -> StoreResult<()> {
        match self.state.waitlist.get_mut(&entry.id) {
            Some(existing) => {
                *existing = entry.clone();
                Ok(())
            }
            None => Err(StoreError::Missing(format!("waitlist entry {}", entry.id))),
        }
    }

    fn delete_waitlist_for_applicant(&mut self, applicant_id: &ApplicantId) -> StoreResult<usize> {
        let ticket_ids = self.ticket_ids_for(applicant_id);
        let before = self.state.waitlist.len();
        self.state
            .waitlist
            .retain(|_, entry| !ticket_ids.contains(&entry.ticket_id));
        Ok(before - self.state.waitlist.len())
    }

    fn application(&self, id: &ApplicationId) -> StoreResult<Option<EnrollmentApplication>> {
        Ok(self.state.applications.get(id).cloned())
    }

    fn application_for_applicant(
        &self,
        applicant_id: &ApplicantId,
    ) -> StoreResult<Option<EnrollmentApplication>> {
        Ok(self
            .state
            .applications
            .values()
            .find(|application| &application.applicant_id == applicant_id)
            .cloned())
    }

    fn insert_application(&mut self, application: &EnrollmentApplication) -> StoreResult<()> {
        if !self.state.applicants.contains_key(&application.applicant_id) {
            return Err(StoreError::Missing(format!(
                "applicant {}",
                application.applicant_id
            )));
        }
        if self
            .application_for_applicant(&application.applicant_id)?
            .is_some()
        {
            return Err(StoreError::Conflict(format!(
                "application for applicant {}",
                application.applicant_id
            )));
        }
        self.state
            .applications
            .insert(application.id.clone(), application.clone());
        Ok(())
    }

    fn update_application(&mut self, application: &EnrollmentApplication) -> StoreResult<()> {
        self.check_fault(FaultPoint::UpdateApplication)?;
        match self.state.applications.get_mut(&application.id) {
            Some(existing) => {
                *existing = application.clone();
                Ok(())
            }
            None => Err(StoreError::Missing(format!(
                "application {}",
                application.id
            ))),
        }
    }

    fn delete_applications_for_applicant(
        &mut self,
        applicant_id: &ApplicantId,
    ) -> StoreResult<usize> {
        let application_ids = self.application_ids_for(applicant_id);
        let referenced = self
            .state
            .documents
            .values()
            .any(|document| application_ids.contains(&document.application_id))
            || self
                .state
                .payments
                .values()
                .any(|payment| application_ids.contains(&payment.application_id));
        if referenced {
            return Err(StoreError::Conflict(
                "application is still referenced by documents or payments".to_string(),
            ));
        }
        for id in &application_ids {
            self.state.applications.remove(id);
        }
        Ok(application_ids.len())
    }

    fn documents_for_application(
        &self,
        application_id: &ApplicationId,
    ) -> StoreResult<Vec<DocumentRecord>> {
        Ok(self
            .state
            .documents
            .values()
            .filter(|document| &document.application_id == application_id)
            .cloned()
            .collect())
    }

    fn insert_document(&mut self, document: &DocumentRecord) -> StoreResult<()> {
        if !self
            .state
            .applications
            .contains_key(&document.application_id)
        {
            return Err(StoreError::Missing(format!(
                "application {}",
                document.application_id
            )));
        }
        self.state
            .documents
            .insert(document.id.clone(), document.clone());
        Ok(())
    }

    fn delete_documents_for_applicant(
        &mut self,
        applicant_id: &ApplicantId,
    ) -> StoreResult<Vec<DocumentRecord>> {
        let application_ids = self.application_ids_for(applicant_id);
        let doomed: Vec<DocumentId> = self
            .state
            .documents
            .values()
            .filter(|document| application_ids.contains(&document.application_id))
            .map(|document| document.id.clone())
            .collect();
        Ok(doomed
            .iter()
            .filter_map(|id| self.state.documents.remove(id))
            .collect())
    }

    fn student_for_applicant(&self, applicant_id: &ApplicantId) -> StoreResult<Option<Student>> {
        Ok(self
            .state
            .students
            .values()
            .find(|student| &student.applicant_id == applicant_id)
            .cloned())
    }

    fn student_by_national_id(&self, national_id: &str) -> StoreResult<Option<Student>> {
        Ok(self
            .state
            .students
            .values()
            .find(|student| student.national_id == national_id)
            .cloned())
    }

    fn max_control_number(&self, prefix: &str) -> StoreResult<Option<String>> {
        Ok(self
            .state
            .students
            .values()
            .map(|student| &student.control_number)
            .filter(|number| number.starts_with(prefix))
            .max()
            .cloned())
    }

    fn insert_student(&mut self, student: &Student) -> StoreResult<()> {
        self.check_fault(FaultPoint::InsertStudent)?;
        if self
            .state
            .students
            .values()
            .any(|existing| existing.control_number == student.control_number)
        {
            return Err(StoreError::Conflict(format!(
                "control number {}",
                student.control_number
            )));
        }
        self.state
            .students
            .insert(student.id.clone(), student.clone());
        Ok(())
    }

    fn payment_by_session(&self, session_id: &str) -> StoreResult<Option<PaymentRecord>> {
        Ok(self
            .state
            .payments
            .values()
            .find(|payment| payment.session_id == session_id)
            .cloned())
    }

    fn payments_for_application(
        &self,
        application_id: &ApplicationId,
    ) -> StoreResult<Vec<PaymentRecord>> {
        let mut payments: Vec<_> = self
            .state
            .payments
            .values()
            .filter(|payment| &payment.application_id == application_id)
            .cloned()
            .collect();
        payments.sort_by_key(|payment| payment.paid_at);
        Ok(payments)
    }

    fn insert_payment(&mut self, payment: &PaymentRecord) -> StoreResult<()> {
        self.check_fault(FaultPoint::InsertPayment)?;
        if self.payment_by_session(&payment.session_id)?.is_some() {
            return Err(StoreError::Conflict(format!(
                "payment for session {}",
                payment.session_id
            )));
        }
        if !self
            .state
            .applications
            .contains_key(&payment.application_id)
        {
            return Err(StoreError::Missing(format!(
                "application {}",
                payment.application_id
            )));
        }
        self.state
            .payments
            .insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    fn delete_payments_for_applicant(&mut self, applicant_id: &ApplicantId) -> StoreResult<usize> {
        let application_ids = self.application_ids_for(applicant_id);
        let before = self.state.payments.len();
        self.state
            .payments
            .retain(|_, payment| !application_ids.contains(&payment.application_id));
        Ok(before - self.state.payments.len())
    }

    fn audit_for_applicant(&self, applicant_id: &ApplicantId) -> StoreResult<Vec<AuditEntry>> {
        Ok(self
            .state
            .audit
            .iter()
            .filter(|entry| &entry.applicant_id == applicant_id)
            .cloned()
            .collect())
    }

    fn append_audit(&mut self, entry: &AuditEntry) -> StoreResult<()> {
        if !self.state.applicants.contains_key(&entry.applicant_id) {
            return Err(StoreError::Missing(format!(
                "applicant {}",
                entry.applicant_id
            )));
        }
        self.state.audit.push(entry.clone());
        Ok(())
    }

    fn delete_audit_for_applicant(&mut self, applicant_id: &ApplicantId) -> StoreResult<usize> {
        let before = self.state.audit.len();
        self.state
            .audit
            .retain(|entry| &entry.applicant_id != applicant_id);
        Ok(before - self.state.audit.len())
    }

    fn sequence_high_water(&self, scope: &str) -> StoreResult<Option<u32>> {
        Ok(self.state.sequences.get(scope).copied())
    }

    fn set_sequence_high_water(&mut self, scope: &str, value: u32) -> StoreResult<()> {
        self.state.sequences.insert(scope.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn applicant(id: &str, email: &str) -> Applicant {
        let now = Utc.with_ymd_and_hms(2025, 11, 3, 9, 0, 0).unwrap();
        Applicant {
            id: ApplicantId::from(id),
            full_name: "Carla Gómez".to_string(),
            email: email.to_string(),
            national_id: format!("NID{id}"),
            phone: None,
            status: ApplicantStatus::UnderReview,
            temporary: true,
            rejection_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn failed_transaction_leaves_state_untouched() {
        let store = MemoryStore::new();
        let result: Result<(), StoreError> = store.transaction(|tx| {
            tx.insert_applicant(&applicant("a1", "a1@example.com"))?;
            Err(StoreError::Unavailable("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.counts().applicants, 0);
    }

    #[test]
    fn committed_transaction_is_visible_to_readers() {
        let store = MemoryStore::new();
        store
            .transaction(|tx| tx.insert_applicant(&applicant("a1", "a1@example.com")))
            .expect("insert commits");

        let found: Option<Applicant> = store
            .read(|tx| tx.applicant_by_email("a1@example.com"))
            .expect("read succeeds");
        assert_eq!(found.map(|a| a.id), Some(ApplicantId::from("a1")));
    }

    #[test]
    fn duplicate_email_is_a_conflict() {
        let store = MemoryStore::new();
        store
            .transaction(|tx| tx.insert_applicant(&applicant("a1", "same@example.com")))
            .expect("first insert");
        let err = store
            .transaction(|tx| tx.insert_applicant(&applicant("a2", "same@example.com")))
            .expect_err("second insert conflicts");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn injected_fault_fires_once() {
        let store = MemoryStore::new();
        store.inject_fault(FaultPoint::DeleteApplicant);
        store
            .transaction(|tx| tx.insert_applicant(&applicant("a1", "a1@example.com")))
            .expect("insert");

        let first = store.transaction(|tx| tx.delete_applicant(&ApplicantId::from("a1")));
        assert!(matches!(
            first,
            Err(StoreError::Injected(FaultPoint::DeleteApplicant))
        ));
        let second = store
            .transaction(|tx| tx.delete_applicant(&ApplicantId::from("a1")))
            .expect("fault consumed");
        assert_eq!(second, 1);
    }

    #[test]
    fn applicant_with_audit_trail_cannot_be_deleted_first() {
        let store = MemoryStore::new();
        let record = applicant("a1", "a1@example.com");
        store
            .transaction(|tx| {
                tx.insert_applicant(&record)?;
                tx.append_audit(&AuditEntry {
                    id: crate::workflows::admissions::domain::AuditEntryId::from("aud-1"),
                    applicant_id: record.id.clone(),
                    action: crate::workflows::admissions::domain::AuditAction::Registered,
                    from_status: None,
                    to_status: ApplicantStatus::UnderReview,
                    actor: crate::workflows::admissions::domain::ActorId::system(),
                    reason: None,
                    recorded_at: record.created_at,
                })
            })
            .expect("seed");

        let err = store
            .transaction(|tx| tx.delete_applicant(&record.id))
            .expect_err("restricted");
        assert!(matches!(err, StoreError::Conflict(_)));
    }
}
