//! Transactional persistence for the admissions lifecycle.
//!
//! Every multi-entity write runs inside [`AdmissionsStore::transaction`]: the closure sees a
//! private view of the store and its effects become visible to other readers all at once, or
//! not at all.

mod memory;
mod sqlite;

pub use memory::{FaultPoint, MemoryStore};
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use super::domain::{
    Applicant, ApplicantId, ApplicationId, AuditEntry, DocumentRecord, EnrollmentApplication,
    ExamTicket, PaymentRecord, Student, TicketId, WaitlistEntry, WaitlistEntryId, WaitlistStatus,
};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("record not found: {0}")]
    Missing(String),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("injected fault at {0:?}")]
    Injected(FaultPoint),
}

/// Operations available inside a transaction.
pub trait StoreTx {
    fn applicant(&self, id: &ApplicantId) -> StoreResult<Option<Applicant>>;
    fn applicant_by_email(&self, email: &str) -> StoreResult<Option<Applicant>>;
    fn applicant_by_national_id(&self, national_id: &str) -> StoreResult<Option<Applicant>>;
    /// Rejected applicants whose `rejection_date` is at or before `cutoff`, oldest first.
    fn rejected_applicants_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<ApplicantId>>;
    fn insert_applicant(&mut self, applicant: &Applicant) -> StoreResult<()>;
    fn update_applicant(&mut self, applicant: &Applicant) -> StoreResult<()>;
    fn delete_applicant(&mut self, id: &ApplicantId) -> StoreResult<usize>;

    fn ticket(&self, id: &TicketId) -> StoreResult<Option<ExamTicket>>;
    fn ticket_for_applicant(&self, applicant_id: &ApplicantId) -> StoreResult<Option<ExamTicket>>;
    fn ticket_by_email(&self, email: &str) -> StoreResult<Option<ExamTicket>>;
    fn ticket_by_national_id(&self, national_id: &str) -> StoreResult<Option<ExamTicket>>;
    /// Highest folio starting with `prefix`, compared lexicographically.
    fn max_folio(&self, prefix: &str) -> StoreResult<Option<String>>;
    fn insert_ticket(&mut self, ticket: &ExamTicket) -> StoreResult<()>;
    fn update_ticket(&mut self, ticket: &ExamTicket) -> StoreResult<()>;
    fn delete_tickets_for_applicant(&mut self, applicant_id: &ApplicantId) -> StoreResult<usize>;

    fn waitlist_entry(&self, id: &WaitlistEntryId) -> StoreResult<Option<WaitlistEntry>>;
    fn waitlist_entry_for_ticket(&self, ticket_id: &TicketId)
        -> StoreResult<Option<WaitlistEntry>>;
    /// Entries ordered by position, optionally filtered by status.
    fn waitlist(&self, status: Option<WaitlistStatus>) -> StoreResult<Vec<WaitlistEntry>>;
    fn max_waitlist_position(&self) -> StoreResult<Option<u32>>;
    fn insert_waitlist_entry(&mut self, entry: &WaitlistEntry) -> StoreResult<()>;
    fn update_waitlist_entry(&mut self, entry: &WaitlistEntry) -> StoreResult<()>;
    fn delete_waitlist_for_applicant(&mut self, applicant_id: &ApplicantId) -> StoreResult<usize>;

    fn application(&self, id: &ApplicationId) -> StoreResult<Option<EnrollmentApplication>>;
    fn application_for_applicant(
        &self,
        applicant_id: &ApplicantId,
    ) -> StoreResult<Option<EnrollmentApplication>>;
    fn insert_application(&mut self, application: &EnrollmentApplication) -> StoreResult<()>;
    fn update_application(&mut self, application: &EnrollmentApplication) -> StoreResult<()>;
    fn delete_applications_for_applicant(
        &mut self,
        applicant_id: &ApplicantId,
    ) -> StoreResult<usize>;

    fn documents_for_application(
        &self,
        application_id: &ApplicationId,
    ) -> StoreResult<Vec<DocumentRecord>>;
    fn insert_document(&mut self, document: &DocumentRecord) -> StoreResult<()>;
    /// Deletes every document attached to the applicant's applications and returns them.
    fn delete_documents_for_applicant(
        &mut self,
        applicant_id: &ApplicantId,
    ) -> StoreResult<Vec<DocumentRecord>>;

    fn student_for_applicant(&self, applicant_id: &ApplicantId) -> StoreResult<Option<Student>>;
    fn student_by_national_id(&self, national_id: &str) -> StoreResult<Option<Student>>;
    fn max_control_number(&self, prefix: &str) -> StoreResult<Option<String>>;
    fn insert_student(&mut self, student: &Student) -> StoreResult<()>;

    fn payment_by_session(&self, session_id: &str) -> StoreResult<Option<PaymentRecord>>;
    /// Ledger entries for an application, oldest first.
    fn payments_for_application(
        &self,
        application_id: &ApplicationId,
    ) -> StoreResult<Vec<PaymentRecord>>;
    fn insert_payment(&mut self, payment: &PaymentRecord) -> StoreResult<()>;
    fn delete_payments_for_applicant(&mut self, applicant_id: &ApplicantId) -> StoreResult<usize>;

    /// Audit trail for an applicant, oldest first.
    fn audit_for_applicant(&self, applicant_id: &ApplicantId) -> StoreResult<Vec<AuditEntry>>;
    fn append_audit(&mut self, entry: &AuditEntry) -> StoreResult<()>;
    fn delete_audit_for_applicant(&mut self, applicant_id: &ApplicantId) -> StoreResult<usize>;

    /// Last value handed out for a sequence scope, if any.
    fn sequence_high_water(&self, scope: &str) -> StoreResult<Option<u32>>;
    fn set_sequence_high_water(&mut self, scope: &str, value: u32) -> StoreResult<()>;
}

/// Backing transactional store.
pub trait AdmissionsStore: Send + Sync {
    /// Runs `work` atomically. Effects are committed only when it returns `Ok`.
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T, E>,
        E: From<StoreError>;

    /// Runs `work` against a consistent snapshot without writing.
    fn read<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn StoreTx) -> Result<T, E>,
        E: From<StoreError>;
}

/// Runs synchronous store work on tokio's blocking pool. SQLite writers can wait on the
/// database lock for up to the busy timeout.
pub async fn run_blocking<T, E, F>(work: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await.unwrap_or_else(|err| {
        Err(StoreError::Unavailable(format!("store task did not complete: {err}")).into())
    })
}

/// Row counts per table, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub applicants: usize,
    pub tickets: usize,
    pub waitlist_entries: usize,
    pub applications: usize,
    pub documents: usize,
    pub students: usize,
    pub payments: usize,
    pub audit_entries: usize,
}
