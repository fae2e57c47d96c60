//! Admissions lifecycle: exam tickets, waitlist adjudication, enrollment, payment
//! reconciliation, and retention of rejected applicants.
//!
//! Every component is a small service over a shared [`AdmissionsStore`]; multi-entity changes
//! happen inside a single store transaction so no partial lifecycle step is ever visible.

pub mod clock;
pub mod documents;
pub mod domain;
pub mod enrollment;
pub mod error;
pub mod payments;
pub mod registry;
pub mod retention;
pub mod router;
pub mod sequence;
pub mod service;
pub mod store;
pub mod tickets;
pub mod waitlist;

#[cfg(test)]
mod tests;

pub use clock::{Clock, FixedClock, SystemClock};
pub use documents::{DocumentStorage, DocumentStorageError, LocalDocumentStorage};
pub use domain::{
    ActorId, Applicant, ApplicantId, ApplicantStatus, ApplicationId, AuditAction, AuditEntry,
    CheckoutSessionRef, DocumentCategory, DocumentId, DocumentRecord, EnrollmentApplication,
    ExamTicket, ExamTicketStatus, InvalidTransition, Money, PaymentRecord, PaymentRecordId,
    PaymentStatus, PersonalData, Shift, Student, StudentId, TicketId, WaitlistEntry,
    WaitlistEntryId, WaitlistStatus,
};
pub use enrollment::{DocumentUpload, EnrollmentService, EnrollmentSubmission, FeeSchedule};
pub use error::{AdmissionsError, AdmissionsResult, ErrorKind};
pub use payments::{
    PaymentGateway, PaymentService, PaymentSettings, SandboxGateway, StripeConfig, StripeGateway,
    WebhookOutcome, WebhookVerifier,
};
pub use registry::{ApplicantData, ApplicantOverview, ApplicantRegistry};
pub use retention::{
    PurgeSummary, RetentionSettings, RetentionSweeper, SweepReport, MAX_GRACE_PERIOD_DAYS,
};
pub use router::admissions_router;
pub use service::{AdmissionsService, AdmissionsSettings};
pub use store::{AdmissionsStore, FaultPoint, MemoryStore, SqliteStore, StoreError};
pub use tickets::{ExamResult, ExamSchedule, ExamTicketService, TicketIssued};
pub use waitlist::{WaitlistAdjudicator, WaitlistDecision};
