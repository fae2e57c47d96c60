use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{}"), uuid::Uuid::new_v4().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of an applicant account.
    ApplicantId,
    "apl"
);
string_id!(
    /// Identifier of an exam ticket (not the human-readable folio).
    TicketId,
    "tkt"
);
string_id!(WaitlistEntryId, "wle");
string_id!(
    /// Identifier of an enrollment application; also the opaque reference handed to the gateway.
    ApplicationId,
    "app"
);
string_id!(StudentId, "stu");
string_id!(PaymentRecordId, "pay");
string_id!(AuditEntryId, "aud");
string_id!(DocumentId, "doc");

/// Identity of whoever performed an action, as supplied by the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn system() -> Self {
        Self("system".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Amount in minor currency units (cents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Parses `1500`, `1500.5` or `1500.00` into minor units. Negative amounts are refused.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (whole, fraction) = match raw.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (raw, ""),
        };
        if whole.is_empty() || fraction.len() > 2 {
            return None;
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }

        let whole: i64 = whole.parse().ok()?;
        let fraction: i64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().ok()? * 10,
            _ => fraction.parse().ok()?,
        };
        whole.checked_mul(100)?.checked_add(fraction).map(Self)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

/// Illegal status change requested for an entity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {entity} transition from {from} to {to}")]
pub struct InvalidTransition {
    pub entity: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

/// Coarse lifecycle status of an applicant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicantStatus {
    UnderReview,
    PendingForm,
    PendingPayment,
    Enrolled,
    Rejected,
}

impl ApplicantStatus {
    pub const ALL: [ApplicantStatus; 5] = [
        ApplicantStatus::UnderReview,
        ApplicantStatus::PendingForm,
        ApplicantStatus::PendingPayment,
        ApplicantStatus::Enrolled,
        ApplicantStatus::Rejected,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            ApplicantStatus::UnderReview => "under_review",
            ApplicantStatus::PendingForm => "pending_form",
            ApplicantStatus::PendingPayment => "pending_payment",
            ApplicantStatus::Enrolled => "enrolled",
            ApplicantStatus::Rejected => "rejected",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.label() == label)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, ApplicantStatus::Enrolled | ApplicantStatus::Rejected)
    }

    /// The only legal applicant transitions. Everything else is refused.
    pub const fn can_transition_to(self, next: ApplicantStatus) -> bool {
        match (self, next) {
            (ApplicantStatus::UnderReview, ApplicantStatus::PendingForm)
            | (ApplicantStatus::PendingForm, ApplicantStatus::PendingPayment)
            | (ApplicantStatus::PendingPayment, ApplicantStatus::Enrolled) => true,
            (current, ApplicantStatus::Rejected) => !current.is_terminal(),
            _ => false,
        }
    }

    pub fn transition(self, next: ApplicantStatus) -> Result<ApplicantStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                entity: "applicant",
                from: self.label(),
                to: next.label(),
            })
        }
    }
}

/// Fine-grained status of an exam ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamTicketStatus {
    Pending,
    Scheduled,
    Taken,
    Approved,
    Rejected,
}

impl ExamTicketStatus {
    pub const ALL: [ExamTicketStatus; 5] = [
        ExamTicketStatus::Pending,
        ExamTicketStatus::Scheduled,
        ExamTicketStatus::Taken,
        ExamTicketStatus::Approved,
        ExamTicketStatus::Rejected,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            ExamTicketStatus::Pending => "pending",
            ExamTicketStatus::Scheduled => "scheduled",
            ExamTicketStatus::Taken => "taken",
            ExamTicketStatus::Approved => "approved",
            ExamTicketStatus::Rejected => "rejected",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.label() == label)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, ExamTicketStatus::Approved | ExamTicketStatus::Rejected)
    }

    pub const fn can_transition_to(self, next: ExamTicketStatus) -> bool {
        match (self, next) {
            (ExamTicketStatus::Pending, ExamTicketStatus::Scheduled)
            | (ExamTicketStatus::Scheduled, ExamTicketStatus::Scheduled)
            | (ExamTicketStatus::Scheduled, ExamTicketStatus::Taken) => true,
            (current, ExamTicketStatus::Approved | ExamTicketStatus::Rejected) => {
                !current.is_terminal()
            }
            _ => false,
        }
    }

    pub fn transition(self, next: ExamTicketStatus) -> Result<ExamTicketStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                entity: "exam ticket",
                from: self.label(),
                to: next.label(),
            })
        }
    }
}

/// Status of a waitlist entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitlistStatus {
    Waiting,
    Accepted,
    Rejected,
    Cancelled,
    Expired,
}

impl WaitlistStatus {
    pub const ALL: [WaitlistStatus; 5] = [
        WaitlistStatus::Waiting,
        WaitlistStatus::Accepted,
        WaitlistStatus::Rejected,
        WaitlistStatus::Cancelled,
        WaitlistStatus::Expired,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            WaitlistStatus::Waiting => "waiting",
            WaitlistStatus::Accepted => "accepted",
            WaitlistStatus::Rejected => "rejected",
            WaitlistStatus::Cancelled => "cancelled",
            WaitlistStatus::Expired => "expired",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.label() == label)
    }

    /// An accepted entry may still be rejected administratively (e.g. the applicant never pays).
    pub const fn can_transition_to(self, next: WaitlistStatus) -> bool {
        matches!(
            (self, next),
            (WaitlistStatus::Waiting, WaitlistStatus::Accepted)
                | (WaitlistStatus::Waiting, WaitlistStatus::Rejected)
                | (WaitlistStatus::Waiting, WaitlistStatus::Cancelled)
                | (WaitlistStatus::Waiting, WaitlistStatus::Expired)
                | (WaitlistStatus::Accepted, WaitlistStatus::Rejected)
        )
    }

    pub fn transition(self, next: WaitlistStatus) -> Result<WaitlistStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                entity: "waitlist entry",
                from: self.label(),
                to: next.label(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
}

impl PaymentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "pending" => Some(PaymentStatus::Pending),
            "paid" => Some(PaymentStatus::Paid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shift {
    Morning,
    Afternoon,
    Evening,
}

impl Shift {
    pub const fn label(self) -> &'static str {
        match self {
            Shift::Morning => "morning",
            Shift::Afternoon => "afternoon",
            Shift::Evening => "evening",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "morning" => Some(Shift::Morning),
            "afternoon" => Some(Shift::Afternoon),
            "evening" => Some(Shift::Evening),
            _ => None,
        }
    }
}

/// Applicant account owned by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applicant {
    pub id: ApplicantId,
    pub full_name: String,
    pub email: String,
    pub national_id: String,
    pub phone: Option<String>,
    pub status: ApplicantStatus,
    pub temporary: bool,
    pub rejection_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ticket authorizing a candidate to sit the admission exam.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamTicket {
    pub id: TicketId,
    pub folio: String,
    pub applicant_id: Option<ApplicantId>,
    pub career_id: String,
    pub full_name: String,
    pub email: String,
    pub national_id: String,
    pub status: ExamTicketStatus,
    pub score: Option<u8>,
    pub passed: Option<bool>,
    pub exam_date: Option<DateTime<Utc>>,
    pub venue: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: WaitlistEntryId,
    pub ticket_id: TicketId,
    pub position: u32,
    pub status: WaitlistStatus,
    pub decision_reason: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Personal data captured on the enrollment form; the student record is built from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalData {
    pub full_name: String,
    pub national_id: String,
    pub email: String,
    pub birth_date: NaiveDate,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

/// Reference to the live checkout session at the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSessionRef {
    pub session_id: String,
    pub url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentApplication {
    pub id: ApplicationId,
    pub applicant_id: ApplicantId,
    pub personal: PersonalData,
    pub academic: Value,
    pub guardian: Option<Value>,
    pub program_id: String,
    pub shift: Shift,
    pub section: String,
    pub amount_due: Money,
    pub payment_status: PaymentStatus,
    pub checkout_session: Option<CheckoutSessionRef>,
    pub paid_at: Option<DateTime<Utc>>,
    pub student_id: Option<StudentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub control_number: String,
    pub applicant_id: ApplicantId,
    pub application_id: ApplicationId,
    pub ticket_id: Option<TicketId>,
    pub full_name: String,
    pub national_id: String,
    pub email: String,
    pub program_id: String,
    pub shift: Shift,
    pub section: String,
    pub enrolled_at: DateTime<Utc>,
}

/// Append-only ledger entry for a confirmed gateway transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: PaymentRecordId,
    pub application_id: ApplicationId,
    pub applicant_id: ApplicantId,
    pub session_id: String,
    pub transaction_id: Option<String>,
    pub amount: Money,
    pub currency: String,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Registered,
    WaitlistAccepted,
    WaitlistRejected,
    ApplicationSubmitted,
    PaymentConfirmed,
}

impl AuditAction {
    pub const fn label(self) -> &'static str {
        match self {
            AuditAction::Registered => "registered",
            AuditAction::WaitlistAccepted => "waitlist_accepted",
            AuditAction::WaitlistRejected => "waitlist_rejected",
            AuditAction::ApplicationSubmitted => "application_submitted",
            AuditAction::PaymentConfirmed => "payment_confirmed",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        [
            AuditAction::Registered,
            AuditAction::WaitlistAccepted,
            AuditAction::WaitlistRejected,
            AuditAction::ApplicationSubmitted,
            AuditAction::PaymentConfirmed,
        ]
        .into_iter()
        .find(|action| action.label() == label)
    }
}

/// Append-only record of an applicant status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub applicant_id: ApplicantId,
    pub action: AuditAction,
    pub from_status: Option<ApplicantStatus>,
    pub to_status: ApplicantStatus,
    pub actor: ActorId,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentCategory {
    Identification,
    BirthCertificate,
    ProofOfAddress,
    AcademicRecord,
    Photo,
    Other,
}

impl DocumentCategory {
    pub const ALL: [DocumentCategory; 6] = [
        DocumentCategory::Identification,
        DocumentCategory::BirthCertificate,
        DocumentCategory::ProofOfAddress,
        DocumentCategory::AcademicRecord,
        DocumentCategory::Photo,
        DocumentCategory::Other,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            DocumentCategory::Identification => "identification",
            DocumentCategory::BirthCertificate => "birth_certificate",
            DocumentCategory::ProofOfAddress => "proof_of_address",
            DocumentCategory::AcademicRecord => "academic_record",
            DocumentCategory::Photo => "photo",
            DocumentCategory::Other => "other",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|category| category.label() == label)
    }
}

/// File reference supplied by the document-storage collaborator. Bytes are never inspected here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub application_id: ApplicationId,
    pub name: String,
    pub category: DocumentCategory,
    pub storage_key: String,
    pub uploaded_at: DateTime<Utc>,
}
