use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{AdmissionsStore, StoreCounts, StoreError, StoreResult, StoreTx};
use crate::workflows::admissions::domain::{
    ActorId, Applicant, ApplicantId, ApplicantStatus, ApplicationId, AuditAction, AuditEntry,
    AuditEntryId, CheckoutSessionRef, DocumentCategory, DocumentId, DocumentRecord,
    EnrollmentApplication, ExamTicket, ExamTicketStatus, Money, PaymentRecord, PaymentRecordId,
    PaymentStatus, Shift, Student, StudentId, TicketId, WaitlistEntry, WaitlistEntryId,
    WaitlistStatus,
};

const SCHEMA: &str = r#"
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS applicants (
        id              TEXT PRIMARY KEY,
        full_name       TEXT NOT NULL,
        email           TEXT NOT NULL UNIQUE,
        national_id     TEXT NOT NULL UNIQUE,
        phone           TEXT,
        status          TEXT NOT NULL,
        temporary       INTEGER NOT NULL,
        rejection_date  TEXT,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS exam_tickets (
        id            TEXT PRIMARY KEY,
        folio         TEXT NOT NULL UNIQUE,
        applicant_id  TEXT UNIQUE REFERENCES applicants(id) ON DELETE RESTRICT,
        career_id     TEXT NOT NULL,
        full_name     TEXT NOT NULL,
        email         TEXT NOT NULL,
        national_id   TEXT NOT NULL,
        status        TEXT NOT NULL,
        score         INTEGER,
        passed        INTEGER,
        exam_date     TEXT,
        venue         TEXT,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS waitlist_entries (
        id               TEXT PRIMARY KEY,
        ticket_id        TEXT NOT NULL UNIQUE REFERENCES exam_tickets(id) ON DELETE RESTRICT,
        position         INTEGER NOT NULL UNIQUE,
        status           TEXT NOT NULL,
        decision_reason  TEXT,
        decided_at       TEXT,
        created_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS enrollment_applications (
        id                  TEXT PRIMARY KEY,
        applicant_id        TEXT NOT NULL UNIQUE REFERENCES applicants(id) ON DELETE RESTRICT,
        personal            TEXT NOT NULL,
        academic            TEXT NOT NULL,
        guardian            TEXT,
        program_id          TEXT NOT NULL,
        shift               TEXT NOT NULL,
        section             TEXT NOT NULL,
        amount_due          INTEGER NOT NULL,
        payment_status      TEXT NOT NULL,
        session_id          TEXT,
        session_url         TEXT,
        session_expires_at  TEXT,
        paid_at             TEXT,
        student_id          TEXT,
        created_at          TEXT NOT NULL,
        updated_at          TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS application_documents (
        id              TEXT PRIMARY KEY,
        application_id  TEXT NOT NULL REFERENCES enrollment_applications(id) ON DELETE RESTRICT,
        name            TEXT NOT NULL,
        category        TEXT NOT NULL,
        storage_key     TEXT NOT NULL,
        uploaded_at     TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS students (
        id              TEXT PRIMARY KEY,
        control_number  TEXT NOT NULL UNIQUE,
        applicant_id    TEXT NOT NULL UNIQUE,
        application_id  TEXT NOT NULL UNIQUE,
        ticket_id       TEXT,
        full_name       TEXT NOT NULL,
        national_id     TEXT NOT NULL,
        email           TEXT NOT NULL,
        program_id      TEXT NOT NULL,
        shift           TEXT NOT NULL,
        section         TEXT NOT NULL,
        enrolled_at     TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS payment_records (
        id              TEXT PRIMARY KEY,
        application_id  TEXT NOT NULL REFERENCES enrollment_applications(id) ON DELETE RESTRICT,
        applicant_id    TEXT NOT NULL,
        session_id      TEXT NOT NULL UNIQUE,
        transaction_id  TEXT,
        amount          INTEGER NOT NULL,
        currency        TEXT NOT NULL,
        paid_at         TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS audit_entries (
        id            TEXT PRIMARY KEY,
        applicant_id  TEXT NOT NULL REFERENCES applicants(id) ON DELETE RESTRICT,
        action        TEXT NOT NULL,
        from_status   TEXT,
        to_status     TEXT NOT NULL,
        actor         TEXT NOT NULL,
        reason        TEXT,
        recorded_at   TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sequences (
        scope       TEXT PRIMARY KEY,
        last_value  INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_applicants_status ON applicants(status);
    CREATE INDEX IF NOT EXISTS idx_documents_application ON application_documents(application_id);
    CREATE INDEX IF NOT EXISTS idx_payments_application ON payment_records(application_id);
    CREATE INDEX IF NOT EXISTS idx_audit_applicant ON audit_entries(applicant_id);
"#;

const APPLICANT_COLUMNS: &str =
    "id, full_name, email, national_id, phone, status, temporary, rejection_date, created_at, updated_at";
const TICKET_COLUMNS: &str = "id, folio, applicant_id, career_id, full_name, email, national_id, \
     status, score, passed, exam_date, venue, created_at, updated_at";
const WAITLIST_COLUMNS: &str =
    "id, ticket_id, position, status, decision_reason, decided_at, created_at, updated_at";
const APPLICATION_COLUMNS: &str = "id, applicant_id, personal, academic, guardian, program_id, \
     shift, section, amount_due, payment_status, session_id, session_url, session_expires_at, \
     paid_at, student_id, created_at, updated_at";
const DOCUMENT_COLUMNS: &str = "id, application_id, name, category, storage_key, uploaded_at";
const STUDENT_COLUMNS: &str = "id, control_number, applicant_id, application_id, ticket_id, \
     full_name, national_id, email, program_id, shift, section, enrolled_at";
const PAYMENT_COLUMNS: &str =
    "id, application_id, applicant_id, session_id, transaction_id, amount, currency, paid_at";
const AUDIT_COLUMNS: &str =
    "id, applicant_id, action, from_status, to_status, actor, reason, recorded_at";

/// SQLite-backed store. Writers take the database lock up front (`BEGIN IMMEDIATE`), so
/// read-increment-write sequences inside a transaction never interleave.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::Unavailable(format!("cannot create {}: {err}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn counts(&self) -> StoreResult<StoreCounts> {
        let conn = self.lock()?;
        let count = |table: &str| -> StoreResult<usize> {
            let total: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(total as usize)
        };
        Ok(StoreCounts {
            applicants: count("applicants")?,
            tickets: count("exam_tickets")?,
            waitlist_entries: count("waitlist_entries")?,
            applications: count("enrollment_applications")?,
            documents: count("application_documents")?,
            students: count("students")?,
            payments: count("payment_records")?,
            audit_entries: count("audit_entries")?,
        })
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection mutex poisoned".to_string()))
    }
}

impl AdmissionsStore for SqliteStore {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let result = {
            let mut handle = SqliteTx { conn: &tx };
            work(&mut handle)
        };

        match result {
            Ok(value) => {
                tx.commit().map_err(StoreError::from)?;
                Ok(value)
            }
            // Dropping the transaction rolls it back.
            Err(err) => Err(err),
        }
    }

    fn read<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&dyn StoreTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(StoreError::from)?;
        let handle = SqliteTx { conn: &tx };
        work(&handle)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(err.to_string())
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

struct SqliteTx<'a> {
    conn: &'a Connection,
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn label<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unknown label '{raw}'")))
}

fn json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|err| conversion_error(idx, err.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|err| StoreError::Corrupt(err.to_string()))
}

fn map_applicant(row: &Row<'_>) -> rusqlite::Result<Applicant> {
    Ok(Applicant {
        id: ApplicantId(row.get(0)?),
        full_name: row.get(1)?,
        email: row.get(2)?,
        national_id: row.get(3)?,
        phone: row.get(4)?,
        status: label(row, 5, ApplicantStatus::from_label)?,
        temporary: row.get(6)?,
        rejection_date: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn map_ticket(row: &Row<'_>) -> rusqlite::Result<ExamTicket> {
    Ok(ExamTicket {
        id: TicketId(row.get(0)?),
        folio: row.get(1)?,
        applicant_id: row.get::<_, Option<String>>(2)?.map(ApplicantId),
        career_id: row.get(3)?,
        full_name: row.get(4)?,
        email: row.get(5)?,
        national_id: row.get(6)?,
        status: label(row, 7, ExamTicketStatus::from_label)?,
        score: row.get(8)?,
        passed: row.get(9)?,
        exam_date: row.get(10)?,
        venue: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn map_waitlist(row: &Row<'_>) -> rusqlite::Result<WaitlistEntry> {
    Ok(WaitlistEntry {
        id: WaitlistEntryId(row.get(0)?),
        ticket_id: TicketId(row.get(1)?),
        position: row.get(2)?,
        status: label(row, 3, WaitlistStatus::from_label)?,
        decision_reason: row.get(4)?,
        decided_at: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn map_application(row: &Row<'_>) -> rusqlite::Result<EnrollmentApplication> {
    let guardian: Option<String> = row.get(4)?;
    let guardian = guardian
        .map(|raw| serde_json::from_str(&raw).map_err(|err| conversion_error(4, err.to_string())))
        .transpose()?;
    let session_id: Option<String> = row.get(10)?;
    let checkout_session = match session_id {
        Some(session_id) => Some(CheckoutSessionRef {
            session_id,
            url: row.get(11)?,
            expires_at: row.get(12)?,
        }),
        None => None,
    };

    Ok(EnrollmentApplication {
        id: ApplicationId(row.get(0)?),
        applicant_id: ApplicantId(row.get(1)?),
        personal: json(row, 2)?,
        academic: json(row, 3)?,
        guardian,
        program_id: row.get(5)?,
        shift: label(row, 6, Shift::from_label)?,
        section: row.get(7)?,
        amount_due: Money(row.get(8)?),
        payment_status: label(row, 9, PaymentStatus::from_label)?,
        checkout_session,
        paid_at: row.get(13)?,
        student_id: row.get::<_, Option<String>>(14)?.map(StudentId),
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

fn map_document(row: &Row<'_>) -> rusqlite::Result<DocumentRecord> {
    Ok(DocumentRecord {
        id: DocumentId(row.get(0)?),
        application_id: ApplicationId(row.get(1)?),
        name: row.get(2)?,
        category: label(row, 3, DocumentCategory::from_label)?,
        storage_key: row.get(4)?,
        uploaded_at: row.get(5)?,
    })
}

fn map_student(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: StudentId(row.get(0)?),
        control_number: row.get(1)?,
        applicant_id: ApplicantId(row.get(2)?),
        application_id: ApplicationId(row.get(3)?),
        ticket_id: row.get::<_, Option<String>>(4)?.map(TicketId),
        full_name: row.get(5)?,
        national_id: row.get(6)?,
        email: row.get(7)?,
        program_id: row.get(8)?,
        shift: label(row, 9, Shift::from_label)?,
        section: row.get(10)?,
        enrolled_at: row.get(11)?,
    })
}

fn map_payment(row: &Row<'_>) -> rusqlite::Result<PaymentRecord> {
    Ok(PaymentRecord {
        id: PaymentRecordId(row.get(0)?),
        application_id: ApplicationId(row.get(1)?),
        applicant_id: ApplicantId(row.get(2)?),
        session_id: row.get(3)?,
        transaction_id: row.get(4)?,
        amount: Money(row.get(5)?),
        currency: row.get(6)?,
        paid_at: row.get(7)?,
    })
}

fn map_audit(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let from_status: Option<String> = row.get(3)?;
    let from_status = from_status
        .map(|raw| {
            ApplicantStatus::from_label(&raw)
                .ok_or_else(|| conversion_error(3, format!("unknown label '{raw}'")))
        })
        .transpose()?;

    Ok(AuditEntry {
        id: AuditEntryId(row.get(0)?),
        applicant_id: ApplicantId(row.get(1)?),
        action: label(row, 2, AuditAction::from_label)?,
        from_status,
        to_status: label(row, 4, ApplicantStatus::from_label)?,
        actor: ActorId(row.get(5)?),
        reason: row.get(6)?,
        recorded_at: row.get(7)?,
    })
}

impl SqliteTx<'_> {
    fn one<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StoreResult<Option<T>> {
        Ok(self.conn.query_row(sql, params, map).optional()?)
    }

    fn many<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StoreResult<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, map)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn expect_updated(changed: usize, what: String) -> StoreResult<()> {
        if changed == 0 {
            Err(StoreError::Missing(what))
        } else {
            Ok(())
        }
    }
}

impl StoreTx for SqliteTx<'_> {
    fn applicant(&self, id: &ApplicantId) -> StoreResult<Option<Applicant>> {
        self.one(
            &format!("SELECT {APPLICANT_COLUMNS} FROM applicants WHERE id = ?1"),
            params![id.as_str()],
            map_applicant,
        )
    }

    fn applicant_by_email(&self, email: &str) -> StoreResult<Option<Applicant>> {
        self.one(
            &format!("SELECT {APPLICANT_COLUMNS} FROM applicants WHERE email = ?1"),
            params![email],
            map_applicant,
        )
    }

    fn applicant_by_national_id(&self, national_id: &str) -> StoreResult<Option<Applicant>> {
        self.one(
            &format!("SELECT {APPLICANT_COLUMNS} FROM applicants WHERE national_id = ?1"),
            params![national_id],
            map_applicant,
        )
    }

    fn rejected_applicants_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<ApplicantId>> {
        let rejected = self.many(
            &format!(
                "SELECT {APPLICANT_COLUMNS} FROM applicants \
                 WHERE status = ?1 AND rejection_date IS NOT NULL"
            ),
            params![ApplicantStatus::Rejected.label()],
            map_applicant,
        )?;

        let mut due: Vec<_> = rejected
            .into_iter()
            .filter_map(|applicant| {
                applicant
                    .rejection_date
                    .filter(|rejected_at| *rejected_at <= cutoff)
                    .map(|rejected_at| (rejected_at, applicant.id))
            })
            .collect();
        due.sort();
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    fn insert_applicant(&mut self, applicant: &Applicant) -> StoreResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO applicants ({APPLICANT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                applicant.id.as_str(),
                applicant.full_name,
                applicant.email,
                applicant.national_id,
                applicant.phone,
                applicant.status.label(),
                applicant.temporary,
                applicant.rejection_date,
                applicant.created_at,
                applicant.updated_at,
            ],
        )?;
        Ok(())
    }

    fn update_applicant(&mut self, applicant: &Applicant) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE applicants SET full_name = ?2, email = ?3, national_id = ?4, phone = ?5, \
             status = ?6, temporary = ?7, rejection_date = ?8, updated_at = ?9 WHERE id = ?1",
            params![
                applicant.id.as_str(),
                applicant.full_name,
                applicant.email,
                applicant.national_id,
                applicant.phone,
                applicant.status.label(),
                applicant.temporary,
                applicant.rejection_date,
                applicant.updated_at,
            ],
        )?;
        Self::expect_updated(changed, format!("applicant {}", applicant.id))
    }

    fn delete_applicant(&mut self, id: &ApplicantId) -> StoreResult<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM applicants WHERE id = ?1", params![id.as_str()])?)
    }

    fn ticket(&self, id: &TicketId) -> StoreResult<Option<ExamTicket>> {
        self.one(
            &format!("SELECT {TICKET_COLUMNS} FROM exam_tickets WHERE id = ?1"),
            params![id.as_str()],
            map_ticket,
        )
    }

    fn ticket_for_applicant(&self, applicant_id: &ApplicantId) -> StoreResult<Option<ExamTicket>> {
        self.one(
            &format!("SELECT {TICKET_COLUMNS} FROM exam_tickets WHERE applicant_id = ?1"),
            params![applicant_id.as_str()],
            map_ticket,
        )
    }

    fn ticket_by_email(&self, email: &str) -> StoreResult<Option<ExamTicket>> {
        self.one(
            &format!("SELECT {TICKET_COLUMNS} FROM exam_tickets WHERE email = ?1 LIMIT 1"),
            params![email],
            map_ticket,
        )
    }

    fn ticket_by_national_id(&self, national_id: &str) -> StoreResult<Option<ExamTicket>> {
        self.one(
            &format!("SELECT {TICKET_COLUMNS} FROM exam_tickets WHERE national_id = ?1 LIMIT 1"),
            params![national_id],
            map_ticket,
        )
    }

    fn max_folio(&self, prefix: &str) -> StoreResult<Option<String>> {
        let pattern = format!("{prefix}%");
        Ok(self.conn.query_row(
            "SELECT MAX(folio) FROM exam_tickets WHERE folio LIKE ?1",
            params![pattern],
            |row| row.get(0),
        )?)
    }

    fn insert_ticket(&mut self, ticket: &ExamTicket) -> StoreResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO exam_tickets ({TICKET_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                ticket.id.as_str(),
                ticket.folio,
                ticket.applicant_id.as_ref().map(|id| id.as_str()),
                ticket.career_id,
                ticket.full_name,
                ticket.email,
                ticket.national_id,
                ticket.status.label(),
                ticket.score,
                ticket.passed,
                ticket.exam_date,
                ticket.venue,
                ticket.created_at,
                ticket.updated_at,
            ],
        )?;
        Ok(())
    }

    fn update_ticket(&mut self, ticket: &ExamTicket) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE exam_tickets SET applicant_id = ?2, status = ?3, score = ?4, passed = ?5, \
             exam_date = ?6, venue = ?7, updated_at = ?8 WHERE id = ?1",
            params![
                ticket.id.as_str(),
                ticket.applicant_id.as_ref().map(|id| id.as_str()),
                ticket.status.label(),
                ticket.score,
                ticket.passed,
                ticket.exam_date,
                ticket.venue,
                ticket.updated_at,
            ],
        )?;
        Self::expect_updated(changed, format!("ticket {}", ticket.id))
    }

    fn delete_tickets_for_applicant(&mut self, applicant_id: &ApplicantId) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM exam_tickets WHERE applicant_id = ?1",
            params![applicant_id.as_str()],
        )?)
    }

    fn waitlist_entry(&self, id: &WaitlistEntryId) -> StoreResult<Option<WaitlistEntry>> {
        self.one(
            &format!("SELECT {WAITLIST_COLUMNS} FROM waitlist_entries WHERE id = ?1"),
            params![id.as_str()],
            map_waitlist,
        )
    }

    fn waitlist_entry_for_ticket(
        &self,
        ticket_id: &TicketId,
    ) -> StoreResult<Option<WaitlistEntry>> {
        self.one(
            &format!("SELECT {WAITLIST_COLUMNS} FROM waitlist_entries WHERE ticket_id = ?1"),
            params![ticket_id.as_str()],
            map_waitlist,
        )
    }

    fn waitlist(&self, status: Option<WaitlistStatus>) -> StoreResult<Vec<WaitlistEntry>> {
        match status {
            Some(status) => self.many(
                &format!(
                    "SELECT {WAITLIST_COLUMNS} FROM waitlist_entries \
                     WHERE status = ?1 ORDER BY position"
                ),
                params![status.label()],
                map_waitlist,
            ),
            None => self.many(
                &format!("SELECT {WAITLIST_COLUMNS} FROM waitlist_entries ORDER BY position"),
                [],
                map_waitlist,
            ),
        }
    }

    fn max_waitlist_position(&self) -> StoreResult<Option<u32>> {
        Ok(self
            .conn
            .query_row("SELECT MAX(position) FROM waitlist_entries", [], |row| {
                row.get(0)
            })?)
    }

    fn insert_waitlist_entry(&mut self, entry: &WaitlistEntry) -> StoreResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO waitlist_entries ({WAITLIST_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                entry.id.as_str(),
                entry.ticket_id.as_str(),
                entry.position,
                entry.status.label(),
                entry.decision_reason,
                entry.decided_at,
                entry.created_at,
                entry.updated_at,
            ],
        )?;
        Ok(())
    }

    fn update_waitlist_entry(&mut self, entry: &WaitlistEntry) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE waitlist_entries SET status = ?2, decision_reason = ?3, decided_at = ?4, \
             updated_at = ?5 WHERE id = ?1",
            params![
                entry.id.as_str(),
                entry.status.label(),
                entry.decision_reason,
                entry.decided_at,
                entry.updated_at,
            ],
        )?;
        Self::expect_updated(changed, format!("waitlist entry {}", entry.id))
    }

    fn delete_waitlist_for_applicant(&mut self, applicant_id: &ApplicantId) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM waitlist_entries WHERE ticket_id IN \
             (SELECT id FROM exam_tickets WHERE applicant_id = ?1)",
            params![applicant_id.as_str()],
        )?)
    }

    fn application(&self, id: &ApplicationId) -> StoreResult<Option<EnrollmentApplication>> {
        self.one(
            &format!("SELECT {APPLICATION_COLUMNS} FROM enrollment_applications WHERE id = ?1"),
            params![id.as_str()],
            map_application,
        )
    }

    fn application_for_applicant(
        &self,
        applicant_id: &ApplicantId,
    ) -> StoreResult<Option<EnrollmentApplication>> {
        self.one(
            &format!(
                "SELECT {APPLICATION_COLUMNS} FROM enrollment_applications WHERE applicant_id = ?1"
            ),
            params![applicant_id.as_str()],
            map_application,
        )
    }

    fn insert_application(&mut self, application: &EnrollmentApplication) -> StoreResult<()> {
        let personal = to_json(&application.personal)?;
        let academic = to_json(&application.academic)?;
        let guardian = application.guardian.as_ref().map(to_json).transpose()?;
        let session = application.checkout_session.as_ref();

        self.conn.execute(
            &format!(
                "INSERT INTO enrollment_applications ({APPLICATION_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
            ),
            params![
                application.id.as_str(),
                application.applicant_id.as_str(),
                personal,
                academic,
                guardian,
                application.program_id,
                application.shift.label(),
                application.section,
                application.amount_due.cents(),
                application.payment_status.label(),
                session.map(|s| s.session_id.as_str()),
                session.and_then(|s| s.url.as_deref()),
                session.and_then(|s| s.expires_at),
                application.paid_at,
                application.student_id.as_ref().map(|id| id.as_str()),
                application.created_at,
                application.updated_at,
            ],
        )?;
        Ok(())
    }

    fn update_application(&mut self, application: &EnrollmentApplication) -> StoreResult<()> {
        let personal = to_json(&application.personal)?;
        let academic = to_json(&application.academic)?;
        let guardian = application.guardian.as_ref().map(to_json).transpose()?;
        let session = application.checkout_session.as_ref();

        let changed = self.conn.execute(
            "UPDATE enrollment_applications SET personal = ?2, academic = ?3, guardian = ?4, \
             program_id = ?5, shift = ?6, section = ?7, amount_due = ?8, payment_status = ?9, \
             session_id = ?10, session_url = ?11, session_expires_at = ?12, paid_at = ?13, \
             student_id = ?14, updated_at = ?15 WHERE id = ?1",
            params![
                application.id.as_str(),
                personal,
                academic,
                guardian,
                application.program_id,
                application.shift.label(),
                application.section,
                application.amount_due.cents(),
                application.payment_status.label(),
                session.map(|s| s.session_id.as_str()),
                session.and_then(|s| s.url.as_deref()),
                session.and_then(|s| s.expires_at),
                application.paid_at,
                application.student_id.as_ref().map(|id| id.as_str()),
                application.updated_at,
            ],
        )?;
        Self::expect_updated(changed, format!("application {}", application.id))
    }

    fn delete_applications_for_applicant(
        &mut self,
        applicant_id: &ApplicantId,
    ) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM enrollment_applications WHERE applicant_id = ?1",
            params![applicant_id.as_str()],
        )?)
    }

    fn documents_for_application(
        &self,
        application_id: &ApplicationId,
    ) -> StoreResult<Vec<DocumentRecord>> {
        self.many(
            &format!(
                "SELECT {DOCUMENT_COLUMNS} FROM application_documents \
                 WHERE application_id = ?1 ORDER BY rowid"
            ),
            params![application_id.as_str()],
            map_document,
        )
    }

    fn insert_document(&mut self, document: &DocumentRecord) -> StoreResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO application_documents ({DOCUMENT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            params![
                document.id.as_str(),
                document.application_id.as_str(),
                document.name,
                document.category.label(),
                document.storage_key,
                document.uploaded_at,
            ],
        )?;
        Ok(())
    }

    fn delete_documents_for_applicant(
        &mut self,
        applicant_id: &ApplicantId,
    ) -> StoreResult<Vec<DocumentRecord>> {
        let documents = self.many(
            &format!(
                "SELECT {DOCUMENT_COLUMNS} FROM application_documents WHERE application_id IN \
                 (SELECT id FROM enrollment_applications WHERE applicant_id = ?1)"
            ),
            params![applicant_id.as_str()],
            map_document,
        )?;
        self.conn.execute(
            "DELETE FROM application_documents WHERE application_id IN \
             (SELECT id FROM enrollment_applications WHERE applicant_id = ?1)",
            params![applicant_id.as_str()],
        )?;
        Ok(documents)
    }

    fn student_for_applicant(&self, applicant_id: &ApplicantId) -> StoreResult<Option<Student>> {
        self.one(
            &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE applicant_id = ?1"),
            params![applicant_id.as_str()],
            map_student,
        )
    }

    fn student_by_national_id(&self, national_id: &str) -> StoreResult<Option<Student>> {
        self.one(
            &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE national_id = ?1 LIMIT 1"),
            params![national_id],
            map_student,
        )
    }

    fn max_control_number(&self, prefix: &str) -> StoreResult<Option<String>> {
        let pattern = format!("{prefix}%");
        Ok(self.conn.query_row(
            "SELECT MAX(control_number) FROM students WHERE control_number LIKE ?1",
            params![pattern],
            |row| row.get(0),
        )?)
    }

    fn insert_student(&mut self, student: &Student) -> StoreResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO students ({STUDENT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                student.id.as_str(),
                student.control_number,
                student.applicant_id.as_str(),
                student.application_id.as_str(),
                student.ticket_id.as_ref().map(|id| id.as_str()),
                student.full_name,
                student.national_id,
                student.email,
                student.program_id,
                student.shift.label(),
                student.section,
                student.enrolled_at,
            ],
        )?;
        Ok(())
    }

    fn payment_by_session(&self, session_id: &str) -> StoreResult<Option<PaymentRecord>> {
        self.one(
            &format!("SELECT {PAYMENT_COLUMNS} FROM payment_records WHERE session_id = ?1"),
            params![session_id],
            map_payment,
        )
    }

    fn payments_for_application(
        &self,
        application_id: &ApplicationId,
    ) -> StoreResult<Vec<PaymentRecord>> {
        let mut payments = self.many(
            &format!("SELECT {PAYMENT_COLUMNS} FROM payment_records WHERE application_id = ?1"),
            params![application_id.as_str()],
            map_payment,
        )?;
        payments.sort_by_key(|payment| payment.paid_at);
        Ok(payments)
    }

    fn insert_payment(&mut self, payment: &PaymentRecord) -> StoreResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO payment_records ({PAYMENT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                payment.id.as_str(),
                payment.application_id.as_str(),
                payment.applicant_id.as_str(),
                payment.session_id,
                payment.transaction_id,
                payment.amount.cents(),
                payment.currency,
                payment.paid_at,
            ],
        )?;
        Ok(())
    }

    fn delete_payments_for_applicant(&mut self, applicant_id: &ApplicantId) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM payment_records WHERE application_id IN \
             (SELECT id FROM enrollment_applications WHERE applicant_id = ?1)",
            params![applicant_id.as_str()],
        )?)
    }

    fn audit_for_applicant(&self, applicant_id: &ApplicantId) -> StoreResult<Vec<AuditEntry>> {
        self.many(
            &format!(
                "SELECT {AUDIT_COLUMNS} FROM audit_entries WHERE applicant_id = ?1 ORDER BY rowid"
            ),
            params![applicant_id.as_str()],
            map_audit,
        )
    }

    fn append_audit(&mut self, entry: &AuditEntry) -> StoreResult<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO audit_entries ({AUDIT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                entry.id.as_str(),
                entry.applicant_id.as_str(),
                entry.action.label(),
                entry.from_status.map(|status| status.label()),
                entry.to_status.label(),
                entry.actor.as_str(),
                entry.reason,
                entry.recorded_at,
            ],
        )?;
        Ok(())
    }

    fn delete_audit_for_applicant(&mut self, applicant_id: &ApplicantId) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM audit_entries WHERE applicant_id = ?1",
            params![applicant_id.as_str()],
        )?)
    }

    fn sequence_high_water(&self, scope: &str) -> StoreResult<Option<u32>> {
        Ok(self
            .conn
            .query_row(
                "SELECT last_value FROM sequences WHERE scope = ?1",
                params![scope],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_sequence_high_water(&mut self, scope: &str, value: u32) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO sequences (scope, last_value) VALUES (?1, ?2) \
             ON CONFLICT(scope) DO UPDATE SET last_value = excluded.last_value",
            params![scope, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn applicant(id: &str) -> Applicant {
        let now = Utc.with_ymd_and_hms(2025, 11, 3, 9, 0, 0).unwrap();
        Applicant {
            id: ApplicantId::from(id),
            full_name: "Luis Pérez".to_string(),
            email: format!("{id}@example.com"),
            national_id: format!("NID-{id}"),
            phone: Some("5512345678".to_string()),
            status: ApplicantStatus::UnderReview,
            temporary: true,
            rejection_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn applicant_round_trips_through_sqlite() {
        let store = SqliteStore::open_in_memory().expect("schema applies");
        let record = applicant("a1");
        store
            .transaction(|tx| tx.insert_applicant(&record))
            .expect("insert");

        let loaded: Option<Applicant> = store
            .read(|tx| tx.applicant(&record.id))
            .expect("read");
        assert_eq!(loaded, Some(record));
    }

    #[test]
    fn rolled_back_transaction_is_not_visible() {
        let store = SqliteStore::open_in_memory().expect("schema applies");
        let result: Result<(), StoreError> = store.transaction(|tx| {
            tx.insert_applicant(&applicant("a1"))?;
            Err(StoreError::Unavailable("abort".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.counts().expect("counts").applicants, 0);
    }

    #[test]
    fn unique_email_maps_to_conflict() {
        let store = SqliteStore::open_in_memory().expect("schema applies");
        let first = applicant("a1");
        let mut second = applicant("a2");
        second.email = first.email.clone();

        store
            .transaction(|tx| tx.insert_applicant(&first))
            .expect("first insert");
        let err = store
            .transaction(|tx| tx.insert_applicant(&second))
            .expect_err("duplicate email");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn foreign_keys_restrict_parent_deletion() {
        let store = SqliteStore::open_in_memory().expect("schema applies");
        let record = applicant("a1");
        store
            .transaction(|tx| {
                tx.insert_applicant(&record)?;
                tx.append_audit(&AuditEntry {
                    id: AuditEntryId::from("aud-1"),
                    applicant_id: record.id.clone(),
                    action: AuditAction::Registered,
                    from_status: None,
                    to_status: ApplicantStatus::UnderReview,
                    actor: ActorId::system(),
                    reason: None,
                    recorded_at: record.created_at,
                })
            })
            .expect("seed");

        let err = store
            .transaction(|tx| tx.delete_applicant(&record.id))
            .expect_err("audit entry still references applicant");
        assert!(matches!(err, StoreError::Conflict(_)));

        let deleted = store
            .transaction(|tx| {
                tx.delete_audit_for_applicant(&record.id)?;
                tx.delete_applicant(&record.id)
            })
            .expect("children first");
        assert_eq!(deleted, 1);
    }

    #[test]
    fn sequence_high_water_upserts() {
        let store = SqliteStore::open_in_memory().expect("schema applies");
        store
            .transaction(|tx| {
                tx.set_sequence_high_water("waitlist", 3)?;
                tx.set_sequence_high_water("waitlist", 4)
            })
            .expect("upsert");
        let value: Option<u32> = store
            .read(|tx| tx.sequence_high_water("waitlist"))
            .expect("read");
        assert_eq!(value, Some(4));
    }
}
