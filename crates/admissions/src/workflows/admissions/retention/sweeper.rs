use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::graph::{deletion_order, EntityKind};
use crate::workflows::admissions::clock::Clock;
use crate::workflows::admissions::documents::DocumentStorage;
use crate::workflows::admissions::domain::{ActorId, ApplicantId, ApplicantStatus, DocumentRecord};
use crate::workflows::admissions::error::{AdmissionsError, AdmissionsResult};
use crate::workflows::admissions::registry;
use crate::workflows::admissions::store::{AdmissionsStore, StoreError, StoreTx};

/// Longest grace period accepted from configuration or callers (about a century).
pub const MAX_GRACE_PERIOD_DAYS: u32 = 36_500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionSettings {
    pub grace_period_days: u32,
    pub sweep_interval: Duration,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            grace_period_days: 7,
            sweep_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Rows removed for one applicant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeSummary {
    pub applicant_id: Option<ApplicantId>,
    pub documents: usize,
    pub payments: usize,
    pub applications: usize,
    pub waitlist_entries: usize,
    pub tickets: usize,
    pub audit_entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub applicant_id: ApplicantId,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub candidates: usize,
    pub deleted: usize,
    pub failed: usize,
    pub failures: Vec<SweepFailure>,
}

/// Permanently deletes rejected applicants once their grace period has elapsed.
pub struct RetentionSweeper<S, D> {
    store: Arc<S>,
    documents: Arc<D>,
    clock: Arc<dyn Clock>,
    settings: RetentionSettings,
}

impl<S, D> RetentionSweeper<S, D>
where
    S: AdmissionsStore + 'static,
    D: DocumentStorage + 'static,
{
    pub fn new(
        store: Arc<S>,
        documents: Arc<D>,
        clock: Arc<dyn Clock>,
        settings: RetentionSettings,
    ) -> Self {
        Self {
            store,
            documents,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> RetentionSettings {
        self.settings
    }

    /// Sweeps with the configured grace period.
    pub fn sweep(&self) -> AdmissionsResult<SweepReport> {
        self.sweep_with_grace(self.settings.grace_period_days)
    }

    /// Deletes every applicant rejected at least `grace_period_days` ago, one transaction per
    /// applicant. A failing applicant is reported and skipped.
    pub fn sweep_with_grace(&self, grace_period_days: u32) -> AdmissionsResult<SweepReport> {
        let cutoff = cutoff(self.clock.now(), grace_period_days)?;
        let candidates = self
            .store
            .read(|tx| Ok::<_, AdmissionsError>(tx.rejected_applicants_before(cutoff)?))?;

        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };

        for applicant_id in candidates {
            let purged = self.store.transaction(|tx| {
                let applicant = registry::load(tx, &applicant_id)?;
                // Re-checked inside the transaction: the applicant may have changed since the scan.
                if !is_due(applicant.status, applicant.rejection_date, cutoff) {
                    return Err(AdmissionsError::precondition(format!(
                        "applicant {applicant_id} is no longer due for deletion"
                    )));
                }
                cascade(tx, &applicant_id)
            });

            match purged {
                Ok((summary, documents)) => {
                    report.deleted += 1;
                    self.remove_files(&documents);
                    info!(
                        applicant_id = %applicant_id,
                        tickets = summary.tickets,
                        applications = summary.applications,
                        audit_entries = summary.audit_entries,
                        "rejected applicant purged"
                    );
                }
                Err(err) => {
                    warn!(applicant_id = %applicant_id, error = %err, "failed to purge applicant");
                    report.failed += 1;
                    report.failures.push(SweepFailure {
                        applicant_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            candidates = report.candidates,
            deleted = report.deleted,
            failed = report.failed,
            grace_period_days,
            "retention sweep finished"
        );
        Ok(report)
    }

    /// Deletes one applicant immediately. Refused unless the applicant is rejected.
    pub fn purge(&self, applicant_id: &ApplicantId, actor: &ActorId) -> AdmissionsResult<PurgeSummary> {
        let (summary, documents) = self.store.transaction(|tx| {
            let applicant = registry::load(tx, applicant_id)?;
            if applicant.status != ApplicantStatus::Rejected {
                return Err(AdmissionsError::precondition(format!(
                    "applicant {applicant_id} is {}, only rejected applicants can be purged",
                    applicant.status.label()
                )));
            }
            cascade(tx, applicant_id)
        })?;

        self.remove_files(&documents);
        info!(applicant_id = %applicant_id, actor = %actor, "applicant purged manually");
        Ok(summary)
    }

    fn remove_files(&self, documents: &[DocumentRecord]) {
        for document in documents {
            if let Err(err) = self.documents.remove(&document.storage_key) {
                warn!(
                    document_id = %document.id,
                    storage_key = %document.storage_key,
                    error = %err,
                    "failed to remove document file"
                );
            }
        }
    }

    /// Runs [`sweep`](Self::sweep) on the configured interval until the handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            // `interval` panics on a zero period.
            let period = self.settings.sweep_interval.max(Duration::from_secs(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                let sweeper = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || sweeper.sweep()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(error = %err, "retention sweep failed"),
                    Err(err) => warn!(error = %err, "retention sweep task panicked"),
                }
            }
        })
    }
}

fn cutoff(now: DateTime<Utc>, grace_period_days: u32) -> AdmissionsResult<DateTime<Utc>> {
    let out_of_range = || {
        AdmissionsError::validation(format!(
            "grace period must be at most {MAX_GRACE_PERIOD_DAYS} days, got {grace_period_days}"
        ))
    };
    if grace_period_days > MAX_GRACE_PERIOD_DAYS {
        return Err(out_of_range());
    }
    ChronoDuration::try_days(i64::from(grace_period_days))
        .and_then(|grace| now.checked_sub_signed(grace))
        .ok_or_else(out_of_range)
}

fn is_due(
    status: ApplicantStatus,
    rejection_date: Option<DateTime<Utc>>,
    cutoff: DateTime<Utc>,
) -> bool {
    status == ApplicantStatus::Rejected && rejection_date.is_some_and(|at| at <= cutoff)
}

/// Deletes everything owned by the applicant in dependency order. Returns the removed
/// document references so their files can be removed once the transaction commits.
fn cascade(
    tx: &mut dyn StoreTx,
    applicant_id: &ApplicantId,
) -> AdmissionsResult<(PurgeSummary, Vec<DocumentRecord>)> {
    let mut summary = PurgeSummary {
        applicant_id: Some(applicant_id.clone()),
        ..PurgeSummary::default()
    };
    let mut documents = Vec::new();

    for kind in deletion_order(EntityKind::Applicant) {
        match kind {
            EntityKind::Document => {
                documents = tx.delete_documents_for_applicant(applicant_id)?;
                summary.documents = documents.len();
            }
            EntityKind::PaymentRecord => {
                summary.payments = tx.delete_payments_for_applicant(applicant_id)?;
            }
            EntityKind::EnrollmentApplication => {
                summary.applications = tx.delete_applications_for_applicant(applicant_id)?;
            }
            EntityKind::WaitlistEntry => {
                summary.waitlist_entries = tx.delete_waitlist_for_applicant(applicant_id)?;
            }
            EntityKind::ExamTicket => {
                summary.tickets = tx.delete_tickets_for_applicant(applicant_id)?;
            }
            EntityKind::AuditEntry => {
                summary.audit_entries = tx.delete_audit_for_applicant(applicant_id)?;
            }
            EntityKind::Applicant => {
                if tx.delete_applicant(applicant_id)? == 0 {
                    return Err(StoreError::Missing(format!("applicant {applicant_id}")).into());
                }
            }
        }
    }
    Ok((summary, documents))
}
