use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Duration as ChronoDuration};
use serde::Serialize;
use tracing::{error, info, warn};

use super::gateway::{CheckoutRequest, PaymentGateway, Refund, RefundRequest, SessionPaymentStatus};
use super::webhook::{EventError, EventKind, SessionEvent, WebhookVerifier};
use crate::workflows::admissions::clock::Clock;
use crate::workflows::admissions::domain::{
    ActorId, ApplicantStatus, ApplicationId, AuditAction, CheckoutSessionRef,
    EnrollmentApplication, Money, PaymentRecord, PaymentRecordId, PaymentStatus, Student,
    StudentId,
};
use crate::workflows::admissions::enrollment::load_application;
use crate::workflows::admissions::error::{AdmissionsError, AdmissionsResult};
use crate::workflows::admissions::registry::{self, TransitionContext};
use crate::workflows::admissions::sequence;
use crate::workflows::admissions::store::{run_blocking, AdmissionsStore};

/// Checkout and reconciliation settings.
#[derive(Debug, Clone)]
pub struct PaymentSettings {
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    pub session_ttl: ChronoDuration,
    /// Upper bound on the gateway probe made before reusing a stored session.
    pub probe_timeout: Duration,
}

/// What handling a verified gateway event did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// The applicant is now an enrolled student.
    Promoted {
        application_id: ApplicationId,
        student_id: StudentId,
        control_number: String,
    },
    /// Replay of an event already reconciled.
    AlreadyPaid { application_id: ApplicationId },
    /// Session completed without settled funds; a later event will settle it.
    AwaitingSettlement { session_id: String },
    SessionCleared { application_id: ApplicationId },
    Ignored { event_type: String },
    /// Could not be matched to an application awaiting payment. Logged for manual follow-up.
    Unmatched { reason: String },
}

/// Creates checkout sessions and reconciles gateway events.
pub struct PaymentService<S, G> {
    store: Arc<S>,
    gateway: Arc<G>,
    verifier: WebhookVerifier,
    clock: Arc<dyn Clock>,
    settings: PaymentSettings,
}

impl<S, G> PaymentService<S, G>
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
{
    pub fn new(
        store: Arc<S>,
        gateway: Arc<G>,
        verifier: WebhookVerifier,
        clock: Arc<dyn Clock>,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            verifier,
            clock,
            settings,
        }
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    async fn with_store<T, F>(&self, work: F) -> AdmissionsResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> AdmissionsResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        run_blocking(move || work(&store)).await
    }

    /// Returns a payable checkout session for a pending application, reusing the stored one
    /// while the gateway still reports it unpaid.
    pub async fn create_checkout_session(
        &self,
        application_id: &ApplicationId,
    ) -> AdmissionsResult<CheckoutSessionRef> {
        let (application, email) = self
            .with_store({
                let application_id = application_id.clone();
                move |store| {
                    store.read(|tx| {
                        let application = load_application(tx, &application_id)?;
                        let applicant = registry::load(tx, &application.applicant_id)?;
                        ensure_payable(&application, applicant.status)?;
                        Ok::<_, AdmissionsError>((application, applicant.email))
                    })
                }
            })
            .await?;

        if let Some(existing) = &application.checkout_session {
            if let Some(reusable) = self.probe(existing).await? {
                return Ok(reusable);
            }
        }

        let now = self.clock.now();
        let session = self
            .gateway
            .create_checkout_session(CheckoutRequest {
                application_id: application.id.clone(),
                amount: application.amount_due,
                currency: self.settings.currency.clone(),
                description: format!("Enrollment fee {}", application.program_id),
                customer_email: Some(email),
                success_url: self.settings.success_url.clone(),
                cancel_url: self.settings.cancel_url.clone(),
                expires_at: now + self.settings.session_ttl,
            })
            .await?;

        let reference = CheckoutSessionRef {
            session_id: session.id,
            url: session.url,
            expires_at: session.expires_at,
        };

        self.with_store({
            let application_id = application_id.clone();
            let reference = reference.clone();
            let clock = Arc::clone(&self.clock);
            move |store| {
                store.transaction(|tx| {
                    let mut application = load_application(tx, &application_id)?;
                    let applicant = registry::load(tx, &application.applicant_id)?;
                    ensure_payable(&application, applicant.status)?;
                    application.checkout_session = Some(reference);
                    application.updated_at = clock.now();
                    tx.update_application(&application)?;
                    Ok::<_, AdmissionsError>(())
                })
            }
        })
        .await?;

        info!(
            application_id = %application_id,
            session_id = %reference.session_id,
            "checkout session created"
        );
        Ok(reference)
    }

    /// `Ok(Some)` reuses the stored session, `Ok(None)` asks for a fresh one.
    async fn probe(
        &self,
        existing: &CheckoutSessionRef,
    ) -> AdmissionsResult<Option<CheckoutSessionRef>> {
        if matches!(existing.expires_at, Some(expires_at) if expires_at <= self.clock.now()) {
            return Ok(None);
        }

        let lookup = self.gateway.retrieve_session(&existing.session_id);
        match tokio::time::timeout(self.settings.probe_timeout, lookup).await {
            Ok(Ok(session)) if session.is_payable() => Ok(Some(existing.clone())),
            Ok(Ok(session)) if session.payment_status == SessionPaymentStatus::Paid => {
                Err(AdmissionsError::precondition(format!(
                    "checkout session {} is already paid; awaiting confirmation",
                    session.id
                )))
            }
            Ok(Ok(_)) => Ok(None),
            Ok(Err(err)) => {
                warn!(
                    session_id = %existing.session_id,
                    error = %err,
                    "session probe failed; reusing stored session"
                );
                Ok(Some(existing.clone()))
            }
            Err(_) => {
                warn!(
                    session_id = %existing.session_id,
                    timeout_ms = self.settings.probe_timeout.as_millis() as u64,
                    "session probe timed out; reusing stored session"
                );
                Ok(Some(existing.clone()))
            }
        }
    }

    /// Verifies and applies one gateway event. Safe to call repeatedly with the same event.
    ///
    /// An `Err` after verification means nothing was applied and the gateway should redeliver.
    pub async fn handle_gateway_event(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> AdmissionsResult<WebhookOutcome> {
        let event = signature
            .ok_or(EventError::MissingSignature)
            .and_then(|header| self.verifier.verify(payload, header, self.clock.now()))
            .map_err(|err| {
                warn!(error = %err, "rejected gateway event");
                AdmissionsError::from(err)
            })?;

        let outcome = match event.kind {
            EventKind::SessionCompleted(session) => {
                if session.payment_status == SessionPaymentStatus::Paid {
                    self.promote(&session).await.map_err(|err| {
                        error!(
                            event_id = %event.id,
                            session_id = %session.session_id,
                            error = %err,
                            "failed to promote paid application"
                        );
                        err
                    })?
                } else {
                    WebhookOutcome::AwaitingSettlement {
                        session_id: session.session_id,
                    }
                }
            }
            EventKind::SessionExpired(session) => {
                self.clear_session(session, event.event_type.clone()).await?
            }
            EventKind::Other => WebhookOutcome::Ignored {
                event_type: event.event_type.clone(),
            },
        };

        match &outcome {
            WebhookOutcome::Promoted {
                application_id,
                student_id,
                control_number,
            } => info!(
                event_id = %event.id,
                application_id = %application_id,
                student_id = %student_id,
                control_number = %control_number,
                "applicant enrolled"
            ),
            WebhookOutcome::Unmatched { reason } => {
                warn!(event_id = %event.id, reason = %reason, "unmatched gateway event")
            }
            other => info!(event_id = %event.id, outcome = ?other, "gateway event handled"),
        }
        Ok(outcome)
    }

    async fn promote(&self, session: &SessionEvent) -> AdmissionsResult<WebhookOutcome> {
        let Some(application_id) = session.application_id.clone() else {
            return Ok(WebhookOutcome::Unmatched {
                reason: format!("session {} carries no application reference", session.session_id),
            });
        };

        let session = session.clone();
        let clock = Arc::clone(&self.clock);
        let default_currency = self.settings.currency.clone();
        self.with_store(move |store| {
            store.transaction(|tx| {
                let Some(mut application) = tx.application(&application_id)? else {
                    return Ok(WebhookOutcome::Unmatched {
                        reason: format!("unknown application {application_id}"),
                    });
                };
                if application.payment_status == PaymentStatus::Paid
                    || tx.payment_by_session(&session.session_id)?.is_some()
                {
                    return Ok(WebhookOutcome::AlreadyPaid { application_id });
                }

                let mut applicant = registry::load(tx, &application.applicant_id)?;
                if applicant.status != ApplicantStatus::PendingPayment {
                    return Ok(WebhookOutcome::Unmatched {
                        reason: format!(
                            "applicant {} is {}, not pending_payment",
                            applicant.id,
                            applicant.status.label()
                        ),
                    });
                }

                let now = clock.now();
                let control_number = sequence::next_control_number(tx, now.year(), now.month())?;
                let ticket_id = tx.ticket_for_applicant(&applicant.id)?.map(|ticket| ticket.id);
                let student = Student {
                    id: StudentId::generate(),
                    control_number: control_number.clone(),
                    applicant_id: applicant.id.clone(),
                    application_id: application.id.clone(),
                    ticket_id,
                    full_name: application.personal.full_name.clone(),
                    national_id: application.personal.national_id.clone(),
                    email: application.personal.email.clone(),
                    program_id: application.program_id.clone(),
                    shift: application.shift,
                    section: application.section.clone(),
                    enrolled_at: now,
                };
                tx.insert_student(&student)?;

                application.payment_status = PaymentStatus::Paid;
                application.paid_at = Some(now);
                application.student_id = Some(student.id.clone());
                application.updated_at = now;
                tx.update_application(&application)?;

                registry::transition(
                    tx,
                    &mut applicant,
                    ApplicantStatus::Enrolled,
                    TransitionContext {
                        action: AuditAction::PaymentConfirmed,
                        actor: &ActorId::system(),
                        reason: None,
                        at: now,
                    },
                )?;

                tx.insert_payment(&PaymentRecord {
                    id: PaymentRecordId::generate(),
                    application_id: application.id.clone(),
                    applicant_id: applicant.id.clone(),
                    session_id: session.session_id.clone(),
                    transaction_id: session.payment_intent.clone(),
                    amount: session
                        .amount_total
                        .map(Money::from_cents)
                        .unwrap_or(application.amount_due),
                    currency: session
                        .currency
                        .clone()
                        .unwrap_or_else(|| default_currency.clone()),
                    paid_at: now,
                })?;

                Ok::<_, AdmissionsError>(WebhookOutcome::Promoted {
                    application_id,
                    student_id: student.id,
                    control_number,
                })
            })
        })
        .await
    }

    async fn clear_session(
        &self,
        session: SessionEvent,
        event_type: String,
    ) -> AdmissionsResult<WebhookOutcome> {
        let Some(application_id) = session.application_id.clone() else {
            return Ok(WebhookOutcome::Unmatched {
                reason: format!("session {} carries no application reference", session.session_id),
            });
        };

        let clock = Arc::clone(&self.clock);
        self.with_store(move |store| {
            store.transaction(|tx| {
                let Some(mut application) = tx.application(&application_id)? else {
                    return Ok(WebhookOutcome::Unmatched {
                        reason: format!("unknown application {application_id}"),
                    });
                };
                let is_live = application
                    .checkout_session
                    .as_ref()
                    .is_some_and(|current| current.session_id == session.session_id);
                if !is_live || application.payment_status == PaymentStatus::Paid {
                    return Ok(WebhookOutcome::Ignored { event_type });
                }

                application.checkout_session = None;
                application.updated_at = clock.now();
                tx.update_application(&application)?;
                Ok::<_, AdmissionsError>(WebhookOutcome::SessionCleared { application_id })
            })
        })
        .await
    }

    /// Refunds the latest settled payment of an application; the full amount when `amount` is
    /// omitted. Local records are not changed.
    pub async fn refund(
        &self,
        application_id: &ApplicationId,
        amount: Option<Money>,
        actor: &ActorId,
    ) -> AdmissionsResult<Refund> {
        let payment = self
            .with_store({
                let application_id = application_id.clone();
                move |store| {
                    store.read(|tx| {
                        load_application(tx, &application_id)?;
                        let payments = tx.payments_for_application(&application_id)?;
                        payments.into_iter().last().ok_or_else(|| {
                            AdmissionsError::precondition(format!(
                                "application {application_id} has no settled payment"
                            ))
                        })
                    })
                }
            })
            .await?;

        if let Some(amount) = amount {
            if amount.cents() <= 0 || amount > payment.amount {
                return Err(AdmissionsError::validation(format!(
                    "refund amount must be between 0.01 and {}",
                    payment.amount
                )));
            }
        }
        let payment_intent = payment.transaction_id.clone().ok_or_else(|| {
            AdmissionsError::precondition(format!(
                "payment {} has no gateway transaction id",
                payment.id
            ))
        })?;

        let refund = self
            .gateway
            .create_refund(RefundRequest {
                application_id: application_id.clone(),
                payment_intent,
                amount,
            })
            .await?;

        info!(
            application_id = %application_id,
            refund_id = %refund.id,
            status = %refund.status,
            actor = %actor,
            "refund requested"
        );
        Ok(refund)
    }
}

fn ensure_payable(
    application: &EnrollmentApplication,
    applicant_status: ApplicantStatus,
) -> AdmissionsResult<()> {
    if application.payment_status != PaymentStatus::Pending {
        return Err(AdmissionsError::precondition(format!(
            "application {} is already paid",
            application.id
        )));
    }
    if applicant_status != ApplicantStatus::PendingPayment {
        return Err(AdmissionsError::precondition(format!(
            "applicant is {}, not pending_payment",
            applicant_status.label()
        )));
    }
    Ok(())
}
