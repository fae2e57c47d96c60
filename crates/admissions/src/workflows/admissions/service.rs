use std::sync::Arc;

use super::clock::Clock;
use super::documents::DocumentStorage;
use super::enrollment::{EnrollmentService, FeeSchedule};
use super::payments::{PaymentGateway, PaymentService, PaymentSettings, WebhookVerifier};
use super::registry::ApplicantRegistry;
use super::retention::{RetentionSettings, RetentionSweeper};
use super::store::AdmissionsStore;
use super::tickets::ExamTicketService;
use super::waitlist::WaitlistAdjudicator;

/// Component settings, built once from configuration at startup.
#[derive(Debug, Clone)]
pub struct AdmissionsSettings {
    pub fees: FeeSchedule,
    pub payments: PaymentSettings,
    pub webhook: WebhookVerifier,
    pub retention: RetentionSettings,
    /// Include internal error detail in responses (development only).
    pub expose_internal_errors: bool,
}

/// Every admissions component wired to one store, gateway, and document storage.
pub struct AdmissionsService<S, G, D> {
    pub registry: ApplicantRegistry<S>,
    pub tickets: ExamTicketService<S>,
    pub waitlist: WaitlistAdjudicator<S>,
    pub enrollment: EnrollmentService<S>,
    pub payments: PaymentService<S, G>,
    pub retention: Arc<RetentionSweeper<S, D>>,
    expose_internal_errors: bool,
}

impl<S, G, D> AdmissionsService<S, G, D>
where
    S: AdmissionsStore + 'static,
    G: PaymentGateway + 'static,
    D: DocumentStorage + 'static,
{
    pub fn new(
        store: Arc<S>,
        gateway: Arc<G>,
        documents: Arc<D>,
        clock: Arc<dyn Clock>,
        settings: AdmissionsSettings,
    ) -> Self {
        Self {
            registry: ApplicantRegistry::new(Arc::clone(&store)),
            tickets: ExamTicketService::new(Arc::clone(&store), Arc::clone(&clock)),
            waitlist: WaitlistAdjudicator::new(Arc::clone(&store), Arc::clone(&clock)),
            enrollment: EnrollmentService::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                settings.fees,
            ),
            payments: PaymentService::new(
                Arc::clone(&store),
                gateway,
                settings.webhook,
                Arc::clone(&clock),
                settings.payments,
            ),
            retention: Arc::new(RetentionSweeper::new(
                store,
                documents,
                clock,
                settings.retention,
            )),
            expose_internal_errors: settings.expose_internal_errors,
        }
    }

    pub fn expose_internal_errors(&self) -> bool {
        self.expose_internal_errors
    }
}
