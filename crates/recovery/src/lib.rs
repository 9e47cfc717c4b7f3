// Recovery crate clippy configuration
#![allow(clippy::too_many_arguments)] // Service constructors wire many collaborators
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Rebill recovery engine
//!
//! The durable core of the payment-recovery product: a database-backed task
//! queue with exactly-once claim semantics, a typed-task worker loop, a
//! deduplicating webhook ingress with computed retry schedules, a quota and
//! usage ledger with atomic daily rollups, a self-healing janitor, and an
//! idempotent usage-reporting pipeline.
//!
//! Coordination across replicas happens entirely in the store: the
//! skip-locked claim and the idempotency insert are the only primitives; no
//! in-memory locks, no in-memory queues.

pub mod digest;
pub mod emails;
pub mod error;
pub mod events;
pub mod janitor;
pub mod merchants;
pub mod metered;
pub mod plans;
pub mod provider;
pub mod quota;
pub mod tasks;
pub mod templates;
pub mod usage;
pub mod watchdog;
pub mod webhooks;
pub mod worker;

#[cfg(test)]
mod edge_case_tests;

pub use digest::DigestService;
pub use emails::{EmailConfig, EmailService};
pub use error::{RecoveryError, RecoveryResult};
pub use events::EventLedger;
pub use janitor::Janitor;
pub use merchants::{Merchant, MerchantStore, SettingsUpdate, SYSTEM_MERCHANT_ID};
pub use metered::{MeterReporter, ReportCycle};
pub use plans::{plan_for, Plan};
pub use provider::{Invoice, OAuthGrant, ProviderClient, ProviderConfig, ProviderError};
pub use quota::{QuotaCheck, QuotaService};
pub use tasks::{Task, TaskQueue, TaskStatus, TaskType};
pub use templates::{sanitize_html, EmailTemplate, TemplateStore};
pub use usage::{UsageLedger, UsageLog, WeeklySummary};
pub use watchdog::Watchdog;
pub use webhooks::{verify_signature, ProviderEvent, WebhookHandler, WebhookOutcome};
pub use worker::TaskWorker;

use sqlx::PgPool;

use rebill_shared::TokenCipher;

/// Aggregate service wiring every recovery component onto one pool.
#[derive(Clone)]
pub struct RecoveryService {
    pub provider: ProviderClient,
    pub merchants: MerchantStore,
    pub tasks: TaskQueue,
    pub usage: UsageLedger,
    pub events: EventLedger,
    pub templates: TemplateStore,
    pub quota: QuotaService,
    pub emails: EmailService,
    pub webhooks: WebhookHandler,
    pub metered: MeterReporter,
    pub digest: DigestService,
}

impl RecoveryService {
    pub fn new(
        pool: PgPool,
        cipher: TokenCipher,
        provider_config: ProviderConfig,
        email_config: EmailConfig,
    ) -> RecoveryResult<Self> {
        let provider = ProviderClient::new(provider_config)?;
        let merchants = MerchantStore::new(pool.clone(), cipher);
        let tasks = TaskQueue::new(pool.clone());
        let usage = UsageLedger::new(pool.clone());
        let events = EventLedger::new(pool.clone());
        let templates = TemplateStore::new(pool);
        let quota = QuotaService::new(usage.clone(), tasks.clone());
        let emails = EmailService::new(email_config);
        let webhooks = WebhookHandler::new(
            merchants.clone(),
            tasks.clone(),
            usage.clone(),
            events.clone(),
        );
        let metered = MeterReporter::new(provider.clone(), merchants.clone(), usage.clone());
        let digest = DigestService::new(merchants.clone(), usage.clone(), emails.clone());

        Ok(Self {
            provider,
            merchants,
            tasks,
            usage,
            events,
            templates,
            quota,
            emails,
            webhooks,
            metered,
            digest,
        })
    }

    /// Build the service from environment variables.
    pub fn from_env(pool: PgPool, cipher: TokenCipher) -> RecoveryResult<Self> {
        Self::new(
            pool,
            cipher,
            ProviderConfig::from_env()?,
            EmailConfig::from_env(),
        )
    }

    /// The worker loop bound to this service's collaborators.
    pub fn worker(&self) -> TaskWorker {
        TaskWorker::new(
            self.tasks.clone(),
            self.merchants.clone(),
            self.usage.clone(),
            self.templates.clone(),
            self.emails.clone(),
            self.provider.clone(),
            self.metered.clone(),
            self.digest.clone(),
        )
    }

    pub fn watchdog(&self) -> Watchdog {
        Watchdog::new(self.merchants.clone(), self.tasks.clone())
    }
}
