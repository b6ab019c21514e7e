//! Main ledger orchestration layer
//!
//! This module ties together storage, the single-writer actor, the tier
//! resolver, and metrics into a high-level API for the payment core.
//!
//! # Example
//!
//! ```no_run
//! use payment_ledger::{Config, PaymentLedger};
//!
//! #[tokio::main]
//! async fn main() -> payment_ledger::Result<()> {
//!     let config = Config::default();
//!     let ledger = PaymentLedger::open(config).await?;
//!
//!     // Admit webhook deliveries, reserve unlock slots, grant entitlements...
//!
//!     ledger.shutdown().await?;
//!     Ok(())
//! }
//! ```

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle},
    metrics::Metrics,
    tiers::TierResolver,
    types::{
        AdmitOutcome, AttemptStatus, Entitlement, GrantOutcome, GrantRequest, JobRun,
        ProviderRefs, ReserveOutcome, SettleOutcome, Subscription, SweepReport, Tier, Transaction,
        TransactionDraft, TransactionResolution, UnlockAttempt, WebhookDelivery, WebhookEvent,
    },
    Config, Error, Result, Storage,
};
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Main payment ledger interface
pub struct PaymentLedger {
    /// Actor handle for serialized mutations
    handle: LedgerHandle,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    /// Tier cache
    tiers: TierResolver,

    /// Prometheus metrics
    metrics: Metrics,
}

impl PaymentLedger {
    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);

        let handle = spawn_ledger_actor(
            storage.clone(),
            config.quota.daily_unlock_limit,
            config.webhook.max_attempts,
        );

        let tiers = TierResolver::new(
            storage.clone(),
            Duration::from_secs(config.tier_cache.ttl_secs),
        );

        let metrics = Metrics::new()?;

        Ok(Self {
            handle,
            storage,
            tiers,
            metrics,
        })
    }

    // Webhook intake guard

    /// Admit a provider webhook delivery
    ///
    /// Exactly one caller per delivery episode receives `Admitted`; that
    /// caller executes side effects and then calls [`complete`](Self::complete).
    pub async fn admit(&self, delivery: WebhookDelivery) -> Result<AdmitOutcome> {
        let provider_event_id = delivery.provider_event_id.clone();
        let outcome = self.handle.admit_webhook(delivery).await?;

        match &outcome {
            AdmitOutcome::Admitted(event) => {
                self.metrics.webhooks_admitted.inc();
                tracing::info!(
                    provider_event_id = %event.provider_event_id,
                    event_type = %event.event_type,
                    attempt = event.attempt_count,
                    "Webhook admitted"
                );
            }
            AdmitOutcome::AlreadyProcessed(_) | AdmitOutcome::Conflict(_) => {
                // Expected under at-least-once delivery, not an error
                self.metrics.webhooks_duplicate.inc();
                tracing::debug!(
                    provider_event_id = %provider_event_id,
                    "Duplicate webhook delivery suppressed"
                );
            }
            AdmitOutcome::DeadLettered(event) => {
                self.metrics.webhooks_dead_lettered.inc();
                tracing::error!(
                    provider_event_id = %event.provider_event_id,
                    attempts = event.attempt_count,
                    "Webhook exhausted its attempt bound, routing to dead-letter"
                );
            }
        }

        Ok(outcome)
    }

    /// Complete an admitted webhook episode
    pub async fn complete(&self, provider_event_id: &str, success: bool) -> Result<WebhookEvent> {
        self.handle
            .complete_webhook(provider_event_id.to_string(), success)
            .await
    }

    /// Get a webhook event by provider id
    pub fn get_webhook(&self, provider_event_id: &str) -> Result<Option<WebhookEvent>> {
        self.storage.get_webhook(provider_event_id)
    }

    // Unlock attempt limiter

    /// Reserve a slot against the user's daily unlock quota
    pub async fn reserve_unlock(
        &self,
        user_id: Uuid,
        opportunity_id: Uuid,
        date: NaiveDate,
    ) -> Result<ReserveOutcome> {
        let outcome = self
            .handle
            .reserve_unlock(user_id, opportunity_id, date)
            .await?;

        if let ReserveOutcome::LimitExceeded { used, limit } = &outcome {
            self.metrics.quota_rejections.inc();
            tracing::info!(
                user_id = %user_id,
                used = used,
                limit = limit,
                "Daily unlock quota exceeded"
            );
        }

        Ok(outcome)
    }

    /// Mark a reserved attempt succeeded, attaching its payment reference
    pub async fn mark_unlock_succeeded(
        &self,
        attempt_id: Uuid,
        payment_reference: &str,
    ) -> Result<UnlockAttempt> {
        let result = self
            .handle
            .mark_attempt_succeeded(attempt_id, payment_reference.to_string())
            .await;

        if let Err(Error::ConflictingReference { reference, holder }) = &result {
            tracing::error!(
                attempt_id = %attempt_id,
                reference = %reference,
                holder = %holder,
                "Payment reference already funds another attempt"
            );
        }

        result
    }

    /// Mark a reserved attempt failed, freeing the day's slot
    pub async fn mark_unlock_failed(&self, attempt_id: Uuid) -> Result<UnlockAttempt> {
        self.handle
            .mark_attempt_closed(attempt_id, AttemptStatus::Failed)
            .await
    }

    /// Cancel a reserved attempt, freeing the day's slot
    pub async fn mark_unlock_canceled(&self, attempt_id: Uuid) -> Result<UnlockAttempt> {
        self.handle
            .mark_attempt_closed(attempt_id, AttemptStatus::Canceled)
            .await
    }

    /// Get an unlock attempt by id
    pub fn get_attempt(&self, attempt_id: Uuid) -> Result<UnlockAttempt> {
        self.storage.get_attempt(attempt_id)
    }

    /// All attempts for a (user, UTC date) bucket
    pub fn attempts_for_day(&self, user_id: Uuid, date: NaiveDate) -> Result<Vec<UnlockAttempt>> {
        self.storage.attempts_for_day(user_id, date)
    }

    // Entitlement ledger

    /// Grant access to an opportunity; repeated grants for a pair are no-ops
    pub async fn grant(&self, request: GrantRequest) -> Result<GrantOutcome> {
        let outcome = self.handle.grant_entitlement(request).await?;

        match &outcome {
            GrantOutcome::Granted(entitlement) => {
                self.metrics.entitlements_granted.inc();
                tracing::info!(
                    entitlement_id = %entitlement.entitlement_id,
                    user_id = %entitlement.user_id,
                    opportunity_id = %entitlement.opportunity_id,
                    method = ?entitlement.method,
                    "Entitlement granted"
                );
            }
            GrantOutcome::AlreadyGranted(entitlement) => {
                tracing::debug!(
                    entitlement_id = %entitlement.entitlement_id,
                    "Grant suppressed, pair already entitled"
                );
            }
        }

        Ok(outcome)
    }

    /// Add deep-dive access to an existing entitlement (idempotent)
    pub async fn add_deep_dive(
        &self,
        entitlement_id: Uuid,
        payment_reference: Option<String>,
    ) -> Result<Entitlement> {
        self.handle
            .add_deep_dive(entitlement_id, payment_reference)
            .await
    }

    /// Check whether a user holds an entitlement for an opportunity
    pub fn has_access(&self, user_id: Uuid, opportunity_id: Uuid) -> Result<bool> {
        Ok(self
            .storage
            .entitlement_id_for(user_id, opportunity_id)?
            .is_some())
    }

    /// Check whether a user holds deep-dive access for an opportunity
    pub fn has_deep_dive(&self, user_id: Uuid, opportunity_id: Uuid) -> Result<bool> {
        match self.storage.entitlement_id_for(user_id, opportunity_id)? {
            Some(entitlement_id) => Ok(self.storage.get_entitlement(entitlement_id)?.deep_dive),
            None => Ok(false),
        }
    }

    /// Get an entitlement by id
    pub fn get_entitlement(&self, entitlement_id: Uuid) -> Result<Entitlement> {
        self.storage.get_entitlement(entitlement_id)
    }

    /// Get the entitlement for a (user, opportunity) pair, if any
    pub fn entitlement_for(
        &self,
        user_id: Uuid,
        opportunity_id: Uuid,
    ) -> Result<Option<Entitlement>> {
        match self.storage.entitlement_id_for(user_id, opportunity_id)? {
            Some(id) => Ok(Some(self.storage.get_entitlement(id)?)),
            None => Ok(None),
        }
    }

    // Transaction ledger

    /// Open a pending transaction
    pub async fn open_transaction(&self, draft: TransactionDraft) -> Result<Transaction> {
        self.handle.open_transaction(draft).await
    }

    /// Settle a transaction; settling an already-terminal row is a no-op
    pub async fn settle(
        &self,
        transaction_id: Uuid,
        resolution: TransactionResolution,
        provider_refs: ProviderRefs,
    ) -> Result<SettleOutcome> {
        let result = self
            .handle
            .settle_transaction(transaction_id, resolution, provider_refs)
            .await;

        if let Err(Error::ConflictingReference { reference, holder }) = &result {
            tracing::error!(
                transaction_id = %transaction_id,
                reference = %reference,
                holder = %holder,
                "Provider reference already claimed by another transaction"
            );
        }

        result
    }

    /// Get a transaction by id
    pub fn get_transaction(&self, transaction_id: Uuid) -> Result<Transaction> {
        self.storage.get_transaction(transaction_id)
    }

    /// Release matured escrow holds, at most `limit` rows, earliest release first
    pub async fn release_matured(&self, limit: usize, now: DateTime<Utc>) -> Result<SweepReport> {
        let timer = self.metrics.sweep_duration.start_timer();
        let report = self.handle.release_matured(now, limit).await?;
        timer.observe_duration();

        self.metrics.escrow_released.inc_by(report.released);

        Ok(report)
    }

    // Subscriptions and tiers

    /// Insert or update a user's subscription row
    ///
    /// This is the sole subscription mutation path in this core; it
    /// invalidates the tier cache so readers never serve a stale tier past
    /// the write.
    pub async fn upsert_subscription(&self, subscription: Subscription) -> Result<()> {
        let user_id = subscription.user_id;
        self.handle.upsert_subscription(subscription).await?;
        self.tiers.invalidate(user_id);
        Ok(())
    }

    /// Resolve a user's current tier (cached)
    pub fn resolve_tier(&self, user_id: Uuid) -> Result<Tier> {
        self.tiers.resolve(user_id)
    }

    // Scheduler bookkeeping

    /// Record a background job run
    pub async fn record_job_run(&self, run: JobRun) -> Result<()> {
        self.handle.record_job_run(run).await
    }

    /// Most recent runs of a job, newest first
    pub fn recent_job_runs(&self, job_name: &str, limit: usize) -> Result<Vec<JobRun>> {
        self.storage.recent_job_runs(job_name, limit)
    }

    /// Try to acquire the lease guarding a background job
    pub async fn acquire_job_lease(
        &self,
        job_name: &str,
        owner: &str,
        ttl: chrono::Duration,
    ) -> Result<bool> {
        self.handle
            .acquire_lease(job_name.to_string(), owner.to_string(), ttl, Utc::now())
            .await
    }

    /// Release a held job lease
    pub async fn release_job_lease(&self, job_name: &str, owner: &str) -> Result<()> {
        self.handle
            .release_lease(job_name.to_string(), owner.to_string())
            .await
    }

    /// Get metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Shutdown ledger
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Currency, TransactionKind, TransactionMetadata, TransactionStatus, UnlockMethod};
    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;

    async fn create_test_ledger() -> (PaymentLedger, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.quota.daily_unlock_limit = 2;

        (PaymentLedger::open(config).await.unwrap(), temp_dir)
    }

    fn grant_request(user_id: Uuid, opportunity_id: Uuid) -> GrantRequest {
        GrantRequest {
            user_id,
            opportunity_id,
            method: UnlockMethod::PayPerUnlock,
            amount_paid: Decimal::new(4900, 2),
            payment_reference: Some("pi_grant".to_string()),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_ledger_open_and_shutdown() {
        let (ledger, _temp) = create_test_ledger().await;
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reserve_until_limit_then_free_slot() {
        let (ledger, _temp) = create_test_ledger().await;
        let user = Uuid::new_v4();
        let today = Utc::now().date_naive();

        let first = ledger
            .reserve_unlock(user, Uuid::new_v4(), today)
            .await
            .unwrap();
        let ReserveOutcome::Reserved(attempt) = first else {
            panic!("Expected reservation");
        };

        ledger
            .reserve_unlock(user, Uuid::new_v4(), today)
            .await
            .unwrap();

        // Limit is 2
        let third = ledger
            .reserve_unlock(user, Uuid::new_v4(), today)
            .await
            .unwrap();
        assert!(matches!(
            third,
            ReserveOutcome::LimitExceeded { used: 2, limit: 2 }
        ));
        assert_eq!(ledger.metrics().quota_rejections.get(), 1);

        // Failing one attempt frees its slot for the same day
        ledger.mark_unlock_failed(attempt.attempt_id).await.unwrap();
        let retry = ledger
            .reserve_unlock(user, Uuid::new_v4(), today)
            .await
            .unwrap();
        assert!(matches!(retry, ReserveOutcome::Reserved(_)));

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_payment_reference_cannot_fund_two_attempts() {
        let (ledger, _temp) = create_test_ledger().await;
        let user = Uuid::new_v4();
        let today = Utc::now().date_naive();

        let ReserveOutcome::Reserved(a) = ledger
            .reserve_unlock(user, Uuid::new_v4(), today)
            .await
            .unwrap()
        else {
            panic!("Expected reservation");
        };
        let ReserveOutcome::Reserved(b) = ledger
            .reserve_unlock(user, Uuid::new_v4(), today)
            .await
            .unwrap()
        else {
            panic!("Expected reservation");
        };

        ledger
            .mark_unlock_succeeded(a.attempt_id, "pi_1")
            .await
            .unwrap();

        // Same reference applied twice to the same attempt is a no-op
        let again = ledger
            .mark_unlock_succeeded(a.attempt_id, "pi_1")
            .await
            .unwrap();
        assert_eq!(again.status, AttemptStatus::Succeeded);

        // A different attempt claiming the same reference is rejected
        let conflict = ledger.mark_unlock_succeeded(b.attempt_id, "pi_1").await;
        assert!(matches!(
            conflict,
            Err(Error::ConflictingReference { .. })
        ));

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_grant_is_idempotent_per_pair() {
        let (ledger, _temp) = create_test_ledger().await;
        let user = Uuid::new_v4();
        let opportunity = Uuid::new_v4();

        let first = ledger.grant(grant_request(user, opportunity)).await.unwrap();
        let GrantOutcome::Granted(entitlement) = first else {
            panic!("Expected grant");
        };

        let second = ledger.grant(grant_request(user, opportunity)).await.unwrap();
        let GrantOutcome::AlreadyGranted(existing) = second else {
            panic!("Expected no-op");
        };
        assert_eq!(existing.entitlement_id, entitlement.entitlement_id);
        assert_eq!(ledger.metrics().entitlements_granted.get(), 1);

        assert!(ledger.has_access(user, opportunity).unwrap());
        assert!(!ledger.has_access(user, Uuid::new_v4()).unwrap());

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_deep_dive_is_additive_flag() {
        let (ledger, _temp) = create_test_ledger().await;
        let user = Uuid::new_v4();
        let opportunity = Uuid::new_v4();

        let GrantOutcome::Granted(entitlement) =
            ledger.grant(grant_request(user, opportunity)).await.unwrap()
        else {
            panic!("Expected grant");
        };
        assert!(!ledger.has_deep_dive(user, opportunity).unwrap());

        let updated = ledger
            .add_deep_dive(entitlement.entitlement_id, Some("pi_dd".to_string()))
            .await
            .unwrap();
        assert!(updated.deep_dive);
        assert!(updated.deep_dive_at.is_some());

        // Idempotent re-application keeps the original stamp
        let again = ledger
            .add_deep_dive(entitlement.entitlement_id, Some("pi_other".to_string()))
            .await
            .unwrap();
        assert_eq!(again.deep_dive_at, updated.deep_dive_at);
        assert_eq!(again.deep_dive_reference, updated.deep_dive_reference);

        assert!(ledger.has_deep_dive(user, opportunity).unwrap());
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_settle_is_idempotent_and_refs_unique() {
        let (ledger, _temp) = create_test_ledger().await;

        let draft = TransactionDraft {
            kind: TransactionKind::PayPerUnlock,
            user_id: Uuid::new_v4(),
            opportunity_id: Some(Uuid::new_v4()),
            expert_id: None,
            amount_cents: 4900,
            currency: Currency::USD,
            metadata: TransactionMetadata::None,
        };
        let txn = ledger.open_transaction(draft.clone()).await.unwrap();
        assert_eq!(txn.status, TransactionStatus::Pending);

        let refs = ProviderRefs {
            payment_intent_id: Some("pi_99".to_string()),
            ..Default::default()
        };

        let settled = ledger
            .settle(txn.transaction_id, TransactionResolution::Succeeded, refs.clone())
            .await
            .unwrap();
        assert!(matches!(settled, SettleOutcome::Settled(_)));

        // Re-settlement is a no-op
        let again = ledger
            .settle(txn.transaction_id, TransactionResolution::Failed, refs.clone())
            .await
            .unwrap();
        let SettleOutcome::AlreadySettled(row) = again else {
            panic!("Expected no-op");
        };
        assert_eq!(row.status, TransactionStatus::Succeeded);

        // A second transaction claiming the same payment intent is rejected
        let other = ledger.open_transaction(draft).await.unwrap();
        let conflict = ledger
            .settle(other.transaction_id, TransactionResolution::Succeeded, refs)
            .await;
        assert!(matches!(conflict, Err(Error::ConflictingReference { .. })));

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_transaction_rejects_bad_drafts() {
        let (ledger, _temp) = create_test_ledger().await;

        let zero_amount = TransactionDraft {
            kind: TransactionKind::MicroPayment,
            user_id: Uuid::new_v4(),
            opportunity_id: None,
            expert_id: None,
            amount_cents: 0,
            currency: Currency::USD,
            metadata: TransactionMetadata::None,
        };
        assert!(matches!(
            ledger.open_transaction(zero_amount).await,
            Err(Error::InvalidTransaction(_))
        ));

        let escrow_on_micro = TransactionDraft {
            kind: TransactionKind::MicroPayment,
            user_id: Uuid::new_v4(),
            opportunity_id: None,
            expert_id: None,
            amount_cents: 1000,
            currency: Currency::USD,
            metadata: TransactionMetadata::EscrowShare {
                split_percent: Decimal::new(100, 1),
                release_at: Utc::now(),
                released_at: None,
            },
        };
        assert!(matches!(
            ledger.open_transaction(escrow_on_micro).await,
            Err(Error::InvalidTransaction(_))
        ));

        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_subscription_invalidates_tier_cache() {
        let (ledger, _temp) = create_test_ledger().await;
        let user = Uuid::new_v4();
        let now = Utc::now();

        assert_eq!(ledger.resolve_tier(user).unwrap(), Tier::Free);

        ledger
            .upsert_subscription(Subscription {
                user_id: user,
                tier: Tier::Pro,
                current_period_end: now + ChronoDuration::days(30),
                updated_at: now,
            })
            .await
            .unwrap();

        // Visible immediately despite the TTL cache
        assert_eq!(ledger.resolve_tier(user).unwrap(), Tier::Pro);

        ledger.shutdown().await.unwrap();
    }
}
