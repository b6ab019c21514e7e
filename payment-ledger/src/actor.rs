//! Actor-based concurrency for the payment ledger
//!
//! This module implements the single-writer pattern using Tokio actors:
//! - One logical writer task is the sole arbiter of every cross-request
//!   invariant (webhook idempotency, daily quota, one-entitlement-per-pair,
//!   one-transaction-per-provider-reference)
//! - Check-then-write sequences execute serialized inside the actor, so a
//!   count-then-insert can never be raced past the quota
//! - Async message passing with backpressure
//!
//! Reads that need no arbitration (access checks, tier lookups) bypass the
//! actor and hit storage directly.

use crate::types::{
    AdmitOutcome, AttemptStatus, Entitlement, GrantOutcome, GrantRequest, JobRun, Lease,
    ReserveOutcome, SettleOutcome, Subscription, SweepReport, Transaction, TransactionDraft,
    TransactionMetadata, TransactionResolution, TransactionStatus, UnlockAttempt, UnlockMethod,
    WebhookDelivery, WebhookEvent, WebhookStatus,
};
use crate::{Error, Result, Storage};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Message sent to the ledger actor
pub enum LedgerMessage {
    /// Admit a webhook delivery
    AdmitWebhook {
        /// Inbound delivery
        delivery: WebhookDelivery,
        /// Response channel
        response: oneshot::Sender<Result<AdmitOutcome>>,
    },

    /// Complete an admitted webhook episode
    CompleteWebhook {
        /// Provider event id
        provider_event_id: String,
        /// Whether side effects succeeded
        success: bool,
        /// Response channel
        response: oneshot::Sender<Result<WebhookEvent>>,
    },

    /// Reserve a daily unlock slot
    ReserveUnlock {
        /// Buying user
        user_id: Uuid,
        /// Opportunity being unlocked
        opportunity_id: Uuid,
        /// UTC date bucket
        date: NaiveDate,
        /// Response channel
        response: oneshot::Sender<Result<ReserveOutcome>>,
    },

    /// Mark an attempt succeeded with its payment reference
    MarkAttemptSucceeded {
        /// Attempt id
        attempt_id: Uuid,
        /// Provider payment reference
        payment_reference: String,
        /// Response channel
        response: oneshot::Sender<Result<UnlockAttempt>>,
    },

    /// Move an attempt to a non-counted terminal state
    MarkAttemptClosed {
        /// Attempt id
        attempt_id: Uuid,
        /// Failed or Canceled
        status: AttemptStatus,
        /// Response channel
        response: oneshot::Sender<Result<UnlockAttempt>>,
    },

    /// Grant an entitlement
    GrantEntitlement {
        /// Grant inputs
        request: GrantRequest,
        /// Response channel
        response: oneshot::Sender<Result<GrantOutcome>>,
    },

    /// Add deep-dive access to an existing entitlement
    AddDeepDive {
        /// Entitlement id
        entitlement_id: Uuid,
        /// Payment reference backing the add-on
        payment_reference: Option<String>,
        /// Response channel
        response: oneshot::Sender<Result<Entitlement>>,
    },

    /// Open a pending transaction
    OpenTransaction {
        /// Transaction inputs
        draft: TransactionDraft,
        /// Response channel
        response: oneshot::Sender<Result<Transaction>>,
    },

    /// Settle a transaction
    SettleTransaction {
        /// Transaction id
        transaction_id: Uuid,
        /// Requested terminal state
        resolution: TransactionResolution,
        /// Provider references to attach
        provider_refs: crate::types::ProviderRefs,
        /// Response channel
        response: oneshot::Sender<Result<SettleOutcome>>,
    },

    /// Release matured escrow holds (one sweep batch)
    ReleaseMatured {
        /// Maturation reference instant
        now: DateTime<Utc>,
        /// Batch bound
        limit: usize,
        /// Response channel
        response: oneshot::Sender<Result<SweepReport>>,
    },

    /// Insert or update a subscription row
    UpsertSubscription {
        /// Subscription row
        subscription: Subscription,
        /// Response channel
        response: oneshot::Sender<Result<()>>,
    },

    /// Record a background job run
    RecordJobRun {
        /// Job run row
        run: JobRun,
        /// Response channel
        response: oneshot::Sender<Result<()>>,
    },

    /// Try to acquire a background job lease
    AcquireLease {
        /// Guarded job name
        job_name: String,
        /// Requesting owner
        owner: String,
        /// Lease duration
        ttl: Duration,
        /// Current instant
        now: DateTime<Utc>,
        /// Response channel (true when acquired)
        response: oneshot::Sender<Result<bool>>,
    },

    /// Release a held lease
    ReleaseLease {
        /// Guarded job name
        job_name: String,
        /// Releasing owner
        owner: String,
        /// Response channel
        response: oneshot::Sender<Result<()>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that processes ledger messages
pub struct LedgerActor {
    /// Storage backend
    storage: Arc<Storage>,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,

    /// Daily unlock quota
    daily_unlock_limit: u32,

    /// Webhook admissions allowed before dead-lettering
    webhook_max_attempts: u32,
}

impl LedgerActor {
    /// Create new actor
    pub fn new(
        storage: Arc<Storage>,
        mailbox: mpsc::Receiver<LedgerMessage>,
        daily_unlock_limit: u32,
        webhook_max_attempts: u32,
    ) -> Self {
        Self {
            storage,
            mailbox,
            daily_unlock_limit,
            webhook_max_attempts,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Shutdown => break,
                _ => self.handle_message(msg),
            }
        }
    }

    /// Handle a single message
    fn handle_message(&mut self, msg: LedgerMessage) {
        match msg {
            LedgerMessage::AdmitWebhook { delivery, response } => {
                let _ = response.send(self.admit_webhook(delivery));
            }

            LedgerMessage::CompleteWebhook {
                provider_event_id,
                success,
                response,
            } => {
                let _ = response.send(self.complete_webhook(&provider_event_id, success));
            }

            LedgerMessage::ReserveUnlock {
                user_id,
                opportunity_id,
                date,
                response,
            } => {
                let _ = response.send(self.reserve_unlock(user_id, opportunity_id, date));
            }

            LedgerMessage::MarkAttemptSucceeded {
                attempt_id,
                payment_reference,
                response,
            } => {
                let _ = response.send(self.mark_attempt_succeeded(attempt_id, &payment_reference));
            }

            LedgerMessage::MarkAttemptClosed {
                attempt_id,
                status,
                response,
            } => {
                let _ = response.send(self.mark_attempt_closed(attempt_id, status));
            }

            LedgerMessage::GrantEntitlement { request, response } => {
                let _ = response.send(self.grant_entitlement(request));
            }

            LedgerMessage::AddDeepDive {
                entitlement_id,
                payment_reference,
                response,
            } => {
                let _ = response.send(self.add_deep_dive(entitlement_id, payment_reference));
            }

            LedgerMessage::OpenTransaction { draft, response } => {
                let _ = response.send(self.open_transaction(draft));
            }

            LedgerMessage::SettleTransaction {
                transaction_id,
                resolution,
                provider_refs,
                response,
            } => {
                let _ =
                    response.send(self.settle_transaction(transaction_id, resolution, provider_refs));
            }

            LedgerMessage::ReleaseMatured {
                now,
                limit,
                response,
            } => {
                let _ = response.send(self.release_matured(now, limit));
            }

            LedgerMessage::UpsertSubscription {
                subscription,
                response,
            } => {
                let _ = response.send(self.storage.put_subscription(&subscription));
            }

            LedgerMessage::RecordJobRun { run, response } => {
                let _ = response.send(self.storage.put_job_run(&run));
            }

            LedgerMessage::AcquireLease {
                job_name,
                owner,
                ttl,
                now,
                response,
            } => {
                let _ = response.send(self.acquire_lease(&job_name, &owner, ttl, now));
            }

            LedgerMessage::ReleaseLease {
                job_name,
                owner,
                response,
            } => {
                let _ = response.send(self.release_lease(&job_name, &owner));
            }

            LedgerMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    // Webhook intake

    fn admit_webhook(&self, delivery: WebhookDelivery) -> Result<AdmitOutcome> {
        let now = Utc::now();

        match self.storage.get_webhook(&delivery.provider_event_id)? {
            None => {
                // First-ever delivery wins the insert and executes side effects
                let event = WebhookEvent {
                    provider_event_id: delivery.provider_event_id,
                    event_type: delivery.event_type,
                    livemode: delivery.livemode,
                    status: WebhookStatus::Processing,
                    attempt_count: 1,
                    provider_created_at: delivery.provider_created_at,
                    received_at: now,
                    updated_at: now,
                };
                self.storage.put_webhook(&event)?;
                Ok(AdmitOutcome::Admitted(event))
            }

            Some(event) => match event.status {
                WebhookStatus::Processed => Ok(AdmitOutcome::AlreadyProcessed(event)),

                // Another caller holds the in-flight episode
                WebhookStatus::Processing => Ok(AdmitOutcome::Conflict(event)),

                WebhookStatus::Failed => {
                    if event.attempt_count >= self.webhook_max_attempts {
                        return Ok(AdmitOutcome::DeadLettered(event));
                    }
                    let mut event = event;
                    event.status = WebhookStatus::Processing;
                    event.attempt_count += 1;
                    event.updated_at = now;
                    self.storage.put_webhook(&event)?;
                    Ok(AdmitOutcome::Admitted(event))
                }
            },
        }
    }

    fn complete_webhook(&self, provider_event_id: &str, success: bool) -> Result<WebhookEvent> {
        let mut event = self
            .storage
            .get_webhook(provider_event_id)?
            .ok_or_else(|| Error::WebhookNotFound(provider_event_id.to_string()))?;

        let target = if success {
            WebhookStatus::Processed
        } else {
            WebhookStatus::Failed
        };

        if event.status == target {
            return Ok(event);
        }
        if event.status != WebhookStatus::Processing {
            return Err(Error::InvalidTransition(format!(
                "Webhook {} is {:?}, cannot complete as {:?}",
                provider_event_id, event.status, target
            )));
        }

        event.status = target;
        event.updated_at = Utc::now();
        self.storage.put_webhook(&event)?;
        Ok(event)
    }

    // Unlock quota

    fn reserve_unlock(
        &self,
        user_id: Uuid,
        opportunity_id: Uuid,
        date: NaiveDate,
    ) -> Result<ReserveOutcome> {
        // Count-then-insert is safe here: the actor serializes all writers
        let used = self
            .storage
            .attempts_for_day(user_id, date)?
            .iter()
            .filter(|a| a.status.counts_against_quota())
            .count() as u32;

        if used >= self.daily_unlock_limit {
            return Ok(ReserveOutcome::LimitExceeded {
                used,
                limit: self.daily_unlock_limit,
            });
        }

        let now = Utc::now();
        let attempt = UnlockAttempt {
            attempt_id: Uuid::now_v7(),
            user_id,
            opportunity_id,
            attempt_date: date,
            status: AttemptStatus::Created,
            payment_reference: None,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_attempt(&attempt)?;

        Ok(ReserveOutcome::Reserved(attempt))
    }

    fn mark_attempt_succeeded(
        &self,
        attempt_id: Uuid,
        payment_reference: &str,
    ) -> Result<UnlockAttempt> {
        let mut attempt = self.storage.get_attempt(attempt_id)?;

        // Idempotent re-application with the same reference
        if attempt.status == AttemptStatus::Succeeded
            && attempt.payment_reference.as_deref() == Some(payment_reference)
        {
            return Ok(attempt);
        }
        if attempt.status != AttemptStatus::Created {
            return Err(Error::InvalidTransition(format!(
                "Attempt {} is {:?}, cannot mark succeeded",
                attempt_id, attempt.status
            )));
        }

        // One payment must never fund two attempts
        if let Some(holder) = self.storage.attempt_holding_reference(payment_reference)? {
            if holder != attempt_id {
                return Err(Error::ConflictingReference {
                    reference: payment_reference.to_string(),
                    holder: holder.to_string(),
                });
            }
        }

        attempt.status = AttemptStatus::Succeeded;
        attempt.payment_reference = Some(payment_reference.to_string());
        attempt.updated_at = Utc::now();
        self.storage
            .attach_attempt_reference(&attempt, payment_reference)?;

        Ok(attempt)
    }

    fn mark_attempt_closed(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
    ) -> Result<UnlockAttempt> {
        debug_assert!(matches!(
            status,
            AttemptStatus::Failed | AttemptStatus::Canceled
        ));

        let mut attempt = self.storage.get_attempt(attempt_id)?;

        if attempt.status == status {
            return Ok(attempt);
        }
        if attempt.status != AttemptStatus::Created {
            return Err(Error::InvalidTransition(format!(
                "Attempt {} is {:?}, cannot mark {:?}",
                attempt_id, attempt.status, status
            )));
        }

        attempt.status = status;
        attempt.updated_at = Utc::now();
        self.storage.put_attempt(&attempt)?;

        Ok(attempt)
    }

    // Entitlements

    fn grant_entitlement(&self, request: GrantRequest) -> Result<GrantOutcome> {
        if let Some(existing_id) = self
            .storage
            .entitlement_id_for(request.user_id, request.opportunity_id)?
        {
            // Second grant for the pair is a no-op; safe under webhook retry
            let existing = self.storage.get_entitlement(existing_id)?;
            return Ok(GrantOutcome::AlreadyGranted(existing));
        }

        let now = Utc::now();
        let deep_dive = request.method == UnlockMethod::DeepDive;
        let entitlement = Entitlement {
            entitlement_id: Uuid::now_v7(),
            user_id: request.user_id,
            opportunity_id: request.opportunity_id,
            method: request.method,
            amount_paid: request.amount_paid,
            payment_reference: request.payment_reference,
            deep_dive,
            deep_dive_at: deep_dive.then_some(now),
            deep_dive_reference: None,
            unlocked_at: now,
            expires_at: request.expires_at,
        };
        self.storage.insert_entitlement(&entitlement)?;

        Ok(GrantOutcome::Granted(entitlement))
    }

    fn add_deep_dive(
        &self,
        entitlement_id: Uuid,
        payment_reference: Option<String>,
    ) -> Result<Entitlement> {
        let mut entitlement = self.storage.get_entitlement(entitlement_id)?;

        // Additive flag on the existing row, never a second row
        if entitlement.deep_dive {
            return Ok(entitlement);
        }

        entitlement.deep_dive = true;
        entitlement.deep_dive_at = Some(Utc::now());
        entitlement.deep_dive_reference = payment_reference;
        self.storage.put_entitlement(&entitlement)?;

        Ok(entitlement)
    }

    // Transactions

    fn open_transaction(&self, draft: TransactionDraft) -> Result<Transaction> {
        if draft.amount_cents <= 0 {
            return Err(Error::InvalidTransaction(
                "Amount must be positive".to_string(),
            ));
        }
        if draft.metadata.is_escrow_share()
            && draft.kind != crate::types::TransactionKind::SuccessFee
        {
            return Err(Error::InvalidTransaction(format!(
                "Escrow metadata is only valid on success_fee, got {:?}",
                draft.kind
            )));
        }

        let now = Utc::now();
        let txn = Transaction {
            transaction_id: Uuid::now_v7(),
            kind: draft.kind,
            status: TransactionStatus::Pending,
            user_id: draft.user_id,
            opportunity_id: draft.opportunity_id,
            expert_id: draft.expert_id,
            amount_cents: draft.amount_cents,
            currency: draft.currency,
            provider_refs: crate::types::ProviderRefs::default(),
            metadata: draft.metadata,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_transaction(&txn)?;

        Ok(txn)
    }

    fn settle_transaction(
        &self,
        transaction_id: Uuid,
        resolution: TransactionResolution,
        provider_refs: crate::types::ProviderRefs,
    ) -> Result<SettleOutcome> {
        let mut txn = self.storage.get_transaction(transaction_id)?;

        // Re-settlement of a terminal row is a no-op
        if txn.is_terminal() {
            return Ok(SettleOutcome::AlreadySettled(txn));
        }

        // Each populated provider reference must be globally unique
        let mut new_references = Vec::new();
        for reference in provider_refs.populated() {
            match self.storage.transaction_holding_reference(reference)? {
                Some(holder) if holder != transaction_id => {
                    return Err(Error::ConflictingReference {
                        reference: reference.to_string(),
                        holder: holder.to_string(),
                    });
                }
                Some(_) => {}
                None => new_references.push(reference.to_string()),
            }
        }

        let now = Utc::now();
        let was_held = txn.is_held_escrow();
        txn.provider_refs.merge(&provider_refs);

        // A successful charge on an unmatured escrow hold stays pending
        if resolution == TransactionResolution::Succeeded
            && was_held
            && !txn.metadata.is_matured(now)
        {
            txn.updated_at = now;
            self.storage
                .update_transaction(&txn, &new_references, false)?;
            return Ok(SettleOutcome::Held(txn));
        }

        txn.status = resolution.status();
        txn.updated_at = now;
        if was_held && txn.status == TransactionStatus::Succeeded {
            Self::stamp_released(&mut txn.metadata, now);
        }
        self.storage
            .update_transaction(&txn, &new_references, was_held)?;

        Ok(SettleOutcome::Settled(txn))
    }

    fn stamp_released(metadata: &mut TransactionMetadata, now: DateTime<Utc>) {
        if let TransactionMetadata::EscrowShare { released_at, .. } = metadata {
            *released_at = Some(now);
        }
    }

    // Escrow release sweep

    fn release_matured(&self, now: DateTime<Utc>, limit: usize) -> Result<SweepReport> {
        let ids = self.storage.matured_escrow_ids(limit, now)?;
        let mut report = SweepReport::default();

        for transaction_id in ids {
            report.checked += 1;

            // One bad row must never fail the whole batch
            let mut txn = match self.storage.get_transaction(transaction_id) {
                Ok(txn) => txn,
                Err(e) => {
                    tracing::warn!(
                        transaction_id = %transaction_id,
                        error = %e,
                        "Skipping unreadable escrow row"
                    );
                    report.skipped += 1;
                    continue;
                }
            };

            if !txn.is_held_escrow() {
                tracing::warn!(
                    transaction_id = %transaction_id,
                    status = ?txn.status,
                    "Skipping stale pending-escrow index entry"
                );
                report.skipped += 1;
                continue;
            }

            // The index said matured; a disagreeing row is corrupt, not fatal
            if !txn.metadata.is_matured(now) {
                tracing::warn!(
                    transaction_id = %transaction_id,
                    "Skipping escrow row whose metadata disagrees with its index key"
                );
                report.skipped += 1;
                continue;
            }

            txn.status = TransactionStatus::Succeeded;
            txn.updated_at = now;
            Self::stamp_released(&mut txn.metadata, now);

            match self.storage.update_transaction(&txn, &[], true) {
                Ok(()) => {
                    tracing::info!(
                        transaction_id = %txn.transaction_id,
                        amount_cents = txn.amount_cents,
                        "Escrow hold released"
                    );
                    report.released += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        transaction_id = %txn.transaction_id,
                        error = %e,
                        "Failed to release escrow hold, skipping"
                    );
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    // Leases

    fn acquire_lease(
        &self,
        job_name: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if let Some(lease) = self.storage.get_lease(job_name)? {
            if !lease.is_expired(now) && lease.owner != owner {
                return Ok(false);
            }
        }

        self.storage.put_lease(&Lease {
            job_name: job_name.to_string(),
            owner: owner.to_string(),
            expires_at: now + ttl,
        })?;

        Ok(true)
    }

    fn release_lease(&self, job_name: &str, owner: &str) -> Result<()> {
        if let Some(lease) = self.storage.get_lease(job_name)? {
            if lease.owner == owner {
                self.storage.delete_lease(job_name)?;
            }
        }
        Ok(())
    }
}

/// Handle for sending messages to the actor
#[derive(Clone)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> LedgerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Admit a webhook delivery
    pub async fn admit_webhook(&self, delivery: WebhookDelivery) -> Result<AdmitOutcome> {
        self.request(|response| LedgerMessage::AdmitWebhook { delivery, response })
            .await
    }

    /// Complete an admitted webhook episode
    pub async fn complete_webhook(
        &self,
        provider_event_id: String,
        success: bool,
    ) -> Result<WebhookEvent> {
        self.request(|response| LedgerMessage::CompleteWebhook {
            provider_event_id,
            success,
            response,
        })
        .await
    }

    /// Reserve a daily unlock slot
    pub async fn reserve_unlock(
        &self,
        user_id: Uuid,
        opportunity_id: Uuid,
        date: NaiveDate,
    ) -> Result<ReserveOutcome> {
        self.request(|response| LedgerMessage::ReserveUnlock {
            user_id,
            opportunity_id,
            date,
            response,
        })
        .await
    }

    /// Mark an attempt succeeded
    pub async fn mark_attempt_succeeded(
        &self,
        attempt_id: Uuid,
        payment_reference: String,
    ) -> Result<UnlockAttempt> {
        self.request(|response| LedgerMessage::MarkAttemptSucceeded {
            attempt_id,
            payment_reference,
            response,
        })
        .await
    }

    /// Move an attempt to failed or canceled
    pub async fn mark_attempt_closed(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
    ) -> Result<UnlockAttempt> {
        self.request(|response| LedgerMessage::MarkAttemptClosed {
            attempt_id,
            status,
            response,
        })
        .await
    }

    /// Grant an entitlement
    pub async fn grant_entitlement(&self, request: GrantRequest) -> Result<GrantOutcome> {
        self.request(|response| LedgerMessage::GrantEntitlement { request, response })
            .await
    }

    /// Add deep-dive access to an existing entitlement
    pub async fn add_deep_dive(
        &self,
        entitlement_id: Uuid,
        payment_reference: Option<String>,
    ) -> Result<Entitlement> {
        self.request(|response| LedgerMessage::AddDeepDive {
            entitlement_id,
            payment_reference,
            response,
        })
        .await
    }

    /// Open a pending transaction
    pub async fn open_transaction(&self, draft: TransactionDraft) -> Result<Transaction> {
        self.request(|response| LedgerMessage::OpenTransaction { draft, response })
            .await
    }

    /// Settle a transaction
    pub async fn settle_transaction(
        &self,
        transaction_id: Uuid,
        resolution: TransactionResolution,
        provider_refs: crate::types::ProviderRefs,
    ) -> Result<SettleOutcome> {
        self.request(|response| LedgerMessage::SettleTransaction {
            transaction_id,
            resolution,
            provider_refs,
            response,
        })
        .await
    }

    /// Release matured escrow holds
    pub async fn release_matured(&self, now: DateTime<Utc>, limit: usize) -> Result<SweepReport> {
        self.request(|response| LedgerMessage::ReleaseMatured {
            now,
            limit,
            response,
        })
        .await
    }

    /// Insert or update a subscription row
    pub async fn upsert_subscription(&self, subscription: Subscription) -> Result<()> {
        self.request(|response| LedgerMessage::UpsertSubscription {
            subscription,
            response,
        })
        .await
    }

    /// Record a background job run
    pub async fn record_job_run(&self, run: JobRun) -> Result<()> {
        self.request(|response| LedgerMessage::RecordJobRun { run, response })
            .await
    }

    /// Try to acquire a background job lease
    pub async fn acquire_lease(
        &self,
        job_name: String,
        owner: String,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.request(|response| LedgerMessage::AcquireLease {
            job_name,
            owner,
            ttl,
            now,
            response,
        })
        .await
    }

    /// Release a held lease
    pub async fn release_lease(&self, job_name: String, owner: String) -> Result<()> {
        self.request(|response| LedgerMessage::ReleaseLease {
            job_name,
            owner,
            response,
        })
        .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LedgerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(
    storage: Arc<Storage>,
    daily_unlock_limit: u32,
    webhook_max_attempts: u32,
) -> LedgerHandle {
    let (tx, rx) = mpsc::channel(1000); // Bounded channel for backpressure
    let actor = LedgerActor::new(storage, rx, daily_unlock_limit, webhook_max_attempts);

    tokio::spawn(async move {
        actor.run().await;
    });

    LedgerHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    fn spawn_test_actor() -> (LedgerHandle, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let storage = Arc::new(Storage::open(&config).unwrap());
        let handle = spawn_ledger_actor(storage, 3, 5);
        (handle, temp_dir)
    }

    fn delivery(id: &str) -> WebhookDelivery {
        WebhookDelivery {
            provider_event_id: id.to_string(),
            event_type: "payment_intent.succeeded".to_string(),
            livemode: false,
            provider_created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let (handle, _temp) = spawn_test_actor();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_admit_then_conflict_then_processed() {
        let (handle, _temp) = spawn_test_actor();

        let first = handle.admit_webhook(delivery("evt_1")).await.unwrap();
        assert!(matches!(first, AdmitOutcome::Admitted(_)));

        // Second delivery while side effects are in flight
        let second = handle.admit_webhook(delivery("evt_1")).await.unwrap();
        assert!(matches!(second, AdmitOutcome::Conflict(_)));

        let done = handle
            .complete_webhook("evt_1".to_string(), true)
            .await
            .unwrap();
        assert_eq!(done.status, WebhookStatus::Processed);

        let third = handle.admit_webhook(delivery("evt_1")).await.unwrap();
        assert!(matches!(third, AdmitOutcome::AlreadyProcessed(_)));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_webhook_readmits_until_dead_letter() {
        let (handle, _temp) = spawn_test_actor();

        let first = handle.admit_webhook(delivery("evt_dead")).await.unwrap();
        assert!(matches!(first, AdmitOutcome::Admitted(_)));

        // Fail four times more; attempt 5 is the bound
        for expected_attempt in 2..=5u32 {
            handle
                .complete_webhook("evt_dead".to_string(), false)
                .await
                .unwrap();
            let outcome = handle.admit_webhook(delivery("evt_dead")).await.unwrap();
            match outcome {
                AdmitOutcome::Admitted(event) => {
                    assert_eq!(event.attempt_count, expected_attempt)
                }
                other => panic!("Expected re-admission, got {:?}", other),
            }
        }

        handle
            .complete_webhook("evt_dead".to_string(), false)
            .await
            .unwrap();
        let outcome = handle.admit_webhook(delivery("evt_dead")).await.unwrap();
        assert!(matches!(outcome, AdmitOutcome::DeadLettered(_)));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_skips_orphaned_index_entry() {
        use crate::types::{Currency, TransactionKind};
        use rust_decimal::Decimal;

        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let handle = spawn_ledger_actor(storage.clone(), 3, 5);

        let now = Utc::now();

        // Index entry pointing at a transaction row that does not exist
        storage
            .plant_escrow_index_entry(now - Duration::days(2), Uuid::new_v4())
            .unwrap();

        let held = handle
            .open_transaction(TransactionDraft {
                kind: TransactionKind::SuccessFee,
                user_id: Uuid::new_v4(),
                opportunity_id: Some(Uuid::new_v4()),
                expert_id: Some(Uuid::new_v4()),
                amount_cents: 75_000,
                currency: Currency::USD,
                metadata: TransactionMetadata::EscrowShare {
                    split_percent: Decimal::new(150, 1),
                    release_at: now - Duration::days(1),
                    released_at: None,
                },
            })
            .await
            .unwrap();

        // The orphan is skipped, the real hold still releases
        let report = handle.release_matured(now, 10).await.unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.released, 1);

        let released = storage.get_transaction(held.transaction_id).unwrap();
        assert_eq!(released.status, TransactionStatus::Succeeded);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_takeover_only_after_expiry() {
        let (handle, _temp) = spawn_test_actor();
        let now = Utc::now();
        let ttl = Duration::seconds(120);

        assert!(handle
            .acquire_lease("escrow_release".into(), "a".into(), ttl, now)
            .await
            .unwrap());

        // Held elsewhere, not expired
        assert!(!handle
            .acquire_lease("escrow_release".into(), "b".into(), ttl, now)
            .await
            .unwrap());

        // Same owner may renew
        assert!(handle
            .acquire_lease("escrow_release".into(), "a".into(), ttl, now)
            .await
            .unwrap());

        // Expired lease is free to take over
        assert!(handle
            .acquire_lease(
                "escrow_release".into(),
                "b".into(),
                ttl,
                now + Duration::seconds(121)
            )
            .await
            .unwrap());

        handle.shutdown().await.unwrap();
    }
}
