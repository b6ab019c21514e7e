//! Property and scenario tests for the payment core invariants
//!
//! These verify the guarantees the rest of the marketplace leans on:
//! - Webhook idempotency: at most one side-effect execution per delivery
//! - Quota invariant: concurrent reservations never overshoot the daily limit
//! - Entitlement uniqueness: one row per (user, opportunity), ever
//! - Reference uniqueness: one transaction per provider charge
//! - Escrow correctness: holds release exactly once, only after maturation

use chrono::{Duration as ChronoDuration, Utc};
use payment_ledger::{
    AdmitOutcome, Config, Currency, GrantOutcome, GrantRequest, PaymentLedger, ProviderRefs,
    ReserveOutcome, SettleOutcome, TransactionDraft, TransactionKind, TransactionMetadata,
    TransactionResolution, TransactionStatus, UnlockMethod, WebhookDelivery, WebhookStatus,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

async fn open_ledger(daily_unlock_limit: u32) -> (Arc<PaymentLedger>, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.quota.daily_unlock_limit = daily_unlock_limit;

    let ledger = PaymentLedger::open(config).await.unwrap();
    (Arc::new(ledger), temp_dir)
}

fn delivery(id: &str) -> WebhookDelivery {
    WebhookDelivery {
        provider_event_id: id.to_string(),
        event_type: "payment_intent.succeeded".to_string(),
        livemode: true,
        provider_created_at: Utc::now(),
    }
}

fn grant_request(user_id: Uuid, opportunity_id: Uuid) -> GrantRequest {
    GrantRequest {
        user_id,
        opportunity_id,
        method: UnlockMethod::PayPerUnlock,
        amount_paid: Decimal::new(4900, 2),
        payment_reference: Some("pi_webhook".to_string()),
        expires_at: None,
    }
}

fn escrow_draft(release_at: chrono::DateTime<Utc>) -> TransactionDraft {
    TransactionDraft {
        kind: TransactionKind::SuccessFee,
        user_id: Uuid::new_v4(),
        opportunity_id: Some(Uuid::new_v4()),
        expert_id: Some(Uuid::new_v4()),
        amount_cents: 250_000,
        currency: Currency::USD,
        metadata: TransactionMetadata::EscrowShare {
            split_percent: Decimal::new(150, 1),
            release_at,
            released_at: None,
        },
    }
}

/// Two admit() calls with the same event id never both yield Admitted.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_admits_yield_one_executor() {
    let (ledger, _temp) = open_ledger(3).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        tasks.push(tokio::spawn(async move {
            ledger.admit(delivery("evt_race")).await.unwrap()
        }));
    }

    let mut admitted = 0;
    for task in tasks {
        if matches!(task.await.unwrap(), AdmitOutcome::Admitted(_)) {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 1);
}

/// Two deliveries for "evt_1" ~50ms apart end with exactly one
/// webhook row, status processed, and the underlying grant applied once.
#[tokio::test(flavor = "multi_thread")]
async fn redelivered_webhook_executes_once() {
    let (ledger, _temp) = open_ledger(3).await;
    let user = Uuid::new_v4();
    let opportunity = Uuid::new_v4();

    let first = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            match ledger.admit(delivery("evt_1")).await.unwrap() {
                AdmitOutcome::Admitted(_) => {
                    // Side effects take a while; the second delivery lands meanwhile
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    let outcome = ledger.grant(grant_request(user, opportunity)).await.unwrap();
                    assert!(matches!(outcome, GrantOutcome::Granted(_)));
                    ledger.complete("evt_1", true).await.unwrap();
                    true
                }
                _ => false,
            }
        })
    };

    let second = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            match ledger.admit(delivery("evt_1")).await.unwrap() {
                AdmitOutcome::Admitted(_) => {
                    // Would be a double execution
                    ledger.grant(grant_request(user, opportunity)).await.unwrap();
                    ledger.complete("evt_1", true).await.unwrap();
                    true
                }
                _ => false,
            }
        })
    };

    let executions =
        first.await.unwrap() as u32 + second.await.unwrap() as u32;
    assert_eq!(executions, 1);

    let event = ledger.get_webhook("evt_1").unwrap().unwrap();
    assert_eq!(event.status, WebhookStatus::Processed);
    assert_eq!(event.attempt_count, 1);

    // A later redelivery is suppressed outright
    let redelivery = ledger.admit(delivery("evt_1")).await.unwrap();
    assert!(matches!(redelivery, AdmitOutcome::AlreadyProcessed(_)));

    // Grant applied exactly once
    assert_eq!(ledger.metrics().entitlements_granted.get(), 1);
    assert!(ledger.has_access(user, opportunity).unwrap());
}

/// Daily limit 1; five concurrent reservations for different
/// opportunities, same user and date, yield one success and four rejections.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_reservations_respect_quota() {
    let (ledger, _temp) = open_ledger(1).await;
    let user = Uuid::new_v4();
    let today = Utc::now().date_naive();

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let ledger = ledger.clone();
        tasks.push(tokio::spawn(async move {
            ledger
                .reserve_unlock(user, Uuid::new_v4(), today)
                .await
                .unwrap()
        }));
    }

    let mut reserved = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            ReserveOutcome::Reserved(_) => reserved += 1,
            ReserveOutcome::LimitExceeded { .. } => rejected += 1,
        }
    }

    assert_eq!(reserved, 1);
    assert_eq!(rejected, 4);

    let counted = ledger
        .attempts_for_day(user, today)
        .unwrap()
        .iter()
        .filter(|a| a.status.counts_against_quota())
        .count();
    assert_eq!(counted, 1);
}

/// Repeated grant() calls with identical arguments are no-ops after the first,
/// even when issued concurrently.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_grants_create_one_entitlement() {
    let (ledger, _temp) = open_ledger(3).await;
    let user = Uuid::new_v4();
    let opportunity = Uuid::new_v4();

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let ledger = ledger.clone();
        tasks.push(tokio::spawn(async move {
            ledger.grant(grant_request(user, opportunity)).await.unwrap()
        }));
    }

    let mut granted = 0;
    let mut entitlement_ids = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            GrantOutcome::Granted(e) => {
                granted += 1;
                entitlement_ids.push(e.entitlement_id);
            }
            GrantOutcome::AlreadyGranted(e) => entitlement_ids.push(e.entitlement_id),
        }
    }

    assert_eq!(granted, 1);
    // Every caller observed the same single row
    assert!(entitlement_ids.windows(2).all(|w| w[0] == w[1]));
}

/// Two settle() calls carrying the same payment intent id never both produce
/// succeeded transactions referencing it.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_settles_cannot_double_claim_a_charge() {
    let (ledger, _temp) = open_ledger(3).await;

    let draft = TransactionDraft {
        kind: TransactionKind::ProjectPayment,
        user_id: Uuid::new_v4(),
        opportunity_id: None,
        expert_id: Some(Uuid::new_v4()),
        amount_cents: 10_000,
        currency: Currency::USD,
        metadata: TransactionMetadata::None,
    };
    let a = ledger.open_transaction(draft.clone()).await.unwrap();
    let b = ledger.open_transaction(draft).await.unwrap();

    let refs = ProviderRefs {
        payment_intent_id: Some("pi_contested".to_string()),
        ..Default::default()
    };

    let mut tasks = Vec::new();
    for txn_id in [a.transaction_id, b.transaction_id] {
        let ledger = ledger.clone();
        let refs = refs.clone();
        tasks.push(tokio::spawn(async move {
            ledger
                .settle(txn_id, TransactionResolution::Succeeded, refs)
                .await
        }));
    }

    let mut settled = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(SettleOutcome::Settled(_)) => settled += 1,
            Err(payment_ledger::Error::ConflictingReference { .. }) => conflicts += 1,
            other => panic!("Unexpected settle result: {:?}", other),
        }
    }

    assert_eq!(settled, 1);
    assert_eq!(conflicts, 1);
}

/// A matured escrow hold releases exactly once across repeated
/// sweeps; an unmatured one never releases.
#[tokio::test]
async fn escrow_releases_exactly_once() {
    let (ledger, _temp) = open_ledger(3).await;
    let now = Utc::now();

    let matured = ledger
        .open_transaction(escrow_draft(now - ChronoDuration::days(1)))
        .await
        .unwrap();
    let unmatured = ledger
        .open_transaction(escrow_draft(now + ChronoDuration::days(30)))
        .await
        .unwrap();

    // Only the matured hold is scanned; the unmatured one stays out of the batch
    let report = ledger.release_matured(100, now).await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.released, 1);
    assert_eq!(report.skipped, 0);

    let released = ledger.get_transaction(matured.transaction_id).unwrap();
    assert_eq!(released.status, TransactionStatus::Succeeded);
    match released.metadata {
        TransactionMetadata::EscrowShare { released_at, .. } => {
            assert_eq!(released_at, Some(now));
        }
        TransactionMetadata::None => panic!("Escrow metadata lost"),
    }

    let held = ledger.get_transaction(unmatured.transaction_id).unwrap();
    assert_eq!(held.status, TransactionStatus::Pending);

    // Second run over the same data releases nothing new
    let again = ledger.release_matured(100, now).await.unwrap();
    assert_eq!(again.released, 0);
    assert_eq!(ledger.metrics().escrow_released.get(), 1);
}

/// A charge confirmation on an unmatured hold records references but keeps
/// the row pending until the sweep matures it.
#[tokio::test]
async fn held_escrow_settles_only_via_maturation() {
    let (ledger, _temp) = open_ledger(3).await;
    let now = Utc::now();

    let txn = ledger
        .open_transaction(escrow_draft(now + ChronoDuration::days(7)))
        .await
        .unwrap();

    let refs = ProviderRefs {
        charge_id: Some("ch_escrow".to_string()),
        ..Default::default()
    };
    let outcome = ledger
        .settle(txn.transaction_id, TransactionResolution::Succeeded, refs)
        .await
        .unwrap();
    let SettleOutcome::Held(held) = outcome else {
        panic!("Expected escrow hold");
    };
    assert_eq!(held.status, TransactionStatus::Pending);
    assert_eq!(held.provider_refs.charge_id.as_deref(), Some("ch_escrow"));

    // Not matured yet: sweep leaves it pending
    let report = ledger.release_matured(100, now).await.unwrap();
    assert_eq!(report.released, 0);

    // Matured: released with its references intact
    let report = ledger
        .release_matured(100, now + ChronoDuration::days(8))
        .await
        .unwrap();
    assert_eq!(report.released, 1);

    let released = ledger.get_transaction(txn.transaction_id).unwrap();
    assert_eq!(released.status, TransactionStatus::Succeeded);
    assert_eq!(released.provider_refs.charge_id.as_deref(), Some("ch_escrow"));
}

/// A matured hold is never starved behind an older, still-unmatured one,
/// even with the tightest batch bound.
#[tokio::test]
async fn tight_batch_releases_matured_despite_older_unmatured_hold() {
    let (ledger, _temp) = open_ledger(3).await;
    let now = Utc::now();

    // Opened first, matures far in the future
    let unmatured = ledger
        .open_transaction(escrow_draft(now + ChronoDuration::days(30)))
        .await
        .unwrap();
    // Opened later, already matured
    let matured = ledger
        .open_transaction(escrow_draft(now - ChronoDuration::days(1)))
        .await
        .unwrap();

    let report = ledger.release_matured(1, now).await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.released, 1);

    let released = ledger.get_transaction(matured.transaction_id).unwrap();
    assert_eq!(released.status, TransactionStatus::Succeeded);
    let held = ledger.get_transaction(unmatured.transaction_id).unwrap();
    assert_eq!(held.status, TransactionStatus::Pending);

    // Nothing else is due; repeated tight runs stay empty
    let again = ledger.release_matured(1, now).await.unwrap();
    assert_eq!(again.checked, 0);
    assert_eq!(again.released, 0);
}

/// Sweep batching: at most `limit` rows per run, remainder on the next run.
#[tokio::test]
async fn sweep_batch_bound_carries_remainder() {
    let (ledger, _temp) = open_ledger(3).await;
    let now = Utc::now();

    for _ in 0..5 {
        ledger
            .open_transaction(escrow_draft(now - ChronoDuration::days(1)))
            .await
            .unwrap();
    }

    let first = ledger.release_matured(2, now).await.unwrap();
    assert_eq!(first.checked, 2);
    assert_eq!(first.released, 2);

    let second = ledger.release_matured(2, now).await.unwrap();
    assert_eq!(second.released, 2);

    let third = ledger.release_matured(2, now).await.unwrap();
    assert_eq!(third.released, 1);

    let fourth = ledger.release_matured(2, now).await.unwrap();
    assert_eq!(fourth.checked, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Quota invariant: for any limit and demand, successful reservations
    /// equal min(demand, limit), regardless of arrival order.
    #[test]
    fn prop_reservations_never_overshoot(limit in 1u32..5, demand in 1usize..12) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = open_ledger(limit).await;
            let user = Uuid::new_v4();
            let today = Utc::now().date_naive();

            let mut tasks = Vec::new();
            for _ in 0..demand {
                let ledger = ledger.clone();
                tasks.push(tokio::spawn(async move {
                    ledger
                        .reserve_unlock(user, Uuid::new_v4(), today)
                        .await
                        .unwrap()
                }));
            }

            let mut reserved = 0usize;
            for task in tasks {
                if matches!(task.await.unwrap(), ReserveOutcome::Reserved(_)) {
                    reserved += 1;
                }
            }

            prop_assert_eq!(reserved, demand.min(limit as usize));
            Ok(())
        })?;
    }
}
