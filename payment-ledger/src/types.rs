//! Core types for the payment ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Memory safety (no unsafe code)
//! - Exact arithmetic (Decimal for money fractions, integer cents elsewhere)

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Currency {
    /// US Dollar
    USD,
    /// Euro
    EUR,
    /// British Pound
    GBP,
}

impl Currency {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "USD" => Some(Currency::USD),
            "EUR" => Some(Currency::EUR),
            "GBP" => Some(Currency::GBP),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ---------------------------------------------------------------------------
// Webhook intake
// ---------------------------------------------------------------------------

/// Processing status of a webhook delivery episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WebhookStatus {
    /// Admitted, side effects in flight
    Processing = 1,
    /// Side effects executed (terminal, never re-executed)
    Processed = 2,
    /// Side effects failed; eligible for re-admission up to the attempt bound
    Failed = 3,
}

/// Inbound provider delivery, as handed over by the (external) HTTP layer
///
/// Signature verification and payload parsing happen upstream; this core
/// only consumes the identity and classification fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    /// Provider-assigned event id (the sole idempotency key)
    pub provider_event_id: String,

    /// Provider event type (e.g. "payment_intent.succeeded")
    pub event_type: String,

    /// Live vs. test mode delivery
    pub livemode: bool,

    /// Provider-side creation timestamp
    pub provider_created_at: DateTime<Utc>,
}

/// Durable record of one webhook delivery episode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Provider-assigned event id (unique, primary key)
    pub provider_event_id: String,

    /// Provider event type
    pub event_type: String,

    /// Live vs. test mode
    pub livemode: bool,

    /// Current status
    pub status: WebhookStatus,

    /// Number of admissions so far (first delivery counts as 1)
    pub attempt_count: u32,

    /// Provider-side creation timestamp
    pub provider_created_at: DateTime<Utc>,

    /// First seen by this core
    pub received_at: DateTime<Utc>,

    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Check if the episode reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, WebhookStatus::Processed | WebhookStatus::Failed)
    }
}

/// Result of an admission attempt
#[derive(Debug, Clone)]
pub enum AdmitOutcome {
    /// Caller holds the episode; execute side effects, then call `complete`
    Admitted(WebhookEvent),

    /// Row already processed; side effects must not run again
    AlreadyProcessed(WebhookEvent),

    /// Another caller holds the in-flight episode; do nothing
    Conflict(WebhookEvent),

    /// Attempt bound exhausted; route to operators instead of retrying
    DeadLettered(WebhookEvent),
}

// ---------------------------------------------------------------------------
// Unlock attempts (daily quota)
// ---------------------------------------------------------------------------

/// Status of a pay-per-unlock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AttemptStatus {
    /// Reserved, charge not yet confirmed (counts against quota)
    Created = 1,
    /// Charge confirmed (counts against quota)
    Succeeded = 2,
    /// Charge failed (slot freed)
    Failed = 3,
    /// Canceled before confirmation (slot freed)
    Canceled = 4,
}

impl AttemptStatus {
    /// Whether a row in this status consumes a slot of the daily quota
    pub fn counts_against_quota(&self) -> bool {
        matches!(self, AttemptStatus::Created | AttemptStatus::Succeeded)
    }

    /// Check if this status is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::Created)
    }
}

/// One reservation against the per-day unlock quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockAttempt {
    /// Unique attempt id (UUIDv7 for time-ordering)
    pub attempt_id: Uuid,

    /// Buying user
    pub user_id: Uuid,

    /// Opportunity being unlocked
    pub opportunity_id: Uuid,

    /// UTC date bucket the attempt counts against
    pub attempt_date: NaiveDate,

    /// Current status
    pub status: AttemptStatus,

    /// Provider payment reference, attached on success (unique when present)
    pub payment_reference: Option<String>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

/// Result of a quota reservation
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    /// Slot reserved; proceed to charge
    Reserved(UnlockAttempt),

    /// Daily quota exhausted for this user and date
    LimitExceeded {
        /// Slots already consumed
        used: u32,
        /// Configured daily limit
        limit: u32,
    },
}

// ---------------------------------------------------------------------------
// Entitlements
// ---------------------------------------------------------------------------

/// How an entitlement was acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum UnlockMethod {
    /// Included in an active subscription tier
    Subscription = 1,
    /// One-off pay-per-unlock purchase
    PayPerUnlock = 2,
    /// Fast-pass purchase
    FastPass = 3,
    /// Deep-dive purchase
    DeepDive = 4,
}

/// Durable access grant for one (user, opportunity) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    /// Unique entitlement id
    pub entitlement_id: Uuid,

    /// Granted user
    pub user_id: Uuid,

    /// Unlocked opportunity
    pub opportunity_id: Uuid,

    /// Acquisition method
    pub method: UnlockMethod,

    /// Amount paid (currency units, exact decimal)
    pub amount_paid: Decimal,

    /// Provider payment reference backing the grant
    pub payment_reference: Option<String>,

    /// Deep-dive access flag (additive, never a second row)
    pub deep_dive: bool,

    /// When deep-dive access was added
    pub deep_dive_at: Option<DateTime<Utc>>,

    /// Provider payment reference backing the deep-dive add-on
    pub deep_dive_reference: Option<String>,

    /// Grant timestamp
    pub unlocked_at: DateTime<Utc>,

    /// Advisory expiry, read by external access checks
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entitlement {
    /// Advisory expiry check (this core never deletes entitlements)
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at,
            None => false,
        }
    }
}

/// Inputs for a new grant
#[derive(Debug, Clone)]
pub struct GrantRequest {
    /// Granted user
    pub user_id: Uuid,

    /// Unlocked opportunity
    pub opportunity_id: Uuid,

    /// Acquisition method
    pub method: UnlockMethod,

    /// Amount paid
    pub amount_paid: Decimal,

    /// Provider payment reference
    pub payment_reference: Option<String>,

    /// Advisory expiry
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of a grant
#[derive(Debug, Clone)]
pub enum GrantOutcome {
    /// New entitlement created
    Granted(Entitlement),

    /// Pair already entitled; existing row returned, nothing written
    AlreadyGranted(Entitlement),
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Monetary operation classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionKind {
    /// Recurring subscription charge
    Subscription = 1,
    /// Small one-off charge
    MicroPayment = 2,
    /// Project milestone payment
    ProjectPayment = 3,
    /// Success fee (may carry an escrow hold)
    SuccessFee = 4,
    /// Revenue share payout
    RevenueShare = 5,
    /// Pay-per-unlock purchase
    PayPerUnlock = 6,
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionStatus {
    /// Open, not yet settled (escrow holds stay here until matured)
    Pending = 1,
    /// Settled successfully (terminal)
    Succeeded = 2,
    /// Settled as failed (terminal)
    Failed = 3,
    /// Canceled (terminal)
    Canceled = 4,
}

impl TransactionStatus {
    /// Check if this status is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

/// Per-kind transaction attributes, persisted as a tagged union
///
/// Escrow fields live in a typed variant rather than an opaque blob, so the
/// release sweep never parses untrusted JSON ad hoc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransactionMetadata {
    /// No per-kind attributes
    None,

    /// Escrow-held share of a success fee
    EscrowShare {
        /// Share of the fee held in escrow (percent)
        split_percent: Decimal,

        /// Maturation instant; the hold releases once this has passed
        release_at: DateTime<Utc>,

        /// Stamped by the release sweep, exactly once
        released_at: Option<DateTime<Utc>>,
    },
}

impl TransactionMetadata {
    /// Whether this metadata marks an escrow-held share
    pub fn is_escrow_share(&self) -> bool {
        matches!(self, TransactionMetadata::EscrowShare { .. })
    }

    /// Whether the escrow hold has matured at `now`
    ///
    /// Always false for non-escrow metadata.
    pub fn is_matured(&self, now: DateTime<Utc>) -> bool {
        match self {
            TransactionMetadata::EscrowShare { release_at, .. } => *release_at <= now,
            TransactionMetadata::None => false,
        }
    }
}

/// Provider-side references attached at settlement
///
/// Each populated reference is globally unique across the transaction table;
/// that uniqueness is what stops two logical transactions from double-claiming
/// one provider charge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRefs {
    /// Payment intent id
    pub payment_intent_id: Option<String>,

    /// Invoice id
    pub invoice_id: Option<String>,

    /// Charge id
    pub charge_id: Option<String>,
}

impl ProviderRefs {
    /// Iterate over populated references
    pub fn populated(&self) -> impl Iterator<Item = &str> {
        self.payment_intent_id
            .iter()
            .chain(self.invoice_id.iter())
            .chain(self.charge_id.iter())
            .map(String::as_str)
    }

    /// True when no reference is populated
    pub fn is_empty(&self) -> bool {
        self.populated().next().is_none()
    }

    /// Merge references from `other`, keeping existing values
    pub fn merge(&mut self, other: &ProviderRefs) {
        if self.payment_intent_id.is_none() {
            self.payment_intent_id = other.payment_intent_id.clone();
        }
        if self.invoice_id.is_none() {
            self.invoice_id = other.invoice_id.clone();
        }
        if self.charge_id.is_none() {
            self.charge_id = other.charge_id.clone();
        }
    }
}

/// One monetary operation in the append-only ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction id (UUIDv7 for time-ordering)
    pub transaction_id: Uuid,

    /// Operation classification
    pub kind: TransactionKind,

    /// Current status
    pub status: TransactionStatus,

    /// Paying or receiving user
    pub user_id: Uuid,

    /// Related opportunity, if any
    pub opportunity_id: Option<Uuid>,

    /// Related expert, if any
    pub expert_id: Option<Uuid>,

    /// Amount in minor currency units
    pub amount_cents: i64,

    /// Currency
    pub currency: Currency,

    /// Provider references (each unique when present)
    pub provider_refs: ProviderRefs,

    /// Per-kind attributes
    pub metadata: TransactionMetadata,

    /// Opened timestamp
    pub created_at: DateTime<Utc>,

    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Check if the transaction reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether this row is a pending escrow-held success fee
    pub fn is_held_escrow(&self) -> bool {
        self.kind == TransactionKind::SuccessFee
            && self.status == TransactionStatus::Pending
            && self.metadata.is_escrow_share()
    }
}

/// Inputs for opening a transaction
#[derive(Debug, Clone)]
pub struct TransactionDraft {
    /// Operation classification
    pub kind: TransactionKind,

    /// Paying or receiving user
    pub user_id: Uuid,

    /// Related opportunity, if any
    pub opportunity_id: Option<Uuid>,

    /// Related expert, if any
    pub expert_id: Option<Uuid>,

    /// Amount in minor currency units (must be positive)
    pub amount_cents: i64,

    /// Currency
    pub currency: Currency,

    /// Per-kind attributes
    pub metadata: TransactionMetadata,
}

/// Requested terminal state for a settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionResolution {
    /// Provider charge succeeded
    Succeeded,
    /// Provider charge failed
    Failed,
    /// Charge canceled before completion
    Canceled,
}

impl TransactionResolution {
    /// Terminal status this resolution maps to
    pub fn status(&self) -> TransactionStatus {
        match self {
            TransactionResolution::Succeeded => TransactionStatus::Succeeded,
            TransactionResolution::Failed => TransactionStatus::Failed,
            TransactionResolution::Canceled => TransactionStatus::Canceled,
        }
    }
}

/// Result of a settlement call
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    /// Transaction transitioned to a terminal state
    Settled(Transaction),

    /// Already terminal; nothing changed
    AlreadySettled(Transaction),

    /// Escrow hold not yet matured; references recorded, row stays pending
    Held(Transaction),
}

/// Outcome of one escrow release sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Rows examined this run
    pub checked: u64,

    /// Holds released this run
    pub released: u64,

    /// Rows skipped due to per-row failures
    pub skipped: u64,
}

// ---------------------------------------------------------------------------
// Subscriptions and tiers
// ---------------------------------------------------------------------------

/// Entitlement tier of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tier {
    /// No active subscription (lowest)
    Free = 0,
    /// Basic tier
    Basic = 1,
    /// Pro tier
    Pro = 2,
    /// Premium tier
    Premium = 3,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Pro => "pro",
            Tier::Premium => "premium",
        };
        write!(f, "{}", name)
    }
}

/// Subscription row backing tier resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscribed user
    pub user_id: Uuid,

    /// Paid tier
    pub tier: Tier,

    /// End of the current billing period; a lapsed period downgrades to Free
    pub current_period_end: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Effective tier at `now` (lapsed billing period downgrades to Free)
    pub fn effective_tier(&self, now: DateTime<Utc>) -> Tier {
        if now >= self.current_period_end {
            Tier::Free
        } else {
            self.tier
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler bookkeeping
// ---------------------------------------------------------------------------

/// Status of a background job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobStatus {
    /// In flight
    Running = 1,
    /// Completed
    Succeeded = 2,
    /// Aborted with an error
    Failed = 3,
}

/// One recorded run of a background job, consumed by operational tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    /// Unique run id (UUIDv7 for time-ordering)
    pub run_id: Uuid,

    /// Job name (e.g. "escrow_release")
    pub job_name: String,

    /// Current status
    pub status: JobStatus,

    /// Run start
    pub started_at: DateTime<Utc>,

    /// Run end, once finished
    pub finished_at: Option<DateTime<Utc>>,

    /// Structured details (JSON), e.g. the sweep report
    pub details: Option<String>,

    /// Error string when the run failed
    pub error: Option<String>,
}

/// Cross-instance lease guarding a background job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    /// Guarded job name
    pub job_name: String,

    /// Holder identity (process-scoped)
    pub owner: String,

    /// Lease expiry; an expired lease is free to take over
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease has lapsed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
