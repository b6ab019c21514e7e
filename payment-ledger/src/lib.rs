//! Venturo Payment Ledger
//!
//! Idempotency and entitlement core for the marketplace payment flows.
//!
//! # Architecture
//!
//! - **Single Writer**: One logical writer task arbitrates every
//!   cross-request invariant; no application-level locks around the store
//! - **Typed Outcomes**: Expected business results (duplicate delivery,
//!   quota exceeded, already granted) are enum variants, not errors
//! - **Atomic Indices**: Rows commit together with their uniqueness and
//!   scan indices via `WriteBatch`
//!
//! # Invariants
//!
//! - A webhook delivery never double-executes its side effects
//! - Daily unlock reservations never exceed the quota, even under
//!   concurrent callers
//! - At most one entitlement per (user, opportunity) pair
//! - A provider reference is claimed by at most one transaction
//! - An escrow hold releases exactly once, only after maturation

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod storage;
pub mod tiers;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::PaymentLedger;
pub use storage::Storage;
pub use types::{
    AdmitOutcome, AttemptStatus, Currency, Entitlement, GrantOutcome, GrantRequest, JobRun,
    JobStatus, Lease, ProviderRefs, ReserveOutcome, SettleOutcome, Subscription, SweepReport,
    Tier, Transaction, TransactionDraft, TransactionKind, TransactionMetadata,
    TransactionResolution, TransactionStatus, UnlockAttempt, UnlockMethod, WebhookDelivery,
    WebhookEvent, WebhookStatus,
};
