//! Escrow Release Scheduler
//!
//! Periodic sweep that matures pending escrow-held success-fee transactions
//! in the payment ledger.
//!
//! # Architecture
//!
//! The scheduler runs one fixed-interval task per process. Each tick:
//!
//! 1. **Lease**: Acquire the job lease (owner + TTL); skip the tick when the
//!    lease is held by another instance
//! 2. **Record**: Open a JobRun row for operational tooling
//! 3. **Sweep**: Release matured holds, at most a batch bound per run
//! 4. **Finish**: Close the JobRun with the sweep report and drop the lease
//!
//! Releases are idempotent by construction: a released row leaves the
//! pending set, so repeated sweeps over the same data release nothing new.
//!
//! # Example
//!
//! ```no_run
//! use escrow_release::{Config, EscrowScheduler};
//! use payment_ledger::PaymentLedger;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> escrow_release::Result<()> {
//!     let ledger = Arc::new(PaymentLedger::open(Default::default()).await?);
//!     let scheduler = Arc::new(EscrowScheduler::new(ledger, Config::default()));
//!     scheduler.start().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod scheduler;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use scheduler::EscrowScheduler;
