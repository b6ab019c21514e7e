//! Periodic escrow release sweep
//!
//! One scheduler per process; the job lease makes concurrent sweeps across
//! deployed instances mutually exclusive. Every run is recorded as a JobRun
//! so operators can see `{checked, released, skipped}` per tick.

use crate::{Config, Result};
use chrono::{Duration, Utc};
use payment_ledger::{JobRun, JobStatus, PaymentLedger, SweepReport};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Periodic escrow release scheduler
pub struct EscrowScheduler {
    ledger: Arc<PaymentLedger>,
    config: Config,

    /// Lease owner identity, unique per scheduler instance
    owner: String,
}

impl EscrowScheduler {
    /// Create new scheduler over an open ledger
    pub fn new(ledger: Arc<PaymentLedger>, config: Config) -> Self {
        let owner = format!("sweeper-{}", Uuid::new_v4());
        Self {
            ledger,
            config,
            owner,
        }
    }

    /// Start scheduler loop
    pub async fn start(self: Arc<Self>) {
        info!(
            job_name = %self.config.job_name,
            interval_secs = self.config.interval_secs,
            owner = %self.owner,
            "Starting escrow release scheduler"
        );

        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(self.config.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if let Err(e) = self.run_once().await {
                warn!(error = %e, "Escrow sweep failed");
            }
        }
    }

    /// Run one sweep
    ///
    /// Returns `None` when the lease is held by another instance and the
    /// tick was skipped.
    pub async fn run_once(&self) -> Result<Option<SweepReport>> {
        let acquired = self
            .ledger
            .acquire_job_lease(
                &self.config.job_name,
                &self.owner,
                Duration::seconds(self.config.lease_ttl_secs),
            )
            .await?;

        if !acquired {
            debug!(
                job_name = %self.config.job_name,
                "Lease held elsewhere, skipping sweep"
            );
            return Ok(None);
        }

        let result = self.sweep_under_lease().await;

        // The lease is released on every exit path; a bookkeeping fault must
        // never cost other instances a lease period
        if let Err(e) = self
            .ledger
            .release_job_lease(&self.config.job_name, &self.owner)
            .await
        {
            warn!(
                job_name = %self.config.job_name,
                error = %e,
                "Failed to release sweep lease"
            );
        }

        Ok(Some(result?))
    }

    async fn sweep_under_lease(&self) -> Result<SweepReport> {
        let started_at = Utc::now();
        let mut run = JobRun {
            run_id: Uuid::now_v7(),
            job_name: self.config.job_name.clone(),
            status: JobStatus::Running,
            started_at,
            finished_at: None,
            details: None,
            error: None,
        };
        if let Err(e) = self.ledger.record_job_run(run.clone()).await {
            warn!(
                job_name = %self.config.job_name,
                error = %e,
                "Failed to record sweep start"
            );
        }

        let result = self
            .ledger
            .release_matured(self.config.batch_limit, started_at)
            .await;

        run.finished_at = Some(Utc::now());
        match &result {
            Ok(report) => {
                run.status = JobStatus::Succeeded;
                run.details = serde_json::to_string(report).ok();
                info!(
                    job_name = %self.config.job_name,
                    checked = report.checked,
                    released = report.released,
                    skipped = report.skipped,
                    "Escrow sweep finished"
                );
            }
            Err(e) => {
                run.status = JobStatus::Failed;
                run.error = Some(e.to_string());
                warn!(
                    job_name = %self.config.job_name,
                    error = %e,
                    "Escrow sweep aborted"
                );
            }
        }
        if let Err(e) = self.ledger.record_job_run(run).await {
            warn!(
                job_name = %self.config.job_name,
                error = %e,
                "Failed to record sweep result"
            );
        }

        Ok(result?)
    }

    /// Lease owner identity of this instance
    pub fn owner(&self) -> &str {
        &self.owner
    }
}
