//! Background proof-upgrade worker.
//!
//! Anchored records start with a pending proof. This worker periodically
//! sweeps records whose proof is present but not yet terminal, asks the
//! transport to upgrade each one, and persists upgrades through the
//! exactly-once store transition. Cycles are single-flight: a cycle runs to
//! completion before the next poll interval starts, so two sweeps never
//! upgrade the same record concurrently.
//!
//! One record failing or timing out never aborts the rest of the batch; the
//! record stays pending and is retried next cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use judgment_core::record::AnchorType;

use crate::anchor::AnchorService;
use crate::store::{RecordStore, StoreError};

/// Counters from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Pending records examined.
    pub scanned: usize,
    /// Proofs upgraded to terminal.
    pub upgraded: usize,
    /// Proofs not yet upgradable; retried next cycle.
    pub unchanged: usize,
    /// Upgrade attempts that failed or timed out.
    pub failed: usize,
}

/// Periodic proof-upgrade loop.
pub struct ProofUpgradeWorker {
    store: RecordStore,
    anchors: AnchorService,
    poll_interval: Duration,
    item_timeout: Duration,
    batch_size: u32,
    shutdown: Arc<AtomicBool>,
}

impl ProofUpgradeWorker {
    #[must_use]
    pub fn new(
        store: RecordStore,
        anchors: AnchorService,
        poll_interval: Duration,
        item_timeout: Duration,
        batch_size: u32,
    ) -> Self {
        Self {
            store,
            anchors,
            poll_interval,
            item_timeout,
            batch_size,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the loop after the current cycle.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Runs sweeps until the shutdown flag is set. Cycle failures are logged
    /// and retried on the next interval; this loop itself never fails.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            batch_size = self.batch_size,
            "proof-upgrade worker started"
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.run_cycle().await {
                Ok(stats) if stats.scanned > 0 => {
                    info!(
                        scanned = stats.scanned,
                        upgraded = stats.upgraded,
                        unchanged = stats.unchanged,
                        failed = stats.failed,
                        "proof-upgrade cycle complete"
                    );
                },
                Ok(_) => debug!("proof-upgrade cycle found nothing pending"),
                Err(error) => warn!(%error, "proof-upgrade cycle failed"),
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        info!("proof-upgrade worker stopped");
    }

    /// One sweep over the pending batch.
    ///
    /// # Errors
    ///
    /// Returns an error only when the pending-batch query itself fails;
    /// per-record failures are counted in the stats instead.
    pub async fn run_cycle(&self) -> Result<CycleStats, StoreError> {
        let pending = self.store.pending_upgrades_async(self.batch_size).await?;
        let mut stats = CycleStats {
            scanned: pending.len(),
            ..CycleStats::default()
        };

        for item in pending {
            let attempt = tokio::time::timeout(
                self.item_timeout,
                self.anchors.upgrade(AnchorType::Ots, &item.proof),
            )
            .await;

            match attempt {
                Ok(Ok(Some(upgraded))) => {
                    let applied = self
                        .store
                        .apply_upgraded_proof_async(&item.id, upgraded, Utc::now())
                        .await?;
                    if applied {
                        stats.upgraded += 1;
                        info!(record_id = %item.id, "anchor proof upgraded");
                    } else {
                        // Already terminal; nothing to do.
                        stats.unchanged += 1;
                    }
                },
                Ok(Ok(None)) => {
                    stats.unchanged += 1;
                    debug!(record_id = %item.id, "proof not yet upgradable");
                },
                Ok(Err(error)) => {
                    stats.failed += 1;
                    warn!(record_id = %item.id, %error, "proof upgrade failed, will retry");
                },
                Err(_) => {
                    stats.failed += 1;
                    warn!(
                        record_id = %item.id,
                        timeout_secs = self.item_timeout.as_secs(),
                        "proof upgrade timed out, will retry"
                    );
                },
            }
        }

        Ok(stats)
    }
}
