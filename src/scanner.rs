//! Settlement scanner: on every new block, settles bets past their closing time

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{bounded, resubscribe, BettingContract, BlockSource, BlockStream, SubscribePolicy};
use crate::config::SettlementCfg;
use crate::error::{BettingError, Result};

/// Source of the current time, unix seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub total_bets: u64,
    pub checked: u64,
    pub due: u64,
    pub settled: u64,
    pub skipped_in_flight: u64,
    pub failed: u64,
}

/// Bets with a settlement under way. `None` while a scan is submitting; `Some(until)` after a
/// timed out submission whose transaction may still get mined.
type InFlightSet = Arc<Mutex<HashMap<u64, Option<Instant>>>>;

fn lock_in_flight(set: &InFlightSet) -> MutexGuard<'_, HashMap<u64, Option<Instant>>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases an in-flight entry once the settlement attempt is over
struct InFlightEntry {
    bet_id: u64,
    set: InFlightSet,
    hold_until: Option<Instant>,
}

impl InFlightEntry {
    /// Keep the bet claimed until `until` instead of releasing it on drop
    fn hold_until(&mut self, until: Instant) {
        self.hold_until = Some(until);
    }
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        let mut set = lock_in_flight(&self.set);
        match self.hold_until {
            Some(until) => {
                set.insert(self.bet_id, Some(until));
            }
            None => {
                set.remove(&self.bet_id);
            }
        }
    }
}

pub struct SettlementScanner {
    contract: Arc<dyn BettingContract>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    settle_timeout: Duration,
    track_in_flight: bool,
    continue_after_failure: bool,
    max_concurrent_scans: usize,
    in_flight: InFlightSet,
}

impl SettlementScanner {
    pub fn new(contract: Arc<dyn BettingContract>, config: &SettlementCfg) -> Self {
        Self {
            contract,
            clock: Arc::new(SystemClock),
            call_timeout: config.call_timeout(),
            // covers submission plus the receipt wait
            settle_timeout: config.call_timeout() + config.confirmation_timeout(),
            track_in_flight: config.track_in_flight,
            continue_after_failure: config.continue_after_failure,
            max_concurrent_scans: config.max_concurrent_scans.max(1),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timeouts(mut self, call_timeout: Duration, settle_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self.settle_timeout = settle_timeout;
        self
    }

    /// Claim `bet_id` for settlement. `None` when another scan holds it, or a timed out
    /// submission holds it and its hold has not expired yet.
    fn claim(&self, bet_id: u64) -> Option<InFlightEntry> {
        let mut set = lock_in_flight(&self.in_flight);
        match set.get(&bet_id) {
            Some(None) => return None,
            Some(Some(until)) if Instant::now() < *until => return None,
            _ => {}
        }
        set.insert(bet_id, None);
        Some(InFlightEntry {
            bet_id,
            set: Arc::clone(&self.in_flight),
            hold_until: None,
        })
    }

    /// Scan every bet once, in ascending id order, settling the ones past their closing time.
    ///
    /// Read failures abort the scan. A failed settlement aborts it as well unless
    /// `continue_after_failure` is set.
    pub async fn check_bets(&self, cancel: &CancellationToken) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        let total = bounded("totalBets()", self.call_timeout, cancel, self.contract.total_bets()).await?;
        report.total_bets = total;
        if total == 0 {
            info!("No bets to check");
            return Ok(report);
        }
        debug!("Checking {} bets", total);

        for bet_id in 0..total {
            let operation = format!("bets({})", bet_id);
            let bet = bounded(&operation, self.call_timeout, cancel, self.contract.bet(bet_id)).await?;
            report.checked += 1;

            let now = self.clock.now();
            if !bet.is_due(now) {
                continue;
            }
            report.due += 1;
            info!(bet_id, "Bet {} has passed its closing time", bet_id);

            let mut entry = if self.track_in_flight {
                match self.claim(bet_id) {
                    Some(entry) => Some(entry),
                    None => {
                        report.skipped_in_flight += 1;
                        info!(bet_id, "Settlement of bet {} already in flight, skipping", bet_id);
                        continue;
                    }
                }
            } else {
                None
            };

            let operation = format!("settleBet({})", bet_id);
            let outcome = bounded(&operation, self.settle_timeout, cancel, self.contract.settle_bet(bet_id)).await;
            if let (Err(BettingError::Timeout { .. }), Some(entry)) = (&outcome, entry.as_mut()) {
                // the transaction may still get mined, keep other scans off this bet for another round
                warn!(bet_id, "Settlement of bet {} timed out, holding it for {:?}", bet_id, self.settle_timeout);
                entry.hold_until(Instant::now() + self.settle_timeout);
            }
            drop(entry);

            match outcome {
                Ok(tx_hash) => {
                    report.settled += 1;
                    info!(bet_id, %tx_hash, "Bet settled: betId={}", bet_id);
                }
                Err(e) if self.continue_after_failure && !matches!(e, BettingError::Cancelled(_)) => {
                    report.failed += 1;
                    error!(bet_id, "Error settling bet {}: {}", bet_id, e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Subscribe to new blocks and consume them on a background task.
    ///
    /// Errors opening the first subscription are returned here. Afterwards an ended subscription is
    /// reopened until `cancel` fires, so the task only finishes on shutdown.
    pub async fn start(
        self: Arc<Self>,
        source: Arc<dyn BlockSource>,
        policy: SubscribePolicy,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let blocks = bounded("subscribe to new blocks", policy.timeout, &cancel, source.subscribe_blocks()).await?;
        info!("Settlement bot started.");
        Ok(tokio::spawn(self.serve(blocks, Some((source, policy)), cancel)))
    }

    /// Start a scan for every block of a single stream until it ends or `cancel` fires
    pub async fn run(self: Arc<Self>, blocks: BlockStream, cancel: CancellationToken) {
        self.serve(blocks, None, cancel).await
    }

    async fn serve(
        self: Arc<Self>,
        mut blocks: BlockStream,
        source: Option<(Arc<dyn BlockSource>, SubscribePolicy)>,
        cancel: CancellationToken,
    ) {
        let mut scans: JoinSet<Result<ScanReport>> = JoinSet::new();

        loop {
            if !self.consume(&mut blocks, &mut scans, &cancel).await {
                break;
            }

            let Some((source, policy)) = &source else {
                warn!("Block subscription ended");
                break;
            };
            warn!("Block subscription ended, resubscribing in {:?}", policy.retry_delay);
            match resubscribe("subscribe to new blocks", *policy, &cancel, || source.subscribe_blocks()).await {
                Some(reopened) => blocks = reopened,
                None => break,
            }
        }

        if !scans.is_empty() {
            info!("Waiting for {} running scans", scans.len());
        }
        while let Some(joined) = scans.join_next().await {
            log_scan(joined);
        }
        info!("Settlement bot stopped");
    }

    /// Spawn a scan per block, up to `max_concurrent_scans` at a time.
    /// Returns `true` when the stream ended, `false` on shutdown.
    async fn consume(
        self: &Arc<Self>,
        blocks: &mut BlockStream,
        scans: &mut JoinSet<Result<ScanReport>>,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown requested, stopping settlement bot");
                    return false;
                }
                Some(joined) = scans.join_next(), if !scans.is_empty() => log_scan(joined),
                block = blocks.next() => match block {
                    Some(block) => {
                        info!(block = %block, "New block mined! Checking bets...");
                        if scans.len() >= self.max_concurrent_scans {
                            warn!(block = %block, "{} scans still running, skipping this block", scans.len());
                            continue;
                        }
                        let scanner = Arc::clone(self);
                        let scan_cancel = cancel.clone();
                        scans.spawn(async move { scanner.check_bets(&scan_cancel).await });
                    }
                    None => return true,
                },
            }
        }
    }
}

fn log_scan(joined: std::result::Result<Result<ScanReport>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(report)) => debug!(
            total = report.total_bets,
            due = report.due,
            settled = report.settled,
            skipped = report.skipped_in_flight,
            failed = report.failed,
            "Scan finished"
        ),
        Ok(Err(BettingError::Cancelled(operation))) => info!("Scan interrupted at {}", operation),
        Ok(Err(e)) => error!("Error checking bets: {}", e),
        Err(e) => error!("Scan task failed: {}", e),
    }
}
