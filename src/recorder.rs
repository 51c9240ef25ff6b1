//! Event recorder: mirrors bet events into the store, one record per log entry

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{bounded, resubscribe, EventSource, EventStream, SubscribePolicy};
use crate::config::RecorderCfg;
use crate::error::Result;
use crate::store::EventStore;
use crate::types::{ContractEvent, EventRecord};

/// Outcome counters, returned when the recorder stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderSummary {
    pub received: u64,
    pub recorded: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub undecodable: u64,
    pub resubscriptions: u64,
}

type WriteResult = (EventRecord, Result<()>);

impl RecorderSummary {
    fn absorb(&mut self, joined: std::result::Result<WriteResult, JoinError>) {
        match joined {
            Ok((record, Ok(()))) => {
                self.recorded += 1;
                info!(hash = %record.hash, "{} event stored: {}", record.name, payload(&record));
            }
            Ok((record, Err(e))) if e.is_duplicate() => {
                self.duplicates += 1;
                warn!(hash = %record.hash, "{} event already stored, dropping: {}", record.name, payload(&record));
            }
            Ok((record, Err(e))) => {
                self.failed += 1;
                error!(hash = %record.hash, "Error storing {} event {}: {}", record.name, payload(&record), e);
            }
            Err(e) => {
                self.failed += 1;
                error!("Event write task failed: {}", e);
            }
        }
    }
}

fn payload(record: &EventRecord) -> String {
    serde_json::to_string(&record.data).unwrap_or_default()
}

/// Why consuming a subscription stopped
enum Halt {
    Shutdown,
    StreamEnded,
}

pub struct EventRecorder {
    store: Arc<dyn EventStore>,
    write_timeout: Duration,
    drain_timeout: Duration,
    write_slots: Arc<Semaphore>,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn EventStore>, config: &RecorderCfg) -> Self {
        Self {
            store,
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
            write_slots: Arc::new(Semaphore::new(config.max_in_flight_writes.max(1))),
        }
    }

    /// Open the event subscription and consume it on a background task.
    ///
    /// Errors opening the first subscription are returned here. Afterwards an ended subscription is
    /// reopened until `cancel` fires, so the task only finishes on shutdown.
    pub async fn start(
        self,
        source: Arc<dyn EventSource>,
        policy: SubscribePolicy,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<RecorderSummary>> {
        let events = bounded(
            "subscribe to bet events",
            policy.timeout,
            &cancel,
            source.subscribe_bet_events(),
        )
        .await?;

        info!("Event listener started.");
        Ok(tokio::spawn(self.serve(events, Some((source, policy)), cancel)))
    }

    /// Persist every event of a single stream until it ends or `cancel` fires
    pub async fn run(self, events: EventStream, cancel: CancellationToken) -> RecorderSummary {
        self.serve(events, None, cancel).await
    }

    async fn serve(
        self,
        mut events: EventStream,
        source: Option<(Arc<dyn EventSource>, SubscribePolicy)>,
        cancel: CancellationToken,
    ) -> RecorderSummary {
        let mut summary = RecorderSummary::default();
        let mut writes: JoinSet<WriteResult> = JoinSet::new();
        // separate from `cancel` so in-flight writes get to finish during shutdown
        let writes_cancel = CancellationToken::new();

        loop {
            if let Halt::Shutdown = self.consume(&mut events, &mut writes, &mut summary, &writes_cancel, &cancel).await {
                break;
            }

            let Some((source, policy)) = &source else {
                warn!("Event subscription ended");
                break;
            };
            warn!("Event subscription ended, resubscribing in {:?}", policy.retry_delay);
            match resubscribe("subscribe to bet events", *policy, &cancel, || source.subscribe_bet_events()).await {
                Some(reopened) => {
                    summary.resubscriptions += 1;
                    events = reopened;
                }
                None => break,
            }
        }

        self.drain(&mut writes, &mut summary, writes_cancel).await;
        info!(
            "Event recorder stopped: {} received, {} stored, {} duplicates, {} failed, {} undecodable, {} resubscriptions",
            summary.received,
            summary.recorded,
            summary.duplicates,
            summary.failed,
            summary.undecodable,
            summary.resubscriptions
        );
        summary
    }

    /// Dispatch a write per delivered event until the stream ends or `cancel` fires
    async fn consume(
        &self,
        events: &mut EventStream,
        writes: &mut JoinSet<WriteResult>,
        summary: &mut RecorderSummary,
        writes_cancel: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Halt {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown requested, stopping event recorder");
                    return Halt::Shutdown;
                }
                Some(joined) = writes.join_next(), if !writes.is_empty() => summary.absorb(joined),
                delivery = events.next() => match delivery {
                    Some(Ok(event)) => {
                        summary.received += 1;
                        let permit = tokio::select! {
                            _ = cancel.cancelled() => {
                                warn!(hash = %event.hash, "Shutdown while waiting for a write slot, dropping {} event", event.data.name());
                                return Halt::Shutdown;
                            }
                            permit = Arc::clone(&self.write_slots).acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(e) => {
                                    error!("Write slots closed: {}", e);
                                    return Halt::Shutdown;
                                }
                            },
                        };
                        self.dispatch(writes, event, permit, writes_cancel.clone());
                    }
                    Some(Err(e)) => {
                        summary.undecodable += 1;
                        error!("Failed to decode bet event: {}", e);
                    }
                    None => return Halt::StreamEnded,
                },
            }
        }
    }

    fn dispatch(
        &self,
        writes: &mut JoinSet<WriteResult>,
        event: ContractEvent,
        permit: OwnedSemaphorePermit,
        writes_cancel: CancellationToken,
    ) {
        let store = Arc::clone(&self.store);
        let write_timeout = self.write_timeout;

        writes.spawn(async move {
            let _permit = permit;
            let record = EventRecord::from(&event);
            debug!(hash = %record.hash, block = ?event.block_number, "Persisting {} event", record.name);

            let operation = format!("store {} event {}", record.name, record.hash);
            let result = bounded(&operation, write_timeout, &writes_cancel, store.create_event_record(&record)).await;
            (record, result)
        });
    }

    async fn drain(
        &self,
        writes: &mut JoinSet<WriteResult>,
        summary: &mut RecorderSummary,
        writes_cancel: CancellationToken,
    ) {
        if writes.is_empty() {
            return;
        }

        info!("Waiting for {} in-flight event writes", writes.len());
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(joined) = writes.join_next().await {
                summary.absorb(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!("In-flight event writes did not finish within {:?}, abandoning them", self.drain_timeout);
            writes_cancel.cancel();
            while let Some(joined) = writes.join_next().await {
                summary.absorb(joined);
            }
        }
    }
}
