use conductor_core::ConductorResult;
use conductor_store::{CheckpointEntry, CheckpointLog};
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{EventBus, OrchestratorEvent};

/// Background task appending every bus event to a checkpoint stream.
///
/// Sequence numbers continue from the last entry already in the stream, so a
/// journal reopened over the same log keeps a single increasing sequence.
pub struct EventJournal {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<u64>,
}

impl EventJournal {
    /// Start journaling `events` into `stream` of `log`.
    pub async fn spawn(
        events: &EventBus,
        log: Arc<dyn CheckpointLog>,
        stream: impl Into<String>,
    ) -> ConductorResult<Self> {
        let stream = stream.into();
        let next_seq = log
            .replay(&stream)
            .await?
            .last()
            .map_or(0, |e| e.sequence + 1);
        // Subscribe before returning so nothing emitted afterwards is missed.
        let rx = events.subscribe();
        let (stop, stop_rx) = oneshot::channel();
        debug!(stream = %stream, next_seq, "Event journal started");
        let handle = tokio::spawn(run(rx, stop_rx, log, stream, next_seq));
        Ok(Self {
            stop: Some(stop),
            handle,
        })
    }

    /// Flush events already emitted, stop, and return how many entries this
    /// journal wrote.
    pub async fn shutdown(mut self) -> u64 {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match (&mut self.handle).await {
            Ok(written) => written,
            Err(e) => {
                warn!(error = %e, "Event journal task failed");
                0
            }
        }
    }
}

async fn run(
    mut rx: broadcast::Receiver<OrchestratorEvent>,
    mut stop: oneshot::Receiver<()>,
    log: Arc<dyn CheckpointLog>,
    stream: String,
    mut seq: u64,
) -> u64 {
    let mut written = 0;
    loop {
        tokio::select! {
            biased;
            recv = rx.recv() => match recv {
                Ok(event) => {
                    if append(log.as_ref(), &stream, seq, &event).await {
                        seq += 1;
                        written += 1;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(stream = %stream, skipped, "Event journal lagged, events lost");
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut stop => {
                loop {
                    match rx.try_recv() {
                        Ok(event) => {
                            if append(log.as_ref(), &stream, seq, &event).await {
                                seq += 1;
                                written += 1;
                            }
                        }
                        Err(TryRecvError::Lagged(skipped)) => {
                            warn!(stream = %stream, skipped, "Event journal lagged, events lost");
                        }
                        Err(_) => break,
                    }
                }
                break;
            }
        }
    }
    debug!(stream = %stream, written, "Event journal stopped");
    written
}

async fn append(
    log: &dyn CheckpointLog,
    stream: &str,
    seq: u64,
    event: &OrchestratorEvent,
) -> bool {
    let data = match serde_json::to_value(event) {
        Ok(data) => data,
        Err(e) => {
            warn!(event = event.name(), error = %e, "Failed to serialize event");
            return false;
        }
    };
    match log
        .append(CheckpointEntry::new(stream, seq, event.name(), data))
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!(event = event.name(), error = %e, "Failed to journal event");
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_store::MemoryCheckpointLog;

    #[tokio::test]
    async fn test_journal_records_events_in_order() {
        let bus = EventBus::new(16);
        let log = Arc::new(MemoryCheckpointLog::new());
        let journal = EventJournal::spawn(&bus, log.clone(), "events").await.unwrap();

        bus.emit(OrchestratorEvent::Started);
        bus.emit(OrchestratorEvent::Paused);
        bus.emit(OrchestratorEvent::Stopped);
        assert_eq!(journal.shutdown().await, 3);

        let entries = log.replay("events").await.unwrap();
        let kinds: Vec<&str> = entries.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["started", "paused", "stopped"]);
        assert_eq!(entries[2].sequence, 2);
        assert_eq!(entries[0].data["event"], "started");
    }

    #[tokio::test]
    async fn test_sequence_continues_across_journals() {
        let bus = EventBus::new(16);
        let log = Arc::new(MemoryCheckpointLog::new());

        let first = EventJournal::spawn(&bus, log.clone(), "events").await.unwrap();
        bus.emit(OrchestratorEvent::Started);
        first.shutdown().await;

        let second = EventJournal::spawn(&bus, log.clone(), "events").await.unwrap();
        bus.emit(OrchestratorEvent::Stopped);
        second.shutdown().await;

        let seqs: Vec<u64> = log
            .replay("events")
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, vec![0, 1]);
    }
}
