//! Progress tracking for replication runs

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use zreplica_types::RunId;

const EVENT_INTERVAL: Duration = Duration::from_millis(100);

/// Progress information for one run
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Run identifier
    pub run_id: RunId,
    /// Current phase
    pub phase: ReplicationPhase,
    /// Bytes written into the import so far
    pub bytes_transferred: u64,
    /// Advisory stream size from the dry run
    pub estimated_bytes: u64,
    /// Current transfer rate (bytes per second)
    pub transfer_rate: f64,
    /// Estimated time remaining
    pub eta: Option<Duration>,
    /// Start time of the transfer phase
    pub start_time: Instant,
}

/// Replication phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationPhase {
    /// Creating the run tag on the source
    Tagging,
    /// Reading both catalogs
    ReadingCatalogs,
    /// Finding the common ancestor and checking for changes
    Matching,
    /// Reclaiming space on the target
    Pruning,
    /// Estimating the stream size
    Estimating,
    /// Streaming
    Transferring,
    /// Checking what landed on the target
    Verifying,
    /// Deleting superseded tags
    Sweeping,
    /// Completed
    Completed,
    /// Failed
    Failed,
}

impl TransferProgress {
    /// Create a new progress record
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            phase: ReplicationPhase::Tagging,
            bytes_transferred: 0,
            estimated_bytes: 0,
            transfer_rate: 0.0,
            eta: None,
            start_time: Instant::now(),
        }
    }

    /// Update the byte counter and derived rate and ETA
    pub fn update_bytes(&mut self, bytes_transferred: u64) {
        self.bytes_transferred = bytes_transferred;

        let elapsed = self.start_time.elapsed();
        if elapsed.as_secs_f64() > 0.0 {
            self.transfer_rate = bytes_transferred as f64 / elapsed.as_secs_f64();
        }

        if self.transfer_rate > 0.0 && self.estimated_bytes > bytes_transferred {
            let remaining = self.estimated_bytes - bytes_transferred;
            self.eta = Some(Duration::from_secs_f64(remaining as f64 / self.transfer_rate));
        } else {
            self.eta = None;
        }
    }

    /// Percentage of the estimate moved so far; may exceed 100
    pub fn percent(&self) -> f64 {
        if self.estimated_bytes > 0 {
            (self.bytes_transferred as f64 / self.estimated_bytes as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Format transfer rate as human-readable string
    pub fn format_transfer_rate(&self) -> String {
        format_bytes_per_second(self.transfer_rate)
    }

    /// Format ETA as human-readable string
    pub fn format_eta(&self) -> String {
        match self.eta {
            Some(eta) => crate::report::format_duration(eta),
            None => "Unknown".to_string(),
        }
    }
}

/// Progress event types
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Phase changed
    PhaseChanged(ReplicationPhase),
    /// Stream started with this estimate
    TransferStarted(u64),
    /// Byte counter update
    Update(TransferProgress),
    /// Run completed
    Completed(TransferProgress),
    /// Run failed
    Failed(String),
}

#[derive(Debug)]
struct ProgressState {
    progress: TransferProgress,
    last_event: Option<Instant>,
    last_log: Instant,
}

/// Progress reporter for replication runs
///
/// Counters are observational only; nothing in the run depends on them.
#[derive(Debug)]
pub struct ProgressReporter {
    state: Arc<RwLock<ProgressState>>,
    event_tx: mpsc::UnboundedSender<ProgressEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<ProgressEvent>>,
    log_interval: Duration,
}

impl ProgressReporter {
    /// Create a new progress reporter logging at most once per `log_interval`
    pub fn new(run_id: RunId, log_interval: Duration) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = ProgressState {
            progress: TransferProgress::new(run_id),
            last_event: None,
            last_log: Instant::now(),
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            event_tx,
            event_rx: Some(event_rx),
            log_interval,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ProgressEvent>> {
        self.event_rx.take()
    }

    /// Update the current phase
    pub async fn set_phase(&self, phase: ReplicationPhase) {
        self.state.write().await.progress.phase = phase;
        debug!("Replication phase changed to: {:?}", phase);
        let _ = self.event_tx.send(ProgressEvent::PhaseChanged(phase));
    }

    /// Reset counters for a stream of `estimated_bytes`
    pub async fn transfer_started(&self, estimated_bytes: u64) {
        {
            let mut state = self.state.write().await;
            state.progress.phase = ReplicationPhase::Transferring;
            state.progress.estimated_bytes = estimated_bytes;
            state.progress.start_time = Instant::now();
            state.progress.update_bytes(0);
            state.last_event = None;
            state.last_log = Instant::now();
        }
        let _ = self
            .event_tx
            .send(ProgressEvent::TransferStarted(estimated_bytes));
    }

    /// Record the running byte total
    pub async fn record_bytes(&self, bytes_transferred: u64) {
        let mut state = self.state.write().await;
        state.progress.update_bytes(bytes_transferred);

        let now = Instant::now();
        if state
            .last_event
            .map_or(true, |last| now.duration_since(last) >= EVENT_INTERVAL)
        {
            state.last_event = Some(now);
            let _ = self
                .event_tx
                .send(ProgressEvent::Update(state.progress.clone()));
        }

        if now.duration_since(state.last_log) >= self.log_interval {
            state.last_log = now;
            let progress = &state.progress;
            info!(
                bytes = progress.bytes_transferred,
                estimated = progress.estimated_bytes,
                "Transfer {:.1}% at {}, ETA {}",
                progress.percent(),
                progress.format_transfer_rate(),
                progress.format_eta()
            );
        }
    }

    /// Report run completed
    pub async fn completed(&self) {
        let progress = {
            let mut state = self.state.write().await;
            state.progress.phase = ReplicationPhase::Completed;
            state.progress.clone()
        };
        let _ = self.event_tx.send(ProgressEvent::Completed(progress));
    }

    /// Report run failed
    pub async fn failed(&self, error: String) {
        self.state.write().await.progress.phase = ReplicationPhase::Failed;
        let _ = self.event_tx.send(ProgressEvent::Failed(error));
    }
}

impl Clone for ProgressReporter {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            event_tx: self.event_tx.clone(),
            event_rx: None, // Clone doesn't get the receiver
            log_interval: self.log_interval,
        }
    }
}

/// Format bytes per second as human-readable string
pub fn format_bytes_per_second(bytes_per_sec: f64) -> String {
    format!("{}/s", crate::report::format_bytes(bytes_per_sec as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_math() {
        let mut progress = TransferProgress::new(RunId::new_v4());
        progress.estimated_bytes = 1000;
        progress.update_bytes(250);
        assert_eq!(progress.percent(), 25.0);

        progress.update_bytes(1500);
        assert_eq!(progress.percent(), 150.0);
        assert!(progress.eta.is_none());
    }

    #[tokio::test]
    async fn test_events_are_delivered() {
        let mut reporter = ProgressReporter::new(RunId::new_v4(), Duration::from_secs(60));
        let mut events = reporter.take_event_receiver().unwrap();
        assert!(reporter.take_event_receiver().is_none());

        let clone = reporter.clone();
        clone.set_phase(ReplicationPhase::Matching).await;
        clone.transfer_started(4096).await;
        clone.record_bytes(1024).await;
        clone.completed().await;

        assert!(matches!(
            events.recv().await,
            Some(ProgressEvent::PhaseChanged(ReplicationPhase::Matching))
        ));
        assert!(matches!(
            events.recv().await,
            Some(ProgressEvent::TransferStarted(4096))
        ));
        match events.recv().await {
            Some(ProgressEvent::Update(progress)) => assert_eq!(progress.bytes_transferred, 1024),
            other => panic!("unexpected event {:?}", other),
        }
        match events.recv().await {
            Some(ProgressEvent::Completed(progress)) => {
                assert_eq!(progress.phase, ReplicationPhase::Completed);
                assert_eq!(progress.bytes_transferred, 1024);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_updates_are_throttled() {
        let mut reporter = ProgressReporter::new(RunId::new_v4(), Duration::from_secs(60));
        let mut events = reporter.take_event_receiver().unwrap();

        for total in 1..=50 {
            reporter.record_bytes(total).await;
        }
        drop(reporter);

        let mut updates = 0;
        while let Some(event) = events.recv().await {
            if matches!(event, ProgressEvent::Update(_)) {
                updates += 1;
            }
        }
        assert!(updates >= 1 && updates < 50);
    }
}
