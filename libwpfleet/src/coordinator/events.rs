use async_trait::async_trait;
use color_eyre::eyre::{Context, Result};
use tokio::sync::mpsc;

use super::RunPhase;
use crate::executor::Status;
use crate::log::*;

pub type EventTx = mpsc::Sender<RunEvent>;
pub type EventRx = mpsc::Receiver<RunEvent>;

/// Progress of a run, as it happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    PhaseChanged {
        run_id: i64,
        phase: RunPhase,
    },
    TaskStarted {
        label: String,
    },
    TaskFinished {
        label: String,
        completed: usize,
        total: usize,
        status: Status,
        duration_ms: u64,
        error_message: String,
    },
}

/// Where run events go. Handed to the coordinator at construction; shared by
/// every worker.
#[async_trait]
pub trait EventSink: std::fmt::Debug + Send + Sync {
    async fn emit(&self, event: RunEvent) -> Result<()>;
}

/// Forwards events over a channel to an [`EventSource`].
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: EventTx,
}

impl ChannelEventSink {
    pub fn new(tx: EventTx) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: RunEvent) -> Result<()> {
        self.tx.send(event).await.context("Failed sending run event")
    }
}

#[derive(Debug)]
pub struct EventSource {
    rx: EventRx,
}

impl EventSource {
    pub fn new(rx: EventRx) -> Self {
        Self { rx }
    }

    /// The next event, or `None` once every sink is gone.
    pub async fn next(&mut self) -> Option<RunEvent> {
        self.rx.recv().await
    }
}

/// A connected sink/source pair.
pub fn channel(capacity: usize) -> (ChannelEventSink, EventSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (ChannelEventSink::new(tx), EventSource::new(rx))
}

/// Writes every event to the log.
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: RunEvent) -> Result<()> {
        match event {
            RunEvent::PhaseChanged { run_id, phase } => {
                debug!("run {}: {}", run_id, phase)
            }
            RunEvent::TaskStarted { label } => debug!("task started: {}", label),
            RunEvent::TaskFinished {
                label,
                completed,
                total,
                status,
                duration_ms,
                error_message,
            } => {
                if error_message.is_empty() {
                    info!("[{}/{}] {}: {} ({}ms)", completed, total, label, status, duration_ms)
                } else {
                    warn!(
                        "[{}/{}] {}: {} ({}ms) {}",
                        completed, total, label, status, duration_ms, error_message
                    )
                }
            }
        }
        Ok(())
    }
}
