// src/retrieval/events.rs
use crate::cmf::models::{FilingJob, Period};
use serde::Serialize;
use tokio::sync::broadcast;

/// Lifecycle of a single job as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Queued,
    Running,
    Retrying,
    Succeeded,
    PartiallySucceeded,
    Failed,
}

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
}

/// Progress update sent to any observer of a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Job {
        rut: u32,
        period: Period,
        state: JobState,
        attempt: u32,
        detail: Option<String>,
    },
    Run {
        state: RunState,
        total_jobs: usize,
    },
}

pub type EventSender = broadcast::Sender<RunEvent>;
pub type EventReceiver = broadcast::Receiver<RunEvent>;

pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity.max(1))
}

/// Logs every transition and forwards it to subscribers, if any.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    sender: Option<EventSender>,
}

impl EventEmitter {
    pub fn new(sender: EventSender) -> Self {
        Self { sender: Some(sender) }
    }

    pub fn subscribe(&self) -> Option<EventReceiver> {
        self.sender.as_ref().map(|s| s.subscribe())
    }

    pub fn job(&self, job: &FilingJob, state: JobState, attempt: u32, detail: Option<String>) {
        match (&state, &detail) {
            (JobState::Failed, Some(d)) => tracing::warn!("[{}] {:?} after {} attempt(s): {}", job.label(), state, attempt, d),
            (JobState::Retrying, Some(d)) => tracing::warn!("[{}] {:?} (attempt {}): {}", job.label(), state, attempt, d),
            (JobState::Queued, _) => tracing::debug!("[{}] {:?}", job.label(), state),
            (_, Some(d)) => tracing::info!("[{}] {:?} (attempt {}): {}", job.label(), state, attempt, d),
            (_, None) => tracing::info!("[{}] {:?} (attempt {})", job.label(), state, attempt),
        }
        self.send(RunEvent::Job {
            rut: job.company.tax_id.number(),
            period: job.period,
            state,
            attempt,
            detail,
        });
    }

    pub fn run(&self, state: RunState, total_jobs: usize) {
        tracing::info!("Run {:?} ({} jobs)", state, total_jobs);
        self.send(RunEvent::Run { state, total_jobs });
    }

    fn send(&self, event: RunEvent) {
        if let Some(sender) = &self.sender {
            // No subscribers is fine; the log line above already recorded the transition.
            let _ = sender.send(event);
        }
    }
}
