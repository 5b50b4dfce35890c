// src/retrieval/mod.rs
pub mod events;
pub mod job;
pub mod orchestrator;
pub mod stats;

pub use events::{event_channel, EventEmitter, EventReceiver, JobState, RunEvent, RunState};
pub use job::{JobOutcome, JobResult, RetrievalJob};
pub use orchestrator::{BulkOrchestrator, DiscardSink, ResultSink};
pub use stats::{JobRecord, RunStatistics};
