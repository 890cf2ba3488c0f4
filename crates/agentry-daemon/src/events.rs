//! In-process run event bus.
//!
//! Four named channels plus a wildcard channel that receives every event.
//! Delivery is best-effort and at-most-once: there is no replay, a late
//! subscriber misses earlier events, and a lagging receiver loses the
//! oldest ones.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::runner::OutputEvent;
use crate::storage::RunStatus;

/// Default per-channel buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Named event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventChannel {
    RunStarted,
    RunOutput,
    RunFinished,
    RunCancelled,
}

impl EventChannel {
    pub const ALL: [Self; 4] = [
        Self::RunStarted,
        Self::RunOutput,
        Self::RunFinished,
        Self::RunCancelled,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::RunOutput => "run.output",
            Self::RunFinished => "run.finished",
            Self::RunCancelled => "run.cancelled",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::RunStarted => 0,
            Self::RunOutput => 1,
            Self::RunFinished => 2,
            Self::RunCancelled => 3,
        }
    }
}

/// Event published on the bus. Serialises with `type` set to the channel
/// name; every variant carries the originating run's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum RunEvent {
    #[serde(rename = "run.started")]
    Started { run_id: String, runner: String },

    #[serde(rename = "run.output")]
    Output { run_id: String, event: OutputEvent },

    #[serde(rename = "run.finished")]
    Finished {
        run_id: String,
        status: RunStatus,
        exit_code: i32,
    },

    #[serde(rename = "run.cancelled")]
    Cancelled { run_id: String },
}

impl RunEvent {
    pub const fn channel(&self) -> EventChannel {
        match self {
            Self::Started { .. } => EventChannel::RunStarted,
            Self::Output { .. } => EventChannel::RunOutput,
            Self::Finished { .. } => EventChannel::RunFinished,
            Self::Cancelled { .. } => EventChannel::RunCancelled,
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::Started { run_id, .. }
            | Self::Output { run_id, .. }
            | Self::Finished { run_id, .. }
            | Self::Cancelled { run_id } => run_id,
        }
    }
}

/// Process-wide publish point. Cloning shares the same channels.
#[derive(Debug, Clone)]
pub struct EventBus {
    channels: [broadcast::Sender<RunEvent>; 4],
    all: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: std::array::from_fn(|_| broadcast::channel(capacity).0),
            all: broadcast::channel(capacity).0,
        }
    }

    /// Subscribe to one named channel.
    pub fn subscribe(&self, channel: EventChannel) -> broadcast::Receiver<RunEvent> {
        self.channels[channel.index()].subscribe()
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self) -> broadcast::Receiver<RunEvent> {
        self.all.subscribe()
    }

    /// Publish to the event's channel and the wildcard channel.
    ///
    /// Returns how many receivers were handed the event; zero is not an
    /// error.
    pub fn publish(&self, event: RunEvent) -> usize {
        let channel = event.channel();
        let named = self.channels[channel.index()]
            .send(event.clone())
            .unwrap_or(0);
        let wildcard = self.all.send(event).unwrap_or(0);
        trace!(channel = channel.name(), receivers = named + wildcard, "Published event");
        named + wildcard
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
