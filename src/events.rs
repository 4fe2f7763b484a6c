//! Per-experiment event subscriptions.
//!
//! Replaces ambient global signals with an explicit subscription surface:
//! each experiment id gets its own broadcast channel when the run is
//! registered, and the channel is torn down after the terminal `Finished`
//! event. Subscribing to an id with no channel yields a closed stream.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted while supervising one training process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrainingEvent {
    /// One raw output line, in stream order.
    Line { experiment_id: i64, line: String },
    /// Merged snapshot of every metric seen so far.
    Metrics { experiment_id: i64, metrics: HashMap<String, f64> },
    /// Progress percentage with a human-readable "Step X/Y" message.
    Progress { experiment_id: i64, percent: u8, message: String },
    /// Terminal event; emitted exactly once, after all other events.
    Finished { experiment_id: i64, success: bool, message: String },
}

impl TrainingEvent {
    #[must_use]
    pub fn experiment_id(&self) -> i64 {
        match self {
            Self::Line { experiment_id, .. }
            | Self::Metrics { experiment_id, .. }
            | Self::Progress { experiment_id, .. }
            | Self::Finished { experiment_id, .. } => *experiment_id,
        }
    }
}

/// Broadcast hub for training events, one channel per experiment id.
///
/// Channels exist only between [`register`](Self::register) and
/// [`remove`](Self::remove); the channels map therefore doubles as the set
/// of experiments that can still emit events.
#[derive(Debug, Default)]
pub struct TrainingEventBus {
    state: Mutex<BusState>,
}

#[derive(Debug, Default)]
struct BusState {
    senders: HashMap<i64, broadcast::Sender<TrainingEvent>>,
    // The channel's initial receiver, parked until the first subscriber
    // claims it. Holding it keeps early events buffered in the channel.
    initial: HashMap<i64, broadcast::Receiver<TrainingEvent>>,
}

impl TrainingEventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the channel for a newly started experiment and parks its
    /// initial receiver, so events published from this point on are retained
    /// for the first subscriber.
    pub(crate) fn register(&self, experiment_id: i64) {
        let (sender, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut state = self.state.lock().unwrap();
        state.senders.insert(experiment_id, sender);
        state.initial.insert(experiment_id, receiver);
    }

    /// Subscribes to events for one experiment.
    ///
    /// The first subscriber claims the parked initial receiver and sees
    /// every event published since registration (up to channel capacity);
    /// later subscribers join at the current stream position. For unknown or
    /// already-finished experiments the returned receiver reports the stream
    /// as closed. Slow subscribers miss events rather than block the process
    /// task.
    pub fn subscribe(&self, experiment_id: i64) -> broadcast::Receiver<TrainingEvent> {
        let mut state = self.state.lock().unwrap();
        if let Some(receiver) = state.initial.remove(&experiment_id) {
            return receiver;
        }
        match state.senders.get(&experiment_id) {
            Some(sender) => sender.subscribe(),
            None => closed_receiver(),
        }
    }

    /// Publishes an event to the experiment's subscribers, if any.
    pub(crate) fn publish(&self, event: TrainingEvent) {
        let sender = {
            let state = self.state.lock().unwrap();
            state.senders.get(&event.experiment_id()).cloned()
        };
        if let Some(sender) = sender {
            // No receivers is fine; events are best-effort notifications.
            let _ = sender.send(event);
        }
    }

    /// Drops the experiment's channel; existing receivers drain what is
    /// buffered and then see the stream end.
    pub(crate) fn remove(&self, experiment_id: i64) {
        let mut state = self.state.lock().unwrap();
        state.initial.remove(&experiment_id);
        state.senders.remove(&experiment_id);
    }
}

fn closed_receiver() -> broadcast::Receiver<TrainingEvent> {
    broadcast::channel(1).1
}
