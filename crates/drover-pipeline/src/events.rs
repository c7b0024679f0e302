//! Scheduler and pipeline events for observability.
//!
//! Emitted via a [`tokio::sync::broadcast`] channel so observers (the CLI
//! progress printer, tests) can follow dispatch without coupling to the
//! scheduler internals.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DroverEvent {
    CycleStarted {
        actionable: usize,
        in_flight: usize,
    },
    TicketDispatched {
        ticket: String,
        stage: String,
    },
    StageCompleted {
        ticket: String,
        stage: String,
        outcome: String,
    },
    TicketRetried {
        ticket: String,
        stage: String,
        retry_number: u32,
    },
    TicketEscalated {
        ticket: String,
        stage: String,
        reason: String,
    },
    TicketCompleted {
        ticket: String,
    },
    RateLimitBackoff {
        streak: u32,
        delay_secs: u64,
    },
    CooldownEntered {
        cooldown_secs: u64,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<DroverEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers. With no active receivers
    /// the event is silently dropped.
    pub fn emit(&self, event: DroverEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DroverEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(DroverEvent::TicketDispatched {
            ticket: "acme/api#1".into(),
            stage: "Planning".into(),
        });

        match rx.recv().await.unwrap() {
            DroverEvent::TicketDispatched { ticket, stage } => {
                assert_eq!(ticket, "acme/api#1");
                assert_eq!(stage, "Planning");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(DroverEvent::CooldownEntered { cooldown_secs: 300 });
    }
}
