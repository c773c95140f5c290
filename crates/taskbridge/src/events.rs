//! Events published to the hosting process

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use taskbridge_proto::Message;
use tokio::sync::mpsc;
use tracing::trace;

/// A task answered by its agent
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletion {
    /// Task identifier
    pub task_id: String,
    /// Agent that handled the task
    pub agent: String,
    /// Time between dispatch and response
    pub duration: Duration,
    /// Result reported by the agent
    pub result: Value,
    /// Error reported by the agent
    pub error: Option<String>,
}

impl TaskCompletion {
    /// Whether the agent reported success
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Bridge event
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// An agent registered or re-registered
    AgentRegistered {
        /// Agent name
        agent: String,
        /// The agent's full capability set after merging
        capabilities: Vec<String>,
    },
    /// A task response arrived
    TaskCompleted(TaskCompletion),
    /// A task was given up on without a response
    TaskExpired {
        /// Task identifier
        task_id: String,
        /// Agent the task was sent to
        agent: String,
    },
    /// The peer did not come back within the reconnect budget
    ConnectionLost {
        /// Reconnect windows counted
        attempts: u32,
    },
    /// The peer answered an agent query
    AgentQueryResponse(Message),
    /// The peer answered a status query
    StatusResponse(Message),
}

/// Fan-out of [`BridgeEvent`]s to every current subscriber.
///
/// Each subscriber owns an unbounded queue, so a slow subscriber never
/// loses events. Subscribers that dropped their receiver are pruned on the
/// next emit.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<BridgeEvent>>>>,
}

impl EventBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BridgeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver an event to every subscriber; returns how many received it
    pub fn emit(&self, event: BridgeEvent) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if subscribers.is_empty() {
            trace!("No subscribers for event: {:?}", event);
        }
        subscribers.len()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<BridgeEvent>>> {
        // The list stays consistent even if a holder panicked
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(agent: &str) -> BridgeEvent {
        BridgeEvent::AgentRegistered {
            agent: agent.to_string(),
            capabilities: vec!["ocr".to_string()],
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let delivered = bus.emit(BridgeEvent::ConnectionLost { attempts: 3 });
        assert_eq!(delivered, 2);

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                BridgeEvent::ConnectionLost { attempts } => assert_eq!(attempts, 3),
                other => panic!("Unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(BridgeEvent::ConnectionLost { attempts: 1 }), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let _kept = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx);
        assert_eq!(bus.emit(BridgeEvent::ConnectionLost { attempts: 1 }), 1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_slow_subscriber_keeps_every_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(BridgeEvent::TaskCompleted(TaskCompletion {
            task_id: "t1".to_string(),
            agent: "vision".to_string(),
            duration: Duration::from_millis(5),
            result: Value::Null,
            error: None,
        }));
        for i in 0..4096 {
            bus.emit(registered(&format!("agent-{}", i)));
        }

        match rx.try_recv().unwrap() {
            BridgeEvent::TaskCompleted(done) => assert_eq!(done.task_id, "t1"),
            other => panic!("Unexpected event: {:?}", other),
        }
        let mut rest = 0;
        while rx.try_recv().is_ok() {
            rest += 1;
        }
        assert_eq!(rest, 4096);
    }
}
