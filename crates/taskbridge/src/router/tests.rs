//! Unit tests for message routing

use super::*;
use crate::config::BridgeConfig;
use crate::dispatcher::Task;
use crate::error::BridgeError;
use crate::events::EventBus;
use crate::state::{PeerLink, ServerState};
use bytes::Bytes;
use serde_json::{json, Value};
use taskbridge_proto::{FrameCodec, Payload, StatusSnapshot, TaskRequest};
use tokio::sync::{mpsc, oneshot};

struct Harness {
    state: BridgeState,
    wire: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedReceiver<BridgeEvent>,
    codec: FrameCodec,
}

impl Harness {
    fn connected() -> Self {
        let mut harness = Self::detached();
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = harness.state.next_generation();
        harness.state.attach(PeerLink::new(generation, tx));
        harness.wire = rx;
        harness
    }

    fn detached() -> Self {
        let bus = EventBus::new();
        let events = bus.subscribe();
        let (_, wire) = mpsc::unbounded_channel();
        Self {
            state: BridgeState::new(&BridgeConfig::default(), bus),
            wire,
            events,
            codec: FrameCodec::new(),
        }
    }

    fn deliver(&mut self, kind: MessageType, payload: Value) -> Message {
        let message = peer_message(kind, payload);
        self.state.route_message(message.clone());
        message
    }

    fn register(&mut self, name: &str, capabilities: &[&str]) {
        self.deliver(
            MessageType::AgentRegistration,
            json!({"name": name, "capabilities": capabilities}),
        );
    }

    fn sent(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = self.wire.try_recv() {
            let decoded = self.codec.decode(&frame);
            assert!(decoded.errors.is_empty());
            out.extend(decoded.messages);
        }
        out
    }

    fn drain_events(&mut self) -> Vec<BridgeEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

fn peer_message(kind: MessageType, payload: Value) -> Message {
    let payload = match payload {
        Value::Object(map) => map,
        _ => Payload::new(),
    };
    Message::new(kind, "worker", "bridge", payload)
}

#[test]
fn test_handshake_reply_correlates() {
    let mut h = Harness::connected();
    let handshake = h.deliver(
        MessageType::Handshake,
        json!({"runtime": "python", "version": "3.12", "capabilities": ["nlp"]}),
    );

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MessageType::HandshakeResponse);
    assert_eq!(sent[0].correlation_id.as_deref(), Some(handshake.id.as_str()));
    assert_eq!(sent[0].target, "worker");

    let peer = h.state.peer.as_ref().unwrap();
    assert_eq!(peer.name, "worker");
    assert_eq!(peer.runtime.as_deref(), Some("python"));
    assert_eq!(peer.capabilities, vec!["nlp"]);
}

#[test]
fn test_vision_round_trip() {
    let mut h = Harness::connected();
    h.register("vision", &["ocr", "classify"]);

    match h.drain_events().as_slice() {
        [BridgeEvent::AgentRegistered { agent, capabilities }] => {
            assert_eq!(agent, "vision");
            assert_eq!(capabilities, &vec!["classify".to_string(), "ocr".to_string()]);
        }
        other => panic!("Unexpected events: {:?}", other),
    }

    let assignment = h.state.route_task(Task::new("t1"), &["ocr"]).unwrap();
    assert_eq!(assignment.assigned_agent, "vision");
    assert_eq!(assignment.task_id, "t1");
    assert_eq!(h.state.dispatcher.load("vision"), 1);

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MessageType::TaskRequest);
    assert_eq!(sent[0].target, "vision");
    assert!(sent[0].correlation_id.is_none());
    let request: TaskRequest = sent[0].payload_as().unwrap();
    assert_eq!(request.task_id, "t1");
    assert_eq!(request.capabilities, vec!["ocr"]);

    h.deliver(MessageType::TaskResponse, json!({"task_id": "t1", "result": {"text": "hello"}}));
    assert_eq!(h.state.dispatcher.load("vision"), 0);
    assert_eq!(h.state.registry.get("vision").unwrap().task_count, 1);

    match h.drain_events().as_slice() {
        [BridgeEvent::TaskCompleted(done)] => {
            assert_eq!(done.agent, "vision");
            assert_eq!(done.task_id, "t1");
            assert_eq!(done.result, json!({"text": "hello"}));
            assert!(done.is_success());
        }
        other => panic!("Unexpected events: {:?}", other),
    }
}

#[test]
fn test_no_capable_agent() {
    let mut h = Harness::connected();
    h.register("vision", &["ocr"]);

    let result = h.state.route_task(Task::new("t1"), &["unregistered-capability"]);
    match result {
        Err(BridgeError::NoCapableAgent { capabilities }) => {
            assert_eq!(capabilities, vec!["unregistered-capability"]);
        }
        other => panic!("Expected NoCapableAgent, got {:?}", other),
    }
    assert!(h.sent().is_empty());
}

#[test]
fn test_least_loaded_agent_selected() {
    let mut h = Harness::connected();
    h.register("a", &["nlp", "summarize"]);
    h.register("b", &["nlp"]);

    // Ties go to the earlier registration
    assert_eq!(h.state.route_task(Task::new("t1"), &["nlp"]).unwrap().assigned_agent, "a");
    assert_eq!(
        h.state.route_task(Task::new("t2"), &["summarize"]).unwrap().assigned_agent,
        "a"
    );

    assert_eq!(h.state.dispatcher.load("a"), 2);
    assert_eq!(h.state.dispatcher.load("b"), 0);
    assert_eq!(h.state.route_task(Task::new("t3"), &["nlp"]).unwrap().assigned_agent, "b");
    assert_eq!(h.state.dispatcher.load("b"), 1);
}

#[test]
fn test_duplicate_and_late_responses_are_noops() {
    let mut h = Harness::connected();
    h.register("vision", &["ocr"]);
    h.state.route_task(Task::new("t1"), &["ocr"]).unwrap();

    h.deliver(MessageType::TaskResponse, json!({"task_id": "t1"}));
    h.deliver(MessageType::TaskResponse, json!({"task_id": "t1"}));
    h.deliver(MessageType::TaskResponse, json!({"task_id": "never-sent"}));

    assert_eq!(h.state.dispatcher.load("vision"), 0);
    assert_eq!(h.state.dispatcher.stats().tasks_completed, 1);
    let completions = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, BridgeEvent::TaskCompleted(_)))
        .count();
    assert_eq!(completions, 1);
}

#[test]
fn test_failed_task_response() {
    let mut h = Harness::connected();
    h.register("vision", &["ocr"]);
    h.state.route_task(Task::new("t1"), &["ocr"]).unwrap();
    h.drain_events();

    h.deliver(MessageType::TaskResponse, json!({"task_id": "t1", "error": "model crashed"}));

    assert_eq!(h.state.dispatcher.stats().tasks_failed, 1);
    match h.drain_events().as_slice() {
        [BridgeEvent::TaskCompleted(done)] => {
            assert!(!done.is_success());
            assert_eq!(done.error.as_deref(), Some("model crashed"));
        }
        other => panic!("Unexpected events: {:?}", other),
    }
}

#[test]
fn test_duplicate_task_id_rejected() {
    let mut h = Harness::connected();
    h.register("vision", &["ocr"]);
    h.state.route_task(Task::new("t1"), &["ocr"]).unwrap();

    let result = h.state.route_task(Task::new("t1"), &["ocr"]);
    assert!(matches!(result, Err(BridgeError::DuplicateTask(id)) if id == "t1"));
    assert_eq!(h.state.dispatcher.load("vision"), 1);
}

#[test]
fn test_route_without_peer_fails_fast() {
    let mut h = Harness::detached();
    h.state
        .registry
        .register(
            taskbridge_proto::AgentRegistration {
                name: "vision".to_string(),
                capabilities: vec!["ocr".to_string()],
                metadata: Payload::new(),
            },
            Utc::now(),
        );

    let result = h.state.route_task(Task::new("t1"), &["ocr"]);
    assert!(matches!(result, Err(BridgeError::NotConnected)));
    assert_eq!(h.state.dispatcher.load("vision"), 0);
    assert!(!h.state.dispatcher.is_in_flight("t1"));
}

#[test]
fn test_heartbeat_gets_snapshot_reply() {
    let mut h = Harness::connected();
    h.register("vision", &["ocr"]);
    h.state.route_task(Task::new("t1"), &["ocr"]).unwrap();
    h.sent();

    let heartbeat = h.deliver(MessageType::Heartbeat, json!({}));
    assert!(h.state.liveness.last_heartbeat().is_some());

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, MessageType::HeartbeatResponse);
    assert!(sent[0].is_reply_to(&heartbeat));
    let snapshot: StatusSnapshot = sent[0].payload_as().unwrap();
    assert_eq!(snapshot.active_tasks, 1);
    assert_eq!(snapshot.registered_agents, 1);
}

#[test]
fn test_heartbeat_response_updates_ack() {
    let mut h = Harness::connected();
    h.deliver(MessageType::HeartbeatResponse, json!({"active_tasks": 0, "registered_agents": 0}));
    assert!(h.state.liveness.last_heartbeat_ack().is_some());
    assert!(h.sent().is_empty());
}

#[test]
fn test_query_response_resolves_waiter() {
    let mut h = Harness::connected();
    let (tx, mut rx) = oneshot::channel();
    h.state.pending_queries.insert("q1".to_string(), tx);

    let response = peer_message(MessageType::StatusResponse, json!({"healthy": true})).with_correlation("q1");
    h.state.route_message(response.clone());

    assert_eq!(rx.try_recv().unwrap(), response);
    assert!(h.state.pending_queries.is_empty());
    match h.drain_events().as_slice() {
        [BridgeEvent::StatusResponse(message)] => assert_eq!(message.id, response.id),
        other => panic!("Unexpected events: {:?}", other),
    }
}

#[test]
fn test_uncorrelated_agent_query_response_still_emitted() {
    let mut h = Harness::connected();
    h.deliver(MessageType::AgentQueryResponse, json!({"agents": []}));

    assert!(matches!(
        h.drain_events().as_slice(),
        [BridgeEvent::AgentQueryResponse(_)]
    ));
}

#[test]
fn test_unknown_and_unexpected_types_ignored() {
    let mut h = Harness::connected();
    h.deliver(MessageType::Unknown("telemetry".to_string()), json!({"x": 1}));
    h.deliver(MessageType::TaskRequest, json!({"task_id": "t1", "capabilities": []}));
    h.deliver(MessageType::Shutdown, json!({}));

    assert!(h.sent().is_empty());
    assert!(h.drain_events().is_empty());
    assert!(h.state.is_connected());
}

#[test]
fn test_malformed_payloads_do_not_corrupt_state() {
    let mut h = Harness::connected();
    h.register("vision", &["ocr"]);
    h.state.route_task(Task::new("t1"), &["ocr"]).unwrap();
    h.drain_events();

    h.deliver(MessageType::AgentRegistration, json!({"capabilities": ["x"]}));
    h.deliver(MessageType::AgentRegistration, json!({"name": "", "capabilities": ["x"]}));
    h.deliver(MessageType::TaskResponse, json!({"result": 1}));

    assert_eq!(h.state.registry.len(), 1);
    assert_eq!(h.state.dispatcher.load("vision"), 1);
    assert!(h.drain_events().is_empty());
}

#[test]
fn test_detach_clears_peer_state() {
    let mut h = Harness::connected();
    h.deliver(MessageType::Handshake, json!({}));
    h.register("vision", &["ocr"]);
    h.state.route_task(Task::new("t1"), &["ocr"]).unwrap();
    let (tx, mut rx) = oneshot::channel();
    h.state.pending_queries.insert("q1".to_string(), tx);
    h.drain_events();

    // A stale generation is ignored
    assert!(!h.state.detach(h.state.generation() + 1, "stale"));
    assert!(h.state.is_connected());

    assert!(h.state.detach(h.state.generation(), "peer closed connection"));
    assert!(!h.state.is_connected());
    assert_eq!(h.state.server_state, ServerState::Disconnected);
    assert!(h.state.registry.is_empty());
    assert!(h.state.peer.is_none());
    assert_eq!(h.state.dispatcher.active_count(), 0);
    assert_eq!(h.state.task_state("t1"), Some(TaskState::Expired));
    assert!(rx.try_recv().is_err());

    match h.drain_events().as_slice() {
        [BridgeEvent::TaskExpired { task_id, agent }] => {
            assert_eq!(task_id, "t1");
            assert_eq!(agent, "vision");
        }
        other => panic!("Unexpected events: {:?}", other),
    }
}
