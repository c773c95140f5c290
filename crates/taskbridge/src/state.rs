//! Shared bridge state
//!
//! Everything the bridge knows lives in one [`BridgeState`] behind a single
//! async mutex. Inbound messages are routed while that lock is held, so the
//! registry, load counters and in-flight table change one message at a time.

use crate::config::BridgeConfig;
use crate::dispatcher::{Task, TaskAssignment, TaskDispatcher, TaskState};
use crate::error::BridgeError;
use crate::events::{BridgeEvent, EventBus};
use crate::liveness::LivenessMonitor;
use crate::registry::{AgentRegistry, MatchPolicy};
use crate::stats::TaskStats;
use crate::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Instant;
use taskbridge_proto::message::to_payload;
use taskbridge_proto::{FrameCodec, Message, MessageType, Payload, StatusSnapshot, TaskRequest};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Target used before the peer has introduced itself
pub(crate) const DEFAULT_PEER_NAME: &str = "peer";

/// Socket server lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not yet initialized
    Unbound,
    /// Listening, no peer yet
    Listening,
    /// A peer is attached
    Connected,
    /// Listening again after losing a peer
    Disconnected,
    /// Shut down
    Stopped,
}

/// Identity the peer advertised in its handshake
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    /// Peer name, taken from the handshake's `source`
    pub name: String,
    /// Runtime identifier
    pub runtime: Option<String>,
    /// Peer software version
    pub version: Option<String>,
    /// Capabilities advertised for the peer as a whole
    pub capabilities: Vec<String>,
    /// Handshake time
    pub connected_at: DateTime<Utc>,
}

/// Summary returned by [`TaskBridge::status`](crate::TaskBridge::status)
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeStatus {
    /// Server lifecycle state
    pub state: ServerState,
    /// Current peer, once it has sent a handshake
    pub peer: Option<PeerInfo>,
    /// Registered agents
    pub registered_agents: usize,
    /// Tasks in flight
    pub active_tasks: usize,
    /// Reconnect windows counted in the current outage
    pub reconnect_attempts: u32,
    /// Last heartbeat received from the peer
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Dispatch counters
    pub stats: TaskStats,
}

/// Handle to the attached connection's writer and reader tasks
#[derive(Debug)]
pub(crate) struct PeerLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<Bytes>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl PeerLink {
    pub(crate) fn new(generation: u64, outbound: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            generation,
            outbound,
            reader: None,
            writer: None,
        }
    }

    pub(crate) fn with_tasks(mut self, reader: JoinHandle<()>, writer: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self.writer = Some(writer);
        self
    }

    /// Stop reading and close the outbound queue. The writer flushes what is
    /// already queued and exits; its handle is returned for callers that
    /// want to wait for that.
    fn close(mut self) -> Option<JoinHandle<()>> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer.take()
    }
}

/// State shared by the router, dispatcher, liveness loop and socket server
pub(crate) struct BridgeState {
    pub(crate) name: String,
    pub(crate) match_policy: MatchPolicy,
    pub(crate) registry: AgentRegistry,
    pub(crate) dispatcher: TaskDispatcher,
    pub(crate) liveness: LivenessMonitor,
    pub(crate) events: EventBus,
    pub(crate) peer: Option<PeerInfo>,
    pub(crate) pending_queries: HashMap<String, oneshot::Sender<Message>>,
    pub(crate) server_state: ServerState,
    encoder: FrameCodec,
    link: Option<PeerLink>,
    generation: u64,
}

impl BridgeState {
    pub(crate) fn new(config: &BridgeConfig, events: EventBus) -> Self {
        Self {
            name: config.name.clone(),
            match_policy: config.match_policy,
            registry: AgentRegistry::new(),
            dispatcher: TaskDispatcher::new(config.task_timeout),
            liveness: LivenessMonitor::new(config.heartbeat_interval, config.max_reconnect_attempts),
            events,
            peer: None,
            pending_queries: HashMap::new(),
            server_state: ServerState::Unbound,
            encoder: FrameCodec::with_max_frame_size(config.max_frame_size),
            link: None,
            generation: 0,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub(crate) fn peer_name(&self) -> String {
        self.peer
            .as_ref()
            .map(|peer| peer.name.clone())
            .unwrap_or_else(|| DEFAULT_PEER_NAME.to_string())
    }

    /// Encode and queue a message for the peer; fails immediately when no
    /// peer is attached
    pub(crate) fn send(&self, message: &Message) -> Result<()> {
        let link = self.link.as_ref().ok_or(BridgeError::NotConnected)?;
        let frame = self.encoder.encode(message)?;
        link.outbound
            .send(frame)
            .map_err(|_| BridgeError::NotConnected)?;
        debug!("Queued {} message {} for {}", message.kind, message.id, message.target);
        Ok(())
    }

    pub(crate) fn attach(&mut self, link: PeerLink) {
        info!("Peer connection attached (generation {})", link.generation);
        self.link = Some(link);
        self.server_state = ServerState::Connected;
        self.liveness.on_connected(Utc::now());
    }

    /// Detach the connection of `generation` and clear everything tied to it.
    ///
    /// Returns `false` when that connection is no longer the attached one.
    pub(crate) fn detach(&mut self, generation: u64, reason: &str) -> bool {
        match &self.link {
            Some(link) if link.generation == generation => {}
            _ => return false,
        }

        warn!("Peer disconnected: {}", reason);
        if let Some(link) = self.link.take() {
            // Dropping the writer handle detaches it; it exits once the queue closes
            drop(link.close());
        }
        self.server_state = ServerState::Disconnected;
        self.liveness.on_disconnected();
        self.clear_peer_state();
        true
    }

    /// Detach whatever is attached as part of shutdown
    pub(crate) fn close_for_shutdown(&mut self) -> Option<JoinHandle<()>> {
        let writer = self.link.take().and_then(PeerLink::close);
        self.server_state = ServerState::Stopped;
        self.liveness.on_disconnected();
        self.clear_peer_state();
        writer
    }

    fn clear_peer_state(&mut self) {
        self.peer = None;
        self.registry.clear();
        for task in self.dispatcher.drain() {
            self.events.emit(BridgeEvent::TaskExpired {
                task_id: task.task_id,
                agent: task.assigned_agent,
            });
        }
        // Dropping the senders wakes every waiting query with an error
        self.pending_queries.clear();
    }

    /// Pick an agent for `task` and send it a `task_request`
    pub(crate) fn route_task<S: AsRef<str>>(&mut self, task: Task, required: &[S]) -> Result<TaskAssignment> {
        if self.dispatcher.is_in_flight(&task.task_id) {
            return Err(BridgeError::DuplicateTask(task.task_id));
        }

        let capabilities: Vec<String> = required.iter().map(|c| c.as_ref().to_string()).collect();
        let candidates = self.registry.find_capable_agents(&capabilities, self.match_policy);
        let agent = match self.dispatcher.select_agent(&candidates) {
            Some(agent) => agent.clone(),
            None => return Err(BridgeError::NoCapableAgent { capabilities }),
        };

        let payload = to_payload(&TaskRequest {
            task_id: task.task_id.clone(),
            capabilities,
            task: task.payload,
        })?;
        let request = Message::new(MessageType::TaskRequest, self.name.clone(), agent.clone(), payload);
        self.send(&request)?;

        self.dispatcher
            .begin(task.task_id.clone(), agent.clone(), request.id, Instant::now());
        info!(
            "Routed task {} to agent {} (load {})",
            task.task_id,
            agent,
            self.dispatcher.load(&agent)
        );

        Ok(TaskAssignment {
            assigned_agent: agent,
            task_id: task.task_id,
        })
    }

    /// Expire stale in-flight tasks; returns how many were expired
    pub(crate) fn sweep_expired(&mut self, now: Instant) -> usize {
        let expired = self.dispatcher.sweep_expired(now);
        let count = expired.len();
        for task in expired {
            warn!(
                "Task {} on agent {} expired without a response",
                task.task_id, task.assigned_agent
            );
            self.events.emit(BridgeEvent::TaskExpired {
                task_id: task.task_id,
                agent: task.assigned_agent,
            });
        }
        count
    }

    pub(crate) fn snapshot(&self) -> StatusSnapshot {
        let stats = self.dispatcher.stats();
        StatusSnapshot {
            active_tasks: self.dispatcher.active_count(),
            registered_agents: self.registry.len(),
            tasks_completed: stats.tasks_completed,
            avg_response_time_ms: stats.avg_response_time_ms,
        }
    }

    pub(crate) fn heartbeat_message(&self) -> Result<Message> {
        let payload = to_payload(&self.snapshot())?;
        Ok(Message::new(MessageType::Heartbeat, self.name.clone(), self.peer_name(), payload))
    }

    pub(crate) fn shutdown_message(&self, reason: &str) -> Message {
        let mut payload = Payload::new();
        payload.insert("reason".to_string(), reason.into());
        Message::new(MessageType::Shutdown, self.name.clone(), self.peer_name(), payload)
    }

    pub(crate) fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.dispatcher.task_state(task_id)
    }

    pub(crate) fn status(&self) -> BridgeStatus {
        BridgeStatus {
            state: self.server_state,
            peer: self.peer.clone(),
            registered_agents: self.registry.len(),
            active_tasks: self.dispatcher.active_count(),
            reconnect_attempts: self.liveness.reconnect_attempts(),
            last_heartbeat: self.liveness.last_heartbeat(),
            stats: self.dispatcher.stats(),
        }
    }
}
