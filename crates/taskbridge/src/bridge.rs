//! The task bridge: socket server, connection tasks, and the public API
//!
//! [`TaskBridge`] owns a Unix socket listener and at most one attached peer.
//! Each attached connection gets a reader task that decodes frames and routes
//! them under the state lock, and a writer task that drains the outbound
//! queue. A background ticker sends heartbeats and sweeps expired tasks.

use crate::config::{BridgeConfig, PeerPolicy};
use crate::dispatcher::{Task, TaskAssignment, TaskState};
use crate::error::BridgeError;
use crate::events::{BridgeEvent, EventBus, TaskCompletion};
use crate::liveness::ReconnectOutcome;
use crate::registry::AgentRecord;
use crate::state::{BridgeState, BridgeStatus, PeerLink, ServerState};
use crate::Result;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskbridge_proto::message::to_payload;
use taskbridge_proto::{AgentQuery, FrameCodec, Message, MessageType, QueryKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const READ_BUFFER_SIZE: usize = 8192;
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bridge between the host process and a worker runtime connected over a
/// Unix socket
pub struct TaskBridge {
    config: Arc<BridgeConfig>,
    state: Arc<Mutex<BridgeState>>,
    events: EventBus,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskBridge {
    /// Create a bridge; nothing is bound until [`initialize`](Self::initialize)
    pub fn new(config: BridgeConfig) -> Self {
        let events = EventBus::new();
        let state = BridgeState::new(&config, events.clone());
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
            events,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Bind the socket and start accepting a peer.
    ///
    /// A stale socket file left at the path is removed first. Fails with
    /// [`BridgeError::AlreadyInitialized`] on a second call.
    pub async fn initialize(&self) -> Result<()> {
        self.config.validate()?;

        let mut state = self.state.lock().await;
        if state.server_state != ServerState::Unbound {
            return Err(BridgeError::AlreadyInitialized);
        }

        let listener = bind_listener(&self.config.socket_path)?;
        state.server_state = ServerState::Listening;
        drop(state);

        info!("Task bridge listening on {}", self.config.socket_path.display());

        let accept = tokio::spawn(accept_loop(
            listener,
            self.config.clone(),
            self.state.clone(),
        ));
        let ticker = tokio::spawn(liveness_loop(self.config.clone(), self.state.clone()));
        self.background.lock().await.extend([accept, ticker]);
        Ok(())
    }

    /// Subscribe to bridge events.
    ///
    /// Every event emitted while the receiver is alive is queued for it;
    /// dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Dispatch a task to the least-loaded agent offering `required`.
    ///
    /// Returns as soon as the request is queued; the outcome arrives later
    /// as a [`BridgeEvent::TaskCompleted`] or [`BridgeEvent::TaskExpired`].
    pub async fn route_task<S: AsRef<str>>(&self, task: Task, required: &[S]) -> Result<TaskAssignment> {
        self.state.lock().await.route_task(task, required)
    }

    /// Dispatch a task and wait for its response.
    ///
    /// Giving up after `wait` does not cancel the task; it stays in flight
    /// until answered or swept.
    pub async fn route_task_and_wait<S: AsRef<str>>(
        &self,
        task: Task,
        required: &[S],
        wait: Duration,
    ) -> Result<TaskCompletion> {
        // Subscribe first so a fast response can't slip past; the
        // subscription is dropped on every return path
        let mut events = self.subscribe();
        let assignment = self.route_task(task, required).await?;
        let task_id = assignment.task_id;

        let outcome = async {
            loop {
                match events.recv().await {
                    Some(BridgeEvent::TaskCompleted(done)) if done.task_id == task_id => return Ok(done),
                    Some(BridgeEvent::TaskExpired { task_id: expired, .. }) if expired == task_id => {
                        return Err(BridgeError::TaskExpired(expired));
                    }
                    Some(_) => {}
                    None => return Err(BridgeError::Disconnected),
                }
            }
        };

        timeout(wait, outcome)
            .await
            .map_err(|_| BridgeError::Timeout { duration: wait })?
    }

    /// Send an arbitrary message to the peer
    pub async fn send(&self, message: Message) -> Result<()> {
        self.state.lock().await.send(&message)
    }

    /// Ask the peer for its agent list, using the configured message timeout
    pub async fn query_agents(&self) -> Result<Message> {
        self.query_with_timeout(QueryKind::Agents, self.config.message_timeout)
            .await
    }

    /// Ask the peer for its status, using the configured message timeout
    pub async fn query_status(&self) -> Result<Message> {
        self.query_with_timeout(QueryKind::Status, self.config.message_timeout)
            .await
    }

    /// Send an `agent_query` and wait for the correlated response
    pub async fn query_with_timeout(&self, kind: QueryKind, wait: Duration) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        let query_id = {
            let mut state = self.state.lock().await;
            let payload = to_payload(&AgentQuery { query: kind })?;
            let query = Message::new(
                MessageType::AgentQuery,
                state.name.clone(),
                state.peer_name(),
                payload,
            );
            state.send(&query)?;
            state.pending_queries.insert(query.id.clone(), tx);
            query.id
        };

        match timeout(wait, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BridgeError::Disconnected),
            Err(_) => {
                self.state.lock().await.pending_queries.remove(&query_id);
                debug!("Query {} timed out after {:?}", query_id, wait);
                Err(BridgeError::Timeout { duration: wait })
            }
        }
    }

    /// Whether a peer is attached
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.is_connected()
    }

    /// Snapshot of the bridge's state
    pub async fn status(&self) -> BridgeStatus {
        self.state.lock().await.status()
    }

    /// Registered agents in registration order
    pub async fn agents(&self) -> Vec<AgentRecord> {
        self.state
            .lock()
            .await
            .registry
            .agents()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Tasks currently in flight on `agent`
    pub async fn agent_load(&self, agent: &str) -> usize {
        self.state.lock().await.dispatcher.load(agent)
    }

    /// Lifecycle state of a task
    pub async fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.state.lock().await.task_state(task_id)
    }

    /// Expire overdue in-flight tasks now rather than at the next tick
    pub async fn sweep_expired(&self) -> usize {
        self.state.lock().await.sweep_expired(Instant::now())
    }

    /// Stop the bridge.
    ///
    /// Tells the peer, stops every background task, and removes the socket
    /// file. Failures along the way are logged, never returned.
    pub async fn shutdown(&self) {
        let (writer, was_bound) = {
            let mut state = self.state.lock().await;
            if state.server_state == ServerState::Stopped {
                return;
            }
            let was_bound = state.server_state != ServerState::Unbound;
            if state.is_connected() {
                let notice = state.shutdown_message("bridge shutting down");
                if let Err(e) = state.send(&notice) {
                    warn!("Failed to notify peer of shutdown: {}", e);
                }
            }
            (state.close_for_shutdown(), was_bound)
        };

        for handle in self.background.lock().await.drain(..) {
            handle.abort();
        }

        if let Some(writer) = writer {
            if timeout(SHUTDOWN_FLUSH_TIMEOUT, writer).await.is_err() {
                warn!("Timed out flushing outbound messages");
            }
        }

        if was_bound {
            match std::fs::remove_file(&self.config.socket_path) {
                Ok(()) => debug!("Removed socket {}", self.config.socket_path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove socket {}: {}", self.config.socket_path.display(), e),
            }
        }

        info!("Task bridge stopped");
    }
}

fn bind_listener(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            BridgeError::Transport(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }

    match std::fs::remove_file(path) {
        Ok(()) => info!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(BridgeError::Transport(format!(
                "failed to remove stale socket {}: {}",
                path.display(),
                e
            )))
        }
    }

    UnixListener::bind(path)
        .map_err(|e| BridgeError::Transport(format!("failed to bind {}: {}", path.display(), e)))
}

async fn accept_loop(listener: UnixListener, config: Arc<BridgeConfig>, shared: Arc<Mutex<BridgeState>>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => admit(stream, &config, &shared).await,
            Err(e) => {
                error!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Attach a newly accepted connection, applying the second-peer policy
async fn admit(stream: UnixStream, config: &Arc<BridgeConfig>, shared: &Arc<Mutex<BridgeState>>) {
    let mut state = shared.lock().await;
    if state.server_state == ServerState::Stopped {
        return;
    }

    if state.is_connected() {
        match config.peer_policy {
            PeerPolicy::Reject => {
                warn!("Rejecting connection: a peer is already attached");
                return;
            }
            PeerPolicy::Replace => {
                let current = state.generation();
                state.detach(current, "replaced by a new connection");
            }
        }
    }

    let generation = state.next_generation();
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    // The reader can't detach before attach below; it needs this lock
    let writer = tokio::spawn(write_loop(write_half, outbound_rx));
    let reader = tokio::spawn(read_loop(read_half, generation, shared.clone(), config.clone()));
    state.attach(PeerLink::new(generation, outbound_tx).with_tasks(reader, writer));
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            warn!("Write to peer failed: {}", e);
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Closing write half failed: {}", e);
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    generation: u64,
    shared: Arc<Mutex<BridgeState>>,
    config: Arc<BridgeConfig>,
) {
    let mut codec = FrameCodec::with_max_frame_size(config.max_frame_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "peer closed connection".to_string(),
            Ok(n) => {
                let decoded = codec.decode(&buf[..n]);
                for e in &decoded.errors {
                    warn!("Dropping undecodable frame: {}", e);
                }
                if !decoded.messages.is_empty() {
                    let mut state = shared.lock().await;
                    for message in decoded.messages {
                        state.route_message(message);
                    }
                }
            }
            Err(e) => break format!("read error: {}", e),
        }
    };

    if codec.buffer_size() > 0 {
        debug!("Discarding {} bytes of a partial frame", codec.buffer_size());
    }

    let detached = shared.lock().await.detach(generation, &reason);
    if detached {
        tokio::spawn(reconnect_watchdog(generation, shared, config));
    }
}

/// Count reconnect windows until a new peer attaches or the budget runs out
async fn reconnect_watchdog(generation: u64, shared: Arc<Mutex<BridgeState>>, config: Arc<BridgeConfig>) {
    let mut ticker = interval(config.reconnect_delay);
    loop {
        ticker.tick().await;

        let mut state = shared.lock().await;
        if state.generation() != generation
            || state.is_connected()
            || state.server_state == ServerState::Stopped
        {
            return;
        }

        match state.liveness.record_reconnect_attempt() {
            ReconnectOutcome::Waiting { attempt, max } => {
                info!("Waiting for peer to reconnect (attempt {}/{})", attempt, max);
            }
            ReconnectOutcome::Exhausted { attempts } => {
                error!("Peer did not reconnect after {} attempts", attempts);
                state.events.emit(BridgeEvent::ConnectionLost { attempts });
                return;
            }
            ReconnectOutcome::AlreadyLost => return,
        }
    }
}

/// Send heartbeats and sweep expired tasks every heartbeat interval
async fn liveness_loop(config: Arc<BridgeConfig>, shared: Arc<Mutex<BridgeState>>) {
    let mut ticker = interval(config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let mut state = shared.lock().await;
        let expired = state.sweep_expired(Instant::now());
        if expired > 0 {
            debug!("Swept {} expired tasks", expired);
        }

        if !state.is_connected() {
            continue;
        }
        let sent = state.heartbeat_message().and_then(|heartbeat| state.send(&heartbeat));
        if let Err(e) = sent {
            warn!("Failed to send heartbeat: {}", e);
        }
    }
}
