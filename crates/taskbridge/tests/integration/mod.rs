//! Shared helpers for bridge integration tests

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use taskbridge::proto::{FrameCodec, Message, MessageType, Payload};
use taskbridge::{BridgeConfig, BridgeEvent, TaskBridge};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// How long a test waits for any single thing to happen
pub const WAIT: Duration = Duration::from_secs(5);

/// A bridge bound to a socket in its own temporary directory
pub struct TestBridge {
    pub bridge: TaskBridge,
    pub socket_path: PathBuf,
    _dir: TempDir,
}

impl TestBridge {
    pub async fn start() -> Result<Self> {
        Self::start_with(|config| config).await
    }

    pub async fn start_with<F>(configure: F) -> Result<Self>
    where
        F: FnOnce(BridgeConfig) -> BridgeConfig,
    {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("bridge.sock");
        let config = configure(BridgeConfig::new(&socket_path));
        let bridge = TaskBridge::new(config);
        bridge.initialize().await?;
        Ok(Self {
            bridge,
            socket_path,
            _dir: dir,
        })
    }

    /// Connect a peer and wait until the bridge has attached it
    pub async fn connect_peer(&self) -> Result<MockPeer> {
        let peer = MockPeer::connect(&self.socket_path).await?;
        self.wait_until_connected(true).await?;
        Ok(peer)
    }

    pub async fn wait_until_connected(&self, connected: bool) -> Result<()> {
        timeout(WAIT, async {
            while self.bridge.is_connected().await != connected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| anyhow!("bridge never reached connected={}", connected))
    }
}

/// A worker-runtime stand-in speaking the wire protocol directly
pub struct MockPeer {
    stream: UnixStream,
    codec: FrameCodec,
}

impl MockPeer {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("connecting to {}", path.display()))?;
        Ok(Self {
            stream,
            codec: FrameCodec::new(),
        })
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        self.codec.write_message(&mut self.stream, message).await?;
        Ok(())
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Encode a message without sending it
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        Ok(self.codec.encode(message)?.to_vec())
    }

    pub async fn recv(&mut self) -> Result<Message> {
        timeout(WAIT, self.codec.read_message(&mut self.stream))
            .await
            .map_err(|_| anyhow!("timed out waiting for a message"))??
            .ok_or_else(|| anyhow!("bridge closed the connection"))
    }

    /// Receive messages until one of `kind` arrives
    pub async fn recv_kind(&mut self, kind: MessageType) -> Result<Message> {
        loop {
            let message = self.recv().await?;
            if message.kind == kind {
                return Ok(message);
            }
        }
    }

    /// Whether the bridge closed this connection
    pub async fn is_closed(&mut self) -> bool {
        matches!(
            timeout(WAIT, self.codec.read_message(&mut self.stream)).await,
            Ok(Ok(None)) | Ok(Err(_))
        )
    }

    pub async fn handshake(&mut self) -> Result<Message> {
        let hello = message(
            MessageType::Handshake,
            json!({"runtime": "test", "version": "1.0", "capabilities": []}),
        );
        self.send(&hello).await?;
        self.recv_kind(MessageType::HandshakeResponse).await
    }

    pub async fn register(&mut self, name: &str, capabilities: &[&str]) -> Result<()> {
        let registration = message(
            MessageType::AgentRegistration,
            json!({"name": name, "capabilities": capabilities}),
        );
        self.send(&registration).await
    }

    pub async fn respond(&mut self, task_id: &str, result: Value) -> Result<()> {
        let response = message(
            MessageType::TaskResponse,
            json!({"task_id": task_id, "result": result}),
        );
        self.send(&response).await
    }

    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Build a message from the peer with a JSON object payload
pub fn message(kind: MessageType, payload: Value) -> Message {
    let payload = match payload {
        Value::Object(map) => map,
        _ => Payload::new(),
    };
    Message::new(kind, "worker", "bridge", payload)
}

/// Wait for the first event matching `predicate`
pub async fn next_event<F>(events: &mut mpsc::UnboundedReceiver<BridgeEvent>, mut predicate: F) -> Result<BridgeEvent>
where
    F: FnMut(&BridgeEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event) => return Ok(event),
                Some(_) => {}
                None => return Err(anyhow!("event bus closed")),
            }
        }
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for an event"))?
}
