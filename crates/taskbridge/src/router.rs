//! Inbound message routing by message type

use crate::events::{BridgeEvent, TaskCompletion};
use crate::dispatcher::TaskState;
use crate::state::{BridgeState, PeerInfo};
use crate::Result;
use chrono::Utc;
use std::time::Instant;
use taskbridge_proto::message::to_payload;
use taskbridge_proto::{
    AgentRegistration, Handshake, HandshakeAck, Message, MessageType, ProtocolError, TaskResponse,
};
use tracing::{debug, error, info, warn};

impl BridgeState {
    /// Handle one decoded message from the peer.
    ///
    /// Handler failures are logged and swallowed so one bad message never
    /// takes down the connection.
    pub(crate) fn route_message(&mut self, message: Message) {
        let kind = message.kind.clone();
        debug!("Routing {} message {} from {}", kind, message.id, message.source);

        let result = match kind {
            MessageType::Handshake => self.handle_handshake(message),
            MessageType::AgentRegistration => self.handle_registration(message),
            MessageType::TaskResponse => self.handle_task_response(message),
            MessageType::Heartbeat => self.handle_heartbeat(message),
            MessageType::HeartbeatResponse => {
                self.handle_heartbeat_response(message);
                Ok(())
            }
            MessageType::AgentQueryResponse | MessageType::StatusResponse => {
                self.handle_query_response(message);
                Ok(())
            }
            MessageType::Shutdown => {
                info!("Peer {} announced shutdown", message.source);
                Ok(())
            }
            MessageType::HandshakeResponse | MessageType::TaskRequest | MessageType::AgentQuery => {
                warn!("Ignoring unexpected {} message from peer", kind);
                Ok(())
            }
            MessageType::Unknown(ref name) => {
                warn!("Ignoring message with unknown type: {}", name);
                Ok(())
            }
        };

        if let Err(e) = result {
            error!("Failed to handle {} message: {}", kind, e);
        }
    }

    fn handle_handshake(&mut self, message: Message) -> Result<()> {
        let handshake = message.payload_as::<Handshake>().unwrap_or_else(|e| {
            warn!("Handshake payload not understood, using defaults: {}", e);
            Handshake::default()
        });

        info!(
            "Handshake from {} (runtime: {}, version: {})",
            message.source,
            handshake.runtime.as_deref().unwrap_or("unknown"),
            handshake.version.as_deref().unwrap_or("unknown"),
        );

        self.peer = Some(PeerInfo {
            name: message.source.clone(),
            runtime: handshake.runtime,
            version: handshake.version,
            capabilities: handshake.capabilities,
            connected_at: Utc::now(),
        });

        let payload = to_payload(&HandshakeAck {
            bridge: self.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            accepted: true,
        })?;
        let reply = message.reply(MessageType::HandshakeResponse, self.name.clone(), payload);
        self.send(&reply)
    }

    fn handle_registration(&mut self, message: Message) -> Result<()> {
        let registration = message.payload_as::<AgentRegistration>()?;
        if registration.name.is_empty() {
            return Err(ProtocolError::InvalidPayload {
                kind: message.kind.to_string(),
                reason: "agent name is empty".to_string(),
            }
            .into());
        }

        let name = registration.name.clone();
        let created = self.registry.register(registration, Utc::now());
        let capabilities: Vec<String> = self
            .registry
            .get(&name)
            .map(|record| record.capabilities.iter().cloned().collect())
            .unwrap_or_default();

        if created {
            info!("Registered agent {} with capabilities {:?}", name, capabilities);
        } else {
            info!("Agent {} re-registered, capabilities now {:?}", name, capabilities);
        }

        self.events.emit(BridgeEvent::AgentRegistered {
            agent: name,
            capabilities,
        });
        Ok(())
    }

    fn handle_task_response(&mut self, message: Message) -> Result<()> {
        let response = message.payload_as::<TaskResponse>()?;
        let failed = response.error.is_some();

        let Some(done) = self
            .dispatcher
            .complete(&response.task_id, Instant::now(), failed)
        else {
            match self.dispatcher.task_state(&response.task_id) {
                Some(TaskState::Expired) => {
                    info!("Dropping late response for expired task {}", response.task_id)
                }
                Some(TaskState::Completed) => {
                    debug!("Dropping duplicate response for task {}", response.task_id)
                }
                _ => warn!("Dropping response for unknown task {}", response.task_id),
            }
            return Ok(());
        };

        let agent = done.task.assigned_agent;
        let elapsed_ms = done.elapsed.as_secs_f64() * 1000.0;
        self.registry.record_completion(&agent, elapsed_ms, Utc::now());

        if let Some(error) = &response.error {
            warn!("Task {} failed on agent {}: {}", response.task_id, agent, error);
        } else {
            info!("Task {} completed by agent {} in {:.1}ms", response.task_id, agent, elapsed_ms);
        }

        self.events.emit(BridgeEvent::TaskCompleted(TaskCompletion {
            task_id: response.task_id,
            agent,
            duration: done.elapsed,
            result: response.result,
            error: response.error,
        }));
        Ok(())
    }

    fn handle_heartbeat(&mut self, message: Message) -> Result<()> {
        self.liveness.record_heartbeat(Utc::now());
        let payload = to_payload(&self.snapshot())?;
        let reply = message.reply(MessageType::HeartbeatResponse, self.name.clone(), payload);
        self.send(&reply)
    }

    fn handle_heartbeat_response(&mut self, message: Message) {
        self.liveness.record_heartbeat_ack(Utc::now());
        self.resolve_waiter(&message);
    }

    fn handle_query_response(&mut self, message: Message) {
        self.resolve_waiter(&message);
        let event = match message.kind {
            MessageType::StatusResponse => BridgeEvent::StatusResponse(message),
            _ => BridgeEvent::AgentQueryResponse(message),
        };
        self.events.emit(event);
    }

    fn resolve_waiter(&mut self, message: &Message) {
        let Some(correlation_id) = message.correlation_id.as_deref() else {
            return;
        };
        if let Some(waiter) = self.pending_queries.remove(correlation_id) {
            if waiter.send(message.clone()).is_err() {
                debug!("Query waiter for {} already gone", correlation_id);
            }
        }
    }
}

#[cfg(test)]
mod tests;
