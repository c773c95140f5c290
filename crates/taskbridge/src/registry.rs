//! Remote agent registry and capability index

use crate::error::BridgeError;
use crate::stats::blend;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use taskbridge_proto::{AgentRegistration, Payload};
use tracing::debug;

/// How requested capabilities are matched against an agent's set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Agent qualifies with at least one requested capability
    #[default]
    AnyOf,
    /// Agent qualifies only with every requested capability
    AllOf,
}

impl FromStr for MatchPolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" | "any_of" | "anyof" => Ok(Self::AnyOf),
            "all" | "all_of" | "allof" => Ok(Self::AllOf),
            other => Err(BridgeError::Config(format!("unknown match policy: {}", other))),
        }
    }
}

/// Registered agent
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRecord {
    /// Unique agent name
    pub name: String,
    /// Every capability the agent has registered
    pub capabilities: BTreeSet<String>,
    /// Metadata from the latest registration
    pub metadata: Payload,
    /// First registration time
    pub registered_at: DateTime<Utc>,
    /// Last registration or completion
    pub last_seen: DateTime<Utc>,
    /// Tasks this agent has answered
    pub task_count: u64,
    /// Blended average response time
    pub avg_response_time_ms: f64,
    /// Position in registration order, used to break load ties
    pub order: u64,
}

/// Agent records plus a capability → agents index.
///
/// The index only ever holds pairs whose capability is in the named agent's
/// record, and it is emptied together with the records.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentRecord>,
    index: HashMap<String, BTreeSet<String>>,
    next_order: u64,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update an agent; capabilities are merged into any existing set.
    ///
    /// Returns `true` when the agent was not registered before.
    pub fn register(&mut self, registration: AgentRegistration, now: DateTime<Utc>) -> bool {
        let AgentRegistration {
            name,
            capabilities,
            metadata,
        } = registration;

        for capability in &capabilities {
            self.index
                .entry(capability.clone())
                .or_default()
                .insert(name.clone());
        }

        match self.agents.get_mut(&name) {
            Some(record) => {
                record.capabilities.extend(capabilities);
                record.metadata = metadata;
                record.last_seen = now;
                debug!("Updated agent registration: {}", name);
                false
            }
            None => {
                let order = self.next_order;
                self.next_order += 1;
                self.agents.insert(
                    name.clone(),
                    AgentRecord {
                        name,
                        capabilities: capabilities.into_iter().collect(),
                        metadata,
                        registered_at: now,
                        last_seen: now,
                        task_count: 0,
                        avg_response_time_ms: 0.0,
                        order,
                    },
                );
                true
            }
        }
    }

    /// Agents able to serve `required`, in registration order.
    ///
    /// An empty requirement matches nothing.
    pub fn find_capable_agents<S: AsRef<str>>(&self, required: &[S], policy: MatchPolicy) -> Vec<String> {
        let mut candidates: BTreeSet<&str> = BTreeSet::new();
        for capability in required {
            if let Some(names) = self.index.get(capability.as_ref()) {
                candidates.extend(names.iter().map(String::as_str));
            }
        }

        let mut matched: Vec<&AgentRecord> = candidates
            .into_iter()
            .filter_map(|name| self.agents.get(name))
            .filter(|record| match policy {
                MatchPolicy::AnyOf => true,
                MatchPolicy::AllOf => required
                    .iter()
                    .all(|capability| record.capabilities.contains(capability.as_ref())),
            })
            .collect();

        matched.sort_by_key(|record| record.order);
        matched.into_iter().map(|record| record.name.clone()).collect()
    }

    /// Fold a completed task into the agent's stats
    pub fn record_completion(&mut self, name: &str, elapsed_ms: f64, now: DateTime<Utc>) {
        if let Some(record) = self.agents.get_mut(name) {
            record.task_count += 1;
            record.avg_response_time_ms = blend(record.avg_response_time_ms, elapsed_ms);
            record.last_seen = now;
        }
    }

    /// Look up an agent
    pub fn get(&self, name: &str) -> Option<&AgentRecord> {
        self.agents.get(name)
    }

    /// Whether an agent is registered
    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Agents holding a capability
    pub fn agents_with(&self, capability: &str) -> Option<&BTreeSet<String>> {
        self.index.get(capability)
    }

    /// Indexed capability names
    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// All records in registration order
    pub fn agents(&self) -> Vec<&AgentRecord> {
        let mut records: Vec<&AgentRecord> = self.agents.values().collect();
        records.sort_by_key(|record| record.order);
        records
    }

    /// Number of registered agents
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is registered
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Drop every agent and index entry
    pub fn clear(&mut self) {
        self.agents.clear();
        self.index.clear();
    }
}
