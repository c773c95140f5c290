//! Least-load task dispatch and in-flight tracking

use crate::stats::{StatsCollector, TaskStats};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use taskbridge_proto::Payload;
use tracing::debug;

/// Finished task states remembered for late-response diagnostics
const FINISHED_HISTORY: usize = 1024;

/// Unit of work handed to [`TaskBridge::route_task`](crate::TaskBridge::route_task)
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Caller-assigned identifier, echoed back in the task response
    pub task_id: String,
    /// Task body forwarded to the agent
    pub payload: Payload,
}

impl Task {
    /// Create a task with an empty body
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            payload: Payload::new(),
        }
    }

    /// Replace the task body
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Set one field of the task body
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// Result of a successful dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAssignment {
    /// Agent the task was sent to
    pub assigned_agent: String,
    /// Task identifier
    pub task_id: String,
}

/// Task sent to an agent and not yet answered
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightTask {
    /// Task identifier
    pub task_id: String,
    /// Agent the task was sent to
    pub assigned_agent: String,
    /// Dispatch time
    pub started_at: Instant,
    /// ID of the `task_request` message
    pub request_message_id: String,
}

/// Lifecycle of a dispatched task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Sent, waiting for a response
    Pending,
    /// A response arrived
    Completed,
    /// Swept or dropped without a response
    Expired,
}

/// A task resolved by its response
#[derive(Debug, Clone)]
pub struct CompletedTask {
    /// The task as it was in flight
    pub task: InFlightTask,
    /// Time between dispatch and response
    pub elapsed: Duration,
}

/// Load counters, in-flight tasks, and dispatch stats
#[derive(Debug)]
pub struct TaskDispatcher {
    loads: HashMap<String, usize>,
    in_flight: HashMap<String, InFlightTask>,
    finished: HashMap<String, TaskState>,
    finished_order: VecDeque<String>,
    stats: StatsCollector,
    task_timeout: Option<Duration>,
}

impl TaskDispatcher {
    /// Create a dispatcher; `task_timeout` of `None` disables expiry
    pub fn new(task_timeout: Option<Duration>) -> Self {
        Self {
            loads: HashMap::new(),
            in_flight: HashMap::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            stats: StatsCollector::new(),
            task_timeout,
        }
    }

    /// Pick the least-loaded candidate; ties go to the earliest candidate
    pub fn select_agent<'a>(&self, candidates: &'a [String]) -> Option<&'a String> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(position, name)| (self.load(name), *position))
            .map(|(_, name)| name)
    }

    /// Record a sent task and raise its agent's load
    pub fn begin(&mut self, task_id: String, agent: String, request_message_id: String, now: Instant) {
        *self.loads.entry(agent.clone()).or_insert(0) += 1;
        self.stats.record_dispatch();
        self.in_flight.insert(
            task_id.clone(),
            InFlightTask {
                task_id,
                assigned_agent: agent,
                started_at: now,
                request_message_id,
            },
        );
    }

    /// Resolve an in-flight task. Unknown IDs return `None` and change nothing.
    pub fn complete(&mut self, task_id: &str, now: Instant, failed: bool) -> Option<CompletedTask> {
        let task = self.in_flight.remove(task_id)?;
        self.release(&task.assigned_agent);

        let elapsed = now.saturating_duration_since(task.started_at);
        self.stats.record_completion(elapsed.as_secs_f64() * 1000.0, failed);
        self.remember(task_id.to_string(), TaskState::Completed);

        Some(CompletedTask { task, elapsed })
    }

    /// Expire every task older than the configured timeout
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<InFlightTask> {
        let Some(timeout) = self.task_timeout else {
            return Vec::new();
        };

        let expired_ids: Vec<String> = self
            .in_flight
            .values()
            .filter(|task| now.saturating_duration_since(task.started_at) >= timeout)
            .map(|task| task.task_id.clone())
            .collect();

        expired_ids
            .into_iter()
            .filter_map(|task_id| self.expire(&task_id))
            .collect()
    }

    /// Expire every in-flight task and reset all load counters
    pub fn drain(&mut self) -> Vec<InFlightTask> {
        let task_ids: Vec<String> = self.in_flight.keys().cloned().collect();
        let drained = task_ids
            .into_iter()
            .filter_map(|task_id| self.expire(&task_id))
            .collect();
        self.loads.clear();
        drained
    }

    fn expire(&mut self, task_id: &str) -> Option<InFlightTask> {
        let task = self.in_flight.remove(task_id)?;
        self.release(&task.assigned_agent);
        self.stats.record_expiry();
        self.remember(task.task_id.clone(), TaskState::Expired);
        debug!("Expired task {} on agent {}", task.task_id, task.assigned_agent);
        Some(task)
    }

    fn release(&mut self, agent: &str) {
        if let Some(load) = self.loads.get_mut(agent) {
            *load = load.saturating_sub(1);
        }
    }

    fn remember(&mut self, task_id: String, state: TaskState) {
        if self.finished.insert(task_id.clone(), state).is_none() {
            self.finished_order.push_back(task_id);
        }
        while self.finished_order.len() > FINISHED_HISTORY {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }

    /// Current load of an agent
    pub fn load(&self, agent: &str) -> usize {
        self.loads.get(agent).copied().unwrap_or(0)
    }

    /// Whether a task is waiting for its response
    pub fn is_in_flight(&self, task_id: &str) -> bool {
        self.in_flight.contains_key(task_id)
    }

    /// State of a task, if it is in flight or recently finished
    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        if self.in_flight.contains_key(task_id) {
            return Some(TaskState::Pending);
        }
        self.finished.get(task_id).copied()
    }

    /// In-flight task by ID
    pub fn in_flight(&self, task_id: &str) -> Option<&InFlightTask> {
        self.in_flight.get(task_id)
    }

    /// Number of tasks in flight
    pub fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Dispatch counters
    pub fn stats(&self) -> TaskStats {
        self.stats.snapshot()
    }
}
