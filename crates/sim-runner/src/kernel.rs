//! The native simulation kernel wrapper: owns the agent-state array for one
//! run and advances it one tick at a time by running each agent's behavior
//! chain.

use std::collections::HashMap;

use serde_json::{json, Value};

use sim_core::{
    agent_behaviors, agent_id, agent_messages, is_engine_message, is_engine_recipient, Diagnostic,
};
use sim_script::{HostContext, HostState};

use crate::bridge::{BehaviorBridge, LoadedBehavior};
use crate::dataset::LoadedDataset;
use crate::diag;

/// Everything resolved from a manifest that one simulation needs.
pub struct SimulationComponents {
    pub properties: Value,
    /// Dataset payloads keyed by shortname, as behaviors see them.
    pub datasets: Value,
    pub loaded_datasets: Vec<LoadedDataset>,
    pub initializer: LoadedBehavior,
    pub behaviors: Vec<LoadedBehavior>,
}

/// Handle over the kernel for one run. Released wrappers refuse to step.
pub struct KernelWrapper {
    state: Vec<Value>,
    step: u64,
    released: bool,
}

impl KernelWrapper {
    /// Build a wrapper from an agent-state array. Agents without an id get
    /// a stable positional one.
    pub fn start_simulation(initial: Vec<Value>) -> Self {
        let state = initial
            .into_iter()
            .enumerate()
            .map(|(idx, mut agent)| {
                if !agent.is_object() {
                    agent = json!({ "data": agent });
                }
                let map = agent.as_object_mut().expect("agent coerced to object");
                if !map.contains_key("agent_id") {
                    map.insert("agent_id".to_string(), json!(format!("agent-{}", idx)));
                }
                agent
            })
            .collect();
        Self {
            state,
            step: 0,
            released: false,
        }
    }

    pub fn initial_state(&self) -> &[Value] {
        &self.state
    }

    pub fn free(&mut self) {
        self.released = true;
    }

    /// Advance the simulation one tick, returning the new agent-state array.
    pub fn next_state(
        &mut self,
        components: &SimulationComponents,
        bridge: &mut BehaviorBridge,
    ) -> Result<Vec<Value>, Diagnostic> {
        if self.released {
            return Err(diag::normalize_kernel(
                "stepped a released simulation wrapper",
                "engine",
            ));
        }

        let inboxes = route_messages(&self.state);
        let snapshot = self.state.clone();

        let mut next = self.state.clone();
        for agent in &mut next {
            if let Some(map) = agent.as_object_mut() {
                map.insert("messages".to_string(), json!([]));
            }
        }

        for idx in 0..next.len() {
            let behavior_names = agent_behaviors(&next[idx]);
            if behavior_names.is_empty() {
                continue;
            }
            let context = AgentContext {
                globals: &components.properties,
                datasets: &components.datasets,
                inbox: inbox_for(&inboxes, &snapshot[idx]),
                neighbors: neighbors_of(&snapshot, idx),
                step: self.step,
            };
            for name in behavior_names {
                let behavior = components
                    .behaviors
                    .iter()
                    .find(|b| b.filename == name)
                    .ok_or_else(|| {
                        diag::normalize_kernel(&format!("behavior '{}' is not loaded", name), &name)
                    })?;
                let mut handle = AgentHandle {
                    agent: &mut next[idx],
                };
                bridge
                    .invoke_behavior(behavior, &mut handle, &context)
                    .map_err(|err| diag::normalize_bridge(&err))?;
            }
        }

        apply_engine_messages(&mut next);

        self.step += 1;
        self.state = next.clone();
        Ok(next)
    }
}

/// Scan a freshly produced state for the first engine-addressed stop
/// message. Any agent may signal it; no ordering guarantee is made across
/// agents.
pub fn scan_for_stop(state: &[Value]) -> Option<Value> {
    for agent in state {
        for msg in agent_messages(agent) {
            if is_engine_message(&msg, "stop") {
                return Some(msg.get("data").cloned().unwrap_or(Value::Null));
            }
        }
    }
    None
}

/// Collect messages written during the previous tick, keyed by recipient
/// name. Engine-addressed messages are not delivered to agents.
fn route_messages(state: &[Value]) -> HashMap<String, Vec<Value>> {
    let mut inboxes: HashMap<String, Vec<Value>> = HashMap::new();
    for agent in state {
        let from = agent_id(agent).unwrap_or_default().to_string();
        for msg in agent_messages(agent) {
            let to = match msg.get("to") {
                Some(to) => to.clone(),
                None => continue,
            };
            if is_engine_recipient(&to) {
                continue;
            }
            let recipients: Vec<String> = match &to {
                Value::String(name) => vec![name.clone()],
                Value::Array(names) => names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => continue,
            };
            for recipient in recipients {
                let mut delivered = msg.clone();
                if let Some(map) = delivered.as_object_mut() {
                    map.insert("from".to_string(), json!(from));
                }
                inboxes.entry(recipient).or_default().push(delivered);
            }
        }
    }
    inboxes
}

/// Messages addressed to this agent's id or display name.
fn inbox_for(inboxes: &HashMap<String, Vec<Value>>, agent: &Value) -> Value {
    let mut inbox = Vec::new();
    if let Some(id) = agent_id(agent) {
        if let Some(messages) = inboxes.get(id) {
            inbox.extend(messages.iter().cloned());
        }
    }
    if let Some(name) = agent.get("agent_name").and_then(Value::as_str) {
        if let Some(messages) = inboxes.get(name) {
            inbox.extend(messages.iter().cloned());
        }
    }
    Value::Array(inbox)
}

fn neighbors_of(snapshot: &[Value], idx: usize) -> Value {
    let neighbors: Vec<Value> = snapshot
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != idx)
        .map(|(_, agent)| agent.clone())
        .collect();
    Value::Array(neighbors)
}

/// Apply create_agent / remove_agent messages addressed to the engine.
fn apply_engine_messages(state: &mut Vec<Value>) {
    let mut created = Vec::new();
    let mut removed = Vec::new();
    for agent in state.iter() {
        for msg in agent_messages(agent) {
            if is_engine_message(&msg, "create_agent") {
                if let Some(data) = msg.get("data") {
                    created.push(data.clone());
                }
            }
            if is_engine_message(&msg, "remove_agent") {
                if let Some(id) = msg
                    .get("data")
                    .and_then(|d| d.get("agent_id"))
                    .and_then(Value::as_str)
                {
                    removed.push(id.to_string());
                }
            }
        }
    }
    state.retain(|agent| {
        agent_id(agent)
            .map(|id| !removed.iter().any(|r| r == id))
            .unwrap_or(true)
    });
    let base = state.len();
    for (offset, mut agent) in created.into_iter().enumerate() {
        if !agent.is_object() {
            agent = json!({ "data": agent });
        }
        let map = agent.as_object_mut().expect("agent coerced to object");
        if !map.contains_key("agent_id") {
            map.insert(
                "agent_id".to_string(),
                json!(format!("agent-{}", base + offset)),
            );
        }
        map.entry("messages".to_string()).or_insert_with(|| json!([]));
        state.push(agent);
    }
}

/// What an initializer can see: globals and datasets, no agents yet.
pub struct InitContext<'a> {
    pub globals: &'a Value,
    pub datasets: &'a Value,
}

impl HostContext for InitContext<'_> {
    fn globals(&self) -> Value {
        self.globals.clone()
    }

    fn data(&self) -> Value {
        self.datasets.clone()
    }

    fn messages(&self) -> Value {
        json!([])
    }

    fn neighbors(&self) -> Value {
        json!([])
    }

    fn step(&self) -> u64 {
        0
    }
}

/// Mutable view over one agent's state object.
struct AgentHandle<'a> {
    agent: &'a mut Value,
}

impl HostState for AgentHandle<'_> {
    fn get(&self, key: &str) -> Option<Value> {
        self.agent.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        if let Some(map) = self.agent.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    fn add_message(&mut self, to: Value, kind: String, data: Value) {
        if let Some(map) = self.agent.as_object_mut() {
            let messages = map
                .entry("messages".to_string())
                .or_insert_with(|| json!([]));
            if let Some(arr) = messages.as_array_mut() {
                arr.push(json!({"to": to, "type": kind, "data": data}));
            }
        }
    }
}

/// Per-agent, per-tick read view.
struct AgentContext<'a> {
    globals: &'a Value,
    datasets: &'a Value,
    inbox: Value,
    neighbors: Value,
    step: u64,
}

impl HostContext for AgentContext<'_> {
    fn globals(&self) -> Value {
        self.globals.clone()
    }

    fn data(&self) -> Value {
        self.datasets.clone()
    }

    fn messages(&self) -> Value {
        self.inbox.clone()
    }

    fn neighbors(&self) -> Value {
        self.neighbors.clone()
    }

    fn step(&self) -> u64 {
        self.step
    }
}
