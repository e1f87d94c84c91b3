//! Agents: the components that produce and consume events.
//!
//! An agent is built by a factory from an [`AgentContext`] and registered
//! with the dispatcher under its name. While being built it asks for the
//! subscriptions it needs (at least one for `shutdown`); these are held
//! back until the agent is registered, so loading also works on a running
//! dispatcher. Background work runs on threads the agent owns and stops
//! when the shutdown event arrives.

use crate::config::Config;
use crate::dispatcher::{Dispatcher, Submitter, lock};
use crate::error::EventError;
use crate::event::Event;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// A component that receives the events it has subscribed to.
pub trait Agent: Send + Sync {
    /// Name used as emitter and as subscription owner.
    fn name(&self) -> &str;

    /// Handle one delivered event. Errors are logged by the dispatcher.
    fn handle_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// In-memory state handed to an agent at construction.
pub type AgentState = Arc<Mutex<Map<String, Value>>>;

/// Everything an agent factory gets.
#[derive(Clone)]
pub struct AgentContext {
    pub name: String,
    pub settings: toml::Table,
    pub state: AgentState,
    pub submitter: Submitter,
    subscriptions: Arc<Mutex<Vec<Event>>>,
}

impl AgentContext {
    pub fn new(name: impl Into<String>, settings: toml::Table, submitter: Submitter) -> Self {
        Self {
            name: name.into(),
            settings,
            state: AgentState::default(),
            submitter,
            subscriptions: Arc::default(),
        }
    }

    pub fn submit(&self, event: Event) {
        self.submitter.submit(event);
    }

    /// Subscribe this agent to events `id` emitted by `agent_filter`.
    ///
    /// Nothing is submitted until [`AgentContext::flush_subscriptions`].
    pub fn subscribe(&self, id: &str, agent_filter: &str) -> Result<(), EventError> {
        let event = Event::subscribe(id, agent_filter, self.name.as_str())?;
        lock(&self.subscriptions).push(event);
        Ok(())
    }

    pub fn subscribe_shutdown(&self) {
        lock(&self.subscriptions).push(Event::subscribe_shutdown(self.name.as_str()));
    }

    /// Submit the subscriptions requested so far, in order. Call once the
    /// agent is registered. Returns how many were submitted.
    pub fn flush_subscriptions(&self) -> usize {
        let held = std::mem::take(&mut *lock(&self.subscriptions));
        let count = held.len();
        for event in held {
            self.submit(event);
        }
        count
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(toml::Value::as_str)
    }

    pub fn setting_bool(&self, key: &str) -> Option<bool> {
        self.settings.get(key).and_then(toml::Value::as_bool)
    }
}

pub type AgentFactory = fn(AgentContext) -> anyhow::Result<Arc<dyn Agent>>;

/// Factories available to [`load_agents`], keyed by agent name.
#[derive(Default, Clone)]
pub struct AgentFactories {
    factories: BTreeMap<String, AgentFactory>,
}

impl AgentFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// The factories shipped with the crate.
    pub fn builtin() -> Self {
        let mut factories = Self::new();
        factories.register(crate::agents::console::NAME, crate::agents::console::factory);
        factories
    }

    pub fn register(&mut self, name: impl Into<String>, factory: AgentFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn get(&self, name: &str) -> Option<AgentFactory> {
        self.factories.get(name).copied()
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// Build and register every enabled agent in `config`, in name order.
///
/// Each agent is registered before its subscriptions are submitted, so this
/// may run before or after [`Dispatcher::start`].
///
/// Disabled agents, unknown names and failing factories are logged and
/// skipped. Returns the names of the agents that were registered.
pub fn load_agents(
    config: &Config,
    factories: &AgentFactories,
    dispatcher: &Dispatcher,
) -> Vec<String> {
    info!("Loading agents");
    let mut loaded = Vec::new();

    for (name, agent_config) in &config.agents {
        if !agent_config.enabled {
            info!(agent = %name, "Disabled, skipping");
            continue;
        }

        let Some(factory) = factories.get(name) else {
            warn!(agent = %name, known = ?factories.names(), "No such agent, skipping");
            continue;
        };

        let ctx = AgentContext::new(name.as_str(), agent_config.settings.clone(), dispatcher.submitter());
        match factory(ctx.clone()) {
            Ok(agent) => {
                if agent.name() != name {
                    warn!(agent = %name, reports = agent.name(), "Agent name differs from its config key");
                }
                dispatcher.register(agent);
                ctx.flush_subscriptions();
                loaded.push(name.clone());
                info!(agent = %name, "Instance created");
            }
            Err(e) => error!(agent = %name, error = %e, "Failed to create agent"),
        }
    }

    loaded
}
