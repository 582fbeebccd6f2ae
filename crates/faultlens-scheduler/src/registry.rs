//! Agent Registry — maps agent ids to their single live instance.
//!
//! Factories are registered up front; instances are built lazily on first lookup and
//! then shared for the life of the registry. Individual agents are never removed,
//! only the whole registry is torn down.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use faultlens_core::{FaultLensError, Result};

use crate::agent::{Agent, AgentId, AgentKind};

/// Builds the one instance of an agent.
pub type AgentFactory = Arc<dyn Fn() -> Result<Arc<dyn Agent>> + Send + Sync>;

struct Registration {
    kind: AgentKind,
    factory: AgentFactory,
}

/// Registry of all known agents, owned by the scheduler.
pub struct AgentRegistry {
    registrations: RwLock<HashMap<AgentId, Registration>>,
    instances: RwLock<HashMap<AgentId, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Register how to build an agent. Re-registering an id replaces the factory but
    /// not an instance that was already built.
    pub fn register<F>(&self, id: AgentId, kind: AgentKind, factory: F)
    where
        F: Fn() -> Result<Arc<dyn Agent>> + Send + Sync + 'static,
    {
        tracing::info!("🧩 Registered agent: {} ({:?})", id, kind);
        let mut regs = self.registrations.write().unwrap_or_else(|e| e.into_inner());
        regs.insert(
            id,
            Registration {
                kind,
                factory: Arc::new(factory),
            },
        );
    }

    /// Register an already-built agent.
    pub fn register_instance(&self, agent: Arc<dyn Agent>) {
        let id = agent.id();
        let kind = agent.kind();
        let shared = agent.clone();
        self.register(id.clone(), kind, move || Ok(shared.clone()));
        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        instances.entry(id).or_insert(agent);
    }

    /// Get the agent for `id`, building it on first use.
    pub fn get_or_create(&self, id: &AgentId) -> Result<Arc<dyn Agent>> {
        {
            let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
            if let Some(agent) = instances.get(id) {
                return Ok(agent.clone());
            }
        }

        let factory = {
            let regs = self.registrations.read().unwrap_or_else(|e| e.into_inner());
            regs.get(id)
                .map(|r| r.factory.clone())
                .ok_or_else(|| FaultLensError::AgentNotFound(id.to_string()))?
        };

        let mut instances = self.instances.write().unwrap_or_else(|e| e.into_inner());
        // Another caller may have built it while we waited for the write lock.
        if let Some(agent) = instances.get(id) {
            return Ok(agent.clone());
        }
        let agent = factory()?;
        tracing::debug!("Instantiated agent {}", id);
        instances.insert(id.clone(), agent.clone());
        Ok(agent)
    }

    /// Registered kind of an agent, without instantiating it.
    pub fn kind_of(&self, id: &AgentId) -> Option<AgentKind> {
        let regs = self.registrations.read().unwrap_or_else(|e| e.into_inner());
        regs.get(id).map(|r| r.kind)
    }

    pub fn is_registered(&self, id: &AgentId) -> bool {
        self.kind_of(id).is_some()
    }

    /// All registered ids, sorted.
    pub fn registered_ids(&self) -> Vec<AgentId> {
        let regs = self.registrations.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<_> = regs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Agents built so far.
    pub fn instantiated(&self) -> Vec<Arc<dyn Agent>> {
        let instances = self.instances.read().unwrap_or_else(|e| e.into_inner());
        instances.values().cloned().collect()
    }

    /// Total number of registered agents.
    pub fn count(&self) -> usize {
        self.registrations.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop every registration and instance.
    pub fn teardown(&self) {
        self.instances.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.registrations.write().unwrap_or_else(|e| e.into_inner()).clear();
        tracing::info!("🧹 Agent registry torn down");
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
