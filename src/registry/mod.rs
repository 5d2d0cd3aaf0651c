//! Agent catalog — descriptors, capabilities, and eager lookup indices.
//!
//! The registry is the authoritative in-memory catalog of executable
//! agents. Mutation reindexes eagerly under a single registry-wide write
//! lock; reads take the read lock, so every call observes a consistent
//! snapshot. Lookup misses are not errors — they yield empty results.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::agents::AgentHandler;
use crate::error::SwarmError;

// ─── Capability model ─────────────────────────────────────────────────────────

/// What a capability fundamentally does. `Custom` keeps the set open for
/// domain agents without string-keyed dispatch tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Chat,
    Scrape,
    Analyze,
    Generate,
    Monitor,
    Custom(String),
}

impl CapabilityKind {
    pub fn as_str(&self) -> &str {
        match self {
            CapabilityKind::Chat => "chat",
            CapabilityKind::Scrape => "scrape",
            CapabilityKind::Analyze => "analyze",
            CapabilityKind::Generate => "generate",
            CapabilityKind::Monitor => "monitor",
            CapabilityKind::Custom(name) => name,
        }
    }
}

impl From<&str> for CapabilityKind {
    fn from(s: &str) -> Self {
        match s {
            "chat" => CapabilityKind::Chat,
            "scrape" => CapabilityKind::Scrape,
            "analyze" => CapabilityKind::Analyze,
            "generate" => CapabilityKind::Generate,
            "monitor" => CapabilityKind::Monitor,
            other => CapabilityKind::Custom(other.to_string()),
        }
    }
}

impl Serialize for CapabilityKind {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CapabilityKind {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(CapabilityKind::from(s.as_str()))
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named operation an agent exposes, with schema-described input/output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Unique within the owning agent.
    pub name: String,
    pub kind: CapabilityKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Value,
}

// ─── Descriptor ───────────────────────────────────────────────────────────────

/// Catalog entry for one executable agent.
///
/// `(agent_id, capability.name)` uniquely identifies one invocation target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Stable unique identity.
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Non-empty; capability names are unique within the agent.
    pub capabilities: Vec<Capability>,
    /// Disabled agents are not eligible for scheduling.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AgentDescriptor {
    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.name == name)
    }

    pub fn capability_names(&self) -> impl Iterator<Item = &str> {
        self.capabilities.iter().map(|c| c.name.as_str())
    }

    fn validate(&self) -> Result<(), SwarmError> {
        if self.agent_id.is_empty() {
            return Err(SwarmError::invalid("agent_id must not be empty"));
        }
        if self.capabilities.is_empty() {
            return Err(SwarmError::invalid(format!(
                "agent {} declares no capabilities",
                self.agent_id
            )));
        }
        let mut seen = HashSet::new();
        for cap in &self.capabilities {
            if !seen.insert(cap.name.as_str()) {
                return Err(SwarmError::invalid(format!(
                    "agent {} declares capability {:?} more than once",
                    self.agent_id, cap.name
                )));
            }
        }
        Ok(())
    }
}

/// Partial update applied by [`AgentRegistry::update`]. `None` fields keep
/// the current value; in particular a patch never erases `capabilities`
/// unless the caller provides a replacement set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentPatch {
    pub name: Option<String>,
    pub version: Option<String>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    pub capabilities: Option<Vec<Capability>>,
    pub enabled: Option<bool>,
}

/// Filter for [`AgentRegistry::list`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub category: Option<String>,
    pub tag: Option<String>,
    pub enabled_only: bool,
    /// Case-insensitive free-text match on id, name, and capability names.
    pub text: Option<String>,
}

/// Outcome of [`AgentRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Deployed,
    /// The id was already present and `replace` was not requested.
    AlreadyExists,
}

// ─── Registry ─────────────────────────────────────────────────────────────────

struct RegistryInner {
    agents: HashMap<String, AgentDescriptor>,
    handlers: HashMap<String, Arc<dyn AgentHandler>>,
    by_tag: HashMap<String, HashSet<String>>,
    by_category: HashMap<String, HashSet<String>>,
}

impl RegistryInner {
    fn index(&mut self, desc: &AgentDescriptor) {
        for tag in &desc.tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(desc.agent_id.clone());
        }
        if let Some(cat) = &desc.category {
            self.by_category
                .entry(cat.clone())
                .or_default()
                .insert(desc.agent_id.clone());
        }
    }

    fn unindex(&mut self, desc: &AgentDescriptor) {
        for tag in &desc.tags {
            if let Some(set) = self.by_tag.get_mut(tag) {
                set.remove(&desc.agent_id);
                if set.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
        if let Some(cat) = &desc.category {
            if let Some(set) = self.by_category.get_mut(cat) {
                set.remove(&desc.agent_id);
                if set.is_empty() {
                    self.by_category.remove(cat);
                }
            }
        }
    }
}

/// In-memory agent catalog with tag/category indices.
pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                agents: HashMap::new(),
                handlers: HashMap::new(),
                by_tag: HashMap::new(),
                by_category: HashMap::new(),
            }),
        }
    }

    /// Insert a descriptor together with its invocation handler.
    ///
    /// Fails with `AlreadyExists` when the id is present and `replace` is
    /// false. With `replace` the last writer wins and indices refresh.
    pub async fn register(
        &self,
        desc: AgentDescriptor,
        handler: Arc<dyn AgentHandler>,
        replace: bool,
    ) -> Result<RegisterOutcome, SwarmError> {
        desc.validate()?;
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.agents.get(&desc.agent_id) {
            if !replace {
                return Ok(RegisterOutcome::AlreadyExists);
            }
            let existing = existing.clone();
            inner.unindex(&existing);
        }
        inner.index(&desc);
        inner.handlers.insert(desc.agent_id.clone(), handler);
        inner.agents.insert(desc.agent_id.clone(), desc);
        Ok(RegisterOutcome::Deployed)
    }

    /// Atomically apply a patch and reindex. Returns `false` if not found.
    pub async fn update(&self, agent_id: &str, patch: AgentPatch) -> Result<bool, SwarmError> {
        let mut inner = self.inner.write().await;
        let Some(current) = inner.agents.get(agent_id).cloned() else {
            return Ok(false);
        };
        let mut next = current.clone();
        if let Some(name) = patch.name {
            next.name = name;
        }
        if let Some(version) = patch.version {
            next.version = version;
        }
        if let Some(category) = patch.category {
            next.category = Some(category);
        }
        if let Some(tags) = patch.tags {
            next.tags = tags;
        }
        if let Some(capabilities) = patch.capabilities {
            next.capabilities = capabilities;
        }
        if let Some(enabled) = patch.enabled {
            next.enabled = enabled;
        }
        next.validate()?;
        inner.unindex(&current);
        inner.index(&next);
        inner.agents.insert(agent_id.to_string(), next);
        Ok(true)
    }

    /// Returns `false` if the agent is unknown.
    pub async fn set_enabled(&self, agent_id: &str, enabled: bool) -> bool {
        let mut inner = self.inner.write().await;
        match inner.agents.get_mut(agent_id) {
            Some(desc) => {
                desc.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Remove and reindex. In-flight steps referencing this agent keep the
    /// handler snapshot they resolved and complete normally.
    pub async fn remove(&self, agent_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(desc) = inner.agents.remove(agent_id) else {
            return false;
        };
        inner.unindex(&desc);
        inner.handlers.remove(agent_id);
        true
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.inner.read().await.agents.get(agent_id).cloned()
    }

    /// Resolve the invocation handler for an agent.
    pub async fn handler(&self, agent_id: &str) -> Option<Arc<dyn AgentHandler>> {
        self.inner.read().await.handlers.get(agent_id).cloned()
    }

    pub async fn list(&self, filter: &AgentFilter) -> Vec<AgentDescriptor> {
        let inner = self.inner.read().await;
        let mut out: Vec<AgentDescriptor> = inner
            .agents
            .values()
            .filter(|d| !filter.enabled_only || d.enabled)
            .filter(|d| {
                filter
                    .category
                    .as_ref()
                    .map_or(true, |c| d.category.as_deref() == Some(c.as_str()))
            })
            .filter(|d| {
                filter
                    .tag
                    .as_ref()
                    .map_or(true, |t| d.tags.iter().any(|x| x == t))
            })
            .filter(|d| {
                filter.text.as_ref().map_or(true, |needle| {
                    let needle = needle.to_ascii_lowercase();
                    d.agent_id.to_ascii_lowercase().contains(&needle)
                        || d.name.to_ascii_lowercase().contains(&needle)
                        || d.capabilities
                            .iter()
                            .any(|c| c.name.to_ascii_lowercase().contains(&needle))
                })
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    pub async fn by_tag(&self, tag: &str) -> Vec<AgentDescriptor> {
        let inner = self.inner.read().await;
        let mut out: Vec<AgentDescriptor> = inner
            .by_tag
            .get(tag)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.agents.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    pub async fn by_category(&self, category: &str) -> Vec<AgentDescriptor> {
        let inner = self.inner.read().await;
        let mut out: Vec<AgentDescriptor> = inner
            .by_category
            .get(category)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.agents.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.agents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.agents.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe shared registry.
pub type SharedRegistry = Arc<AgentRegistry>;
