//! Floorplan core types: entity observations, tri-state normalization and alias lookup.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Normalized view of a remote entity's textual state.
///
/// Serialized as an optional boolean: `true` = on, `false` = off, `null` = unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum TriState {
    On,
    Off,
    #[default]
    Unknown,
}

impl TriState {
    pub fn as_bool(self) -> Option<bool> {
        match self {
            TriState::On => Some(true),
            TriState::Off => Some(false),
            TriState::Unknown => None,
        }
    }
}

impl From<Option<bool>> for TriState {
    fn from(v: Option<bool>) -> Self {
        match v {
            Some(true) => TriState::On,
            Some(false) => TriState::Off,
            None => TriState::Unknown,
        }
    }
}

impl From<TriState> for Option<bool> {
    fn from(v: TriState) -> Self { v.as_bool() }
}

impl fmt::Display for TriState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriState::On => "on",
            TriState::Off => "off",
            TriState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Collapse a remote textual state into a [`TriState`].
///
/// Multi-valued sensors are intentionally reduced to on/off/unknown; anything that is
/// not one of the four recognized words (including `"unavailable"` and `""`) is unknown.
pub fn normalize(state: &str) -> TriState {
    match state {
        "on" | "open" => TriState::On,
        "off" | "closed" => TriState::Off,
        _ => TriState::Unknown,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntityError {
    #[error("entity id must not be empty")]
    EmptyId,
}

/// One observation of one remote entity. Immutable once built; only [`EntityState::new`]
/// and [`EntityState::from_remote`] construct it, so the id is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityState {
    id: String,
    value: TriState,
}

impl EntityState {
    pub fn new(id: impl Into<String>, value: TriState) -> Result<Self, EntityError> {
        let id = id.into();
        if id.is_empty() {
            return Err(EntityError::EmptyId);
        }
        Ok(Self { id, value })
    }

    /// Build from the raw `(entity_id, state)` pair reported by the remote.
    pub fn from_remote(entity_id: &str, state: &str) -> Result<Self, EntityError> {
        Self::new(entity_id, normalize(state))
    }

    pub fn id(&self) -> &str { &self.id }

    pub fn value(&self) -> TriState { self.value }
}

pub fn entity_domain(id: &str) -> &str {
    id.split_once('.').map(|(d, _)| d).unwrap_or(id)
}

/// Static entity id -> visual element id mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AliasTable {
    map: HashMap<String, String>,
}

impl AliasTable {
    pub fn new(map: HashMap<String, String>) -> Self { Self { map } }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    /// Element id for an entity; the entity id itself when no alias is configured.
    pub fn resolve<'a>(&'a self, entity_id: &'a str) -> &'a str {
        self.map.get(entity_id).map(String::as_str).unwrap_or(entity_id)
    }
}

impl FromIterator<(String, String)> for AliasTable {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self { map: iter.into_iter().collect() }
    }
}

/// Restricts which entity domains are synchronized. An empty filter admits everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainFilter {
    domains: Vec<String>,
}

impl DomainFilter {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { domains: domains.into_iter().map(Into::into).collect() }
    }

    pub fn allow_all() -> Self { Self::default() }

    pub fn admits(&self, entity_id: &str) -> bool {
        if self.domains.is_empty() {
            return true;
        }
        let domain = entity_domain(entity_id);
        self.domains.iter().any(|d| d == domain)
    }
}

/// Lifecycle of the synchronization loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Syncing,
    Streaming,
    Reconnecting,
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub mod prelude {
    pub use super::{normalize, AliasTable, ConnectionState, DomainFilter, EntityState, TriState};
}
