//! Agent registry: maps public `(host, path)` to one registered agent
//!
//! Each agent binds a `(host, path_prefix)` pair for the lifetime of its
//! control channel. Resolution picks the registration with the longest
//! matching non-empty prefix; an empty prefix is the host-wide fallback of
//! lowest priority.

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Registration key. The empty prefix is the host-wide wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub host: String,
    pub path_prefix: String,
}

impl RouteKey {
    pub fn new(host: impl Into<String>, path_prefix: impl Into<String>) -> Self {
        Self {
            host: normalize_host(&host.into()).to_string(),
            path_prefix: path_prefix.into(),
        }
    }
}

/// One live agent registration.
#[derive(Debug, Clone)]
pub struct Registration<T> {
    pub key: RouteKey,
    /// Whether the agent can carry HTTP/2-flavored requests.
    pub caps_http2: bool,
    /// The agent's control channel handle.
    pub target: T,
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("{host} has a existing connection")]
    Duplicate { host: String },
}

/// Registry of live agents, keyed by `(host, path_prefix)`.
///
/// Mutated from handshake and disconnect tasks while `resolve` runs on the
/// request path, so all state lives in a concurrent map.
pub struct AgentRegistry<T> {
    entries: DashMap<RouteKey, Registration<T>>,
}

impl<T: Clone> AgentRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert a registration; refuses if the key is already bound.
    pub fn register(&self, registration: Registration<T>) -> Result<(), RegistryError> {
        let key = registration.key.clone();
        match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!(host = %key.host, prefix = %key.path_prefix, "Rejected duplicate registration");
                Err(RegistryError::Duplicate { host: key.host })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(host = %key.host, prefix = %key.path_prefix, "Registered agent");
                slot.insert(registration);
                Ok(())
            }
        }
    }

    /// Remove a registration. Removing a missing key is a no-op.
    pub fn remove(&self, key: &RouteKey) -> Option<Registration<T>> {
        let removed = self.entries.remove(key).map(|(_, reg)| reg);
        if removed.is_some() {
            debug!(host = %key.host, prefix = %key.path_prefix, "Removed agent registration");
        }
        removed
    }

    /// Pick the agent for a public request.
    ///
    /// Candidates share the request's host and have a prefix that is empty
    /// or a prefix of the path; the longest non-empty prefix wins, the
    /// empty prefix is the fallback.
    pub fn resolve(&self, host: &str, path: &str) -> Option<Registration<T>> {
        let host = normalize_host(host);
        let mut best: Option<Registration<T>> = None;

        for entry in self.entries.iter() {
            let key = entry.key();
            if key.host != host {
                continue;
            }
            if !key.path_prefix.is_empty() && !path.starts_with(key.path_prefix.as_str()) {
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => key.path_prefix.len() > current.key.path_prefix.len(),
            };
            if better {
                best = Some(entry.value().clone());
            }
        }

        best
    }

    pub fn contains(&self, key: &RouteKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

impl<T: Clone> Default for AgentRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip the port from a `Host` header value.
fn normalize_host(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}
