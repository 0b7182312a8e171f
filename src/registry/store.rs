//! Host registry implementation
//!
//! The central table of registered hosts, shared by every broker session.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::entry::{HostRegistration, OwnerId, RegistryOwner, ServiceId};
use super::pattern::WildcardPattern;

/// Central registry for all registered hosts
///
/// Thread-safe via `RwLock`. Lookups and searches from many sessions run
/// concurrently; register/unregister/remove take the lock exclusively.
///
/// Registrations are grouped by name with ids kept sorted, so the smallest
/// free id is the first gap in the group.
pub struct HostRegistry<O> {
    hosts: RwLock<HashMap<String, BTreeMap<u32, O>>>,
}

impl<O: RegistryOwner> HostRegistry<O> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
        }
    }

    /// Register a host under `name`
    ///
    /// Returns the smallest id not already in use for `name`.
    pub fn register(&self, owner: O, name: &str) -> u32 {
        self.register_with(owner, name, |_| {})
    }

    /// Register a host and run `assigned` before anyone else can see it
    ///
    /// `assigned` gets the new id while the registry is still locked, so it
    /// must not call back into the registry.
    pub fn register_with(&self, owner: O, name: &str, assigned: impl FnOnce(u32)) -> u32 {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        let group = hosts.entry(name.to_string()).or_default();

        let mut id = 0u32;
        for &taken in group.keys() {
            if taken != id {
                break;
            }
            id += 1;
        }

        let owner_id = owner.owner_id();
        group.insert(id, owner);

        tracing::info!(
            host = %ServiceId::new(name, id),
            owner = owner_id,
            "Host registered"
        );

        assigned(id);
        id
    }

    /// Remove a registration if `owner` is the one who made it
    ///
    /// Returns whether anything was removed. Unknown hosts and hosts owned
    /// by someone else are left alone.
    pub fn unregister(&self, owner: OwnerId, service: &ServiceId) -> bool {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());

        let Some(group) = hosts.get_mut(&service.name) else {
            return false;
        };

        match group.get(&service.id) {
            Some(existing) if existing.owner_id() == owner => {}
            Some(existing) => {
                tracing::warn!(
                    host = %service,
                    expected = existing.owner_id(),
                    actual = owner,
                    "Unregister by non-owner ignored"
                );
                return false;
            }
            None => return false,
        }

        group.remove(&service.id);
        if group.is_empty() {
            hosts.remove(&service.name);
        }

        tracing::info!(host = %service, owner = owner, "Host unregistered");
        true
    }

    /// Find the registration for an exact (name, id)
    pub fn lookup_exact(&self, service: &ServiceId) -> Option<HostRegistration<O>> {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());

        hosts
            .get(&service.name)
            .and_then(|group| group.get(&service.id))
            .map(|owner| HostRegistration {
                service: service.clone(),
                owner: owner.clone(),
            })
    }

    /// Find the only registration for `name`
    ///
    /// Returns `None` when the name is unknown or ambiguous.
    pub fn lookup_unique(&self, name: &str) -> Option<HostRegistration<O>> {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());

        let group = hosts.get(name)?;
        if group.len() != 1 {
            return None;
        }

        group.iter().next().map(|(&id, owner)| HostRegistration {
            service: ServiceId::new(name, id),
            owner: owner.clone(),
        })
    }

    /// All registrations whose name matches a wildcard pattern
    ///
    /// Results are ordered by name, then id.
    pub fn search(&self, pattern: &str) -> Vec<HostRegistration<O>> {
        let pattern = WildcardPattern::new(pattern);
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());

        let mut results: Vec<HostRegistration<O>> = hosts
            .iter()
            .filter(|(name, _)| pattern.matches(name))
            .flat_map(|(name, group)| {
                group.iter().map(move |(&id, owner)| HostRegistration {
                    service: ServiceId::new(name.as_str(), id),
                    owner: owner.clone(),
                })
            })
            .collect();

        results.sort_by(|a, b| a.service.cmp(&b.service));
        results
    }

    /// Drop every registration owned by `owner`
    ///
    /// Returns the removed hosts.
    pub fn remove_all(&self, owner: OwnerId) -> Vec<ServiceId> {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = Vec::new();

        hosts.retain(|name, group| {
            group.retain(|&id, o| {
                if o.owner_id() == owner {
                    removed.push(ServiceId::new(name.as_str(), id));
                    false
                } else {
                    true
                }
            });
            !group.is_empty()
        });

        if !removed.is_empty() {
            tracing::info!(owner = owner, count = removed.len(), "Owner hosts removed");
        }

        removed
    }

    /// Total number of live registrations
    pub fn len(&self) -> usize {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        hosts.values().map(BTreeMap::len).sum()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<O: RegistryOwner> Default for HostRegistry<O> {
    fn default() -> Self {
        Self::new()
    }
}
