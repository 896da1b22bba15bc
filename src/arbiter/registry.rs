//! Connection and provider registry — the daemon's pure bookkeeping.
//!
//! All methods are pure state transitions with no I/O. Error strings
//! are machine-readable reasons echoed verbatim in wire responses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ipc::protocol::Role;
use crate::session::types::{ProviderDescriptor, ServiceId};

/// Unique identifier for a peer connection.
///
/// Monotonically increasing counter. Used to route pushes to the
/// correct provider, selector, or client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Provider entry in the registry's service table.
#[derive(Debug)]
struct ProviderEntry {
    connection: ConnectionId,
    capabilities: Vec<String>,
}

/// Registry state — connections, provider services, and the selector slot.
///
/// Owned exclusively by the daemon loop. No concurrent access.
#[derive(Debug, Default)]
pub struct Registry {
    /// Role of every connection that completed the handshake.
    connections: HashMap<ConnectionId, Role>,
    /// Provider services keyed by service ID.
    providers: HashMap<ServiceId, ProviderEntry>,
    /// At most one chooser UI may be attached at a time.
    selector: Option<ConnectionId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection under its declared role.
    ///
    /// Returns `Err("selector_already_connected")` when a second selector
    /// tries to attach while one is already connected.
    pub fn add_connection(&mut self, id: ConnectionId, role: Role) -> Result<(), &'static str> {
        if role == Role::Selector {
            if self.selector.is_some() {
                return Err("selector_already_connected");
            }
            self.selector = Some(id);
        }
        self.connections.insert(id, role);
        Ok(())
    }

    /// Remove a connection and implicitly deregister everything it owned.
    ///
    /// Returns the services that died with it, so in-flight sessions can
    /// be told.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Vec<ServiceId> {
        self.connections.remove(&id);
        if self.selector == Some(id) {
            self.selector = None;
        }
        let dead: Vec<ServiceId> = self
            .providers
            .iter()
            .filter(|(_, entry)| entry.connection == id)
            .map(|(service, _)| service.clone())
            .collect();
        for service in &dead {
            self.providers.remove(service);
        }
        dead
    }

    pub fn connection_role(&self, id: ConnectionId) -> Option<Role> {
        self.connections.get(&id).copied()
    }

    /// Register a provider service on a connection.
    ///
    /// Returns `Err("service_already_registered")` if the service ID is
    /// already taken, by any connection.
    pub fn register_provider(
        &mut self,
        service: ServiceId,
        capabilities: Vec<String>,
        connection: ConnectionId,
    ) -> Result<(), &'static str> {
        if self.providers.contains_key(&service) {
            return Err("service_already_registered");
        }
        self.providers.insert(
            service,
            ProviderEntry {
                connection,
                capabilities,
            },
        );
        Ok(())
    }

    /// Deregister a provider service.
    ///
    /// Only the owning connection may deregister; anything else gets
    /// `Err("unknown_service")`, which also covers never-registered IDs.
    pub fn deregister_provider(
        &mut self,
        service: &ServiceId,
        connection: ConnectionId,
    ) -> Result<(), &'static str> {
        match self.providers.get(service) {
            Some(entry) if entry.connection == connection => {
                self.providers.remove(service);
                Ok(())
            }
            _ => Err("unknown_service"),
        }
    }

    /// Resolve the connection currently serving a provider service.
    pub fn provider_connection(&self, service: &ServiceId) -> Option<ConnectionId> {
        self.providers.get(service).map(|entry| entry.connection)
    }

    /// Snapshot of all registered providers, for session admission and
    /// the list query.
    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers
            .iter()
            .map(|(service, entry)| ProviderDescriptor {
                service: service.clone(),
                capabilities: entry.capabilities.clone(),
            })
            .collect()
    }

    /// Connections of all registered providers, deduplicated. Used to
    /// broadcast session teardown notices.
    pub fn provider_connections(&self) -> Vec<ConnectionId> {
        let mut connections: Vec<ConnectionId> = self
            .providers
            .values()
            .map(|entry| entry.connection)
            .collect();
        connections.sort_by_key(|id| id.0);
        connections.dedup();
        connections
    }

    pub fn selector_connection(&self) -> Option<ConnectionId> {
        self.selector
    }
}
