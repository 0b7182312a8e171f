//! Host identity and registration types

/// Identifier of an endpoint that owns registrations
pub type OwnerId = u64;

/// Unique identifier for a registered host (name + per-name id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId {
    /// Host name as registered (case preserved)
    pub name: String,
    /// Smallest id that was free under `name` at registration time
    pub id: u32,
}

impl ServiceId {
    /// Create a new service id
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.id)
    }
}

/// Something that can own host registrations
///
/// The registry only needs a stable identity to enforce ownership on
/// unregister and to drop everything an endpoint owned when it closes.
pub trait RegistryOwner: Clone + Send + Sync {
    /// Stable identity of the owning endpoint
    fn owner_id(&self) -> OwnerId;
}

/// A live registration: the host and the endpoint that registered it
#[derive(Debug, Clone)]
pub struct HostRegistration<O> {
    /// Registered host
    pub service: ServiceId,
    /// Owning endpoint
    pub owner: O,
}

impl<O: RegistryOwner> HostRegistration<O> {
    /// Whether `owner` registered this host
    pub fn is_owned_by(&self, owner: OwnerId) -> bool {
        self.owner.owner_id() == owner
    }
}
