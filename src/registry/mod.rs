//! Host registry for name resolution
//!
//! The registry maps host names to the endpoints that registered them. Every
//! name can be registered many times; each registration gets the smallest id
//! not in use for that name, so `(name, id)` identifies exactly one host.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<HostRegistry<O>>
//!                  ┌──────────────────────────────┐
//!                  │ hosts: HashMap<name,         │
//!                  │   BTreeMap<id, owner O>      │
//!                  │ >                            │
//!                  └──────────────┬───────────────┘
//!                                 │
//!         ┌───────────────────────┼───────────────────────┐
//!         │                       │                       │
//!         ▼                       ▼                       ▼
//!    REGISTER/UNREGISTER    CONNECT/CONNECT_NAME        LOOKUP
//!    register()             lookup_exact()              search()
//!    unregister()           lookup_unique()
//!         │
//!    endpoint closed ──► remove_all(owner_id)
//! ```
//!
//! The owner type is generic so the registry does not depend on the
//! connection layer; the broker stores its own endpoint handles in it.

pub mod entry;
pub mod pattern;
pub mod store;

pub use entry::{HostRegistration, OwnerId, RegistryOwner, ServiceId};
pub use pattern::WildcardPattern;
pub use store::HostRegistry;
