//! Built-in fallbacks consulted by the resolver when no override is set.

pub mod access;
pub mod credentials;
pub mod domains;

pub use self::{
    access::{AccessControl, AccessPolicy, AccessRules, Action, Network},
    credentials::CredentialStore,
    domains::{Domain, DomainSet},
};

/// The three in-memory stores, shared between the lifecycle controller
/// (which mutates them) and every resolver (which only reads them).
///
/// Cloning copies the current contents; the clone evolves independently.
#[derive(Clone, Debug, Default)]
pub struct Stores {
    pub credentials: CredentialStore,
    pub domains: DomainSet,
    pub access: AccessControl,
}
