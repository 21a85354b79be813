use dashmap::DashMap;
use subtle::ConstantTimeEq;

/// In-memory username to secret mapping.
///
/// Upserts are atomic per key, so concurrent `add_user` calls can never lose
/// an update or produce two entries for one username.
#[derive(Clone, Debug, Default)]
pub struct CredentialStore {
    entries: DashMap<String, String>,
}

impl CredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the secret for `username`
    pub fn add_user(&self, username: impl Into<String>, secret: impl Into<String>) {
        self.entries.insert(username.into(), secret.into());
    }

    /// Returns `true` iff `username` is present with exactly this `secret`.
    ///
    /// An empty store authenticates nobody; deciding what an empty store
    /// means is left to the resolver.
    #[must_use]
    pub fn authenticate(&self, username: &str, secret: &str) -> bool {
        self.entries
            .get(username)
            .is_some_and(|stored| stored.as_bytes().ct_eq(secret.as_bytes()).into())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod test {
    use super::CredentialStore;

    #[test]
    fn exact_pair_only() {
        let store = CredentialStore::new();
        store.add_user("alice", "s3cret");

        assert!(store.authenticate("alice", "s3cret"));
        assert!(!store.authenticate("alice", "s3cre"));
        assert!(!store.authenticate("alice", "s3cret "));
        assert!(!store.authenticate("Alice", "s3cret"));
        assert!(!store.authenticate("bob", "s3cret"));
        assert!(!store.authenticate("alice", ""));
    }

    #[test]
    fn empty_store_authenticates_nobody() {
        let store = CredentialStore::new();
        assert!(store.is_empty());
        assert!(!store.authenticate("", ""));
        assert!(!store.authenticate("alice", "s3cret"));
    }

    #[test]
    fn upsert_replaces_secret() {
        let store = CredentialStore::new();
        store.add_user("alice", "old");
        store.add_user("alice", "new");
        store.add_user("alice", "new");

        assert_eq!(store.len(), 1);
        assert!(store.authenticate("alice", "new"));
        assert!(!store.authenticate("alice", "old"));
    }
}
