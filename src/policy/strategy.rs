//! Ordered fallback chains.
//!
//! A [`Chain`] asks each [`Strategy`] in turn and stops at the first one that
//! returns a verdict. The resolver builds one chain per checkpoint:
//! override, then built-in store, then default.

use std::sync::Arc;

use async_trait::async_trait;

use super::{
    Authenticate, Checkpoint, Connect, Grant, Override, RcptTo, Rejection, Verdict,
};
use crate::{outgoing, session::Session, store::Stores};

#[async_trait]
pub trait Strategy<C: Checkpoint>: Send + Sync {
    /// `None` passes the decision on to the next strategy
    async fn evaluate(&self, subject: &C::Subject, session: &Session) -> Option<Verdict>;

    fn name(&self) -> &'static str;
}

pub struct Chain<C: Checkpoint> {
    strategies: Vec<Box<dyn Strategy<C>>>,
}

impl<C: Checkpoint> Default for Chain<C> {
    fn default() -> Self {
        Self {
            strategies: Vec::default(),
        }
    }
}

impl<C: Checkpoint> Chain<C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn then(mut self, strategy: impl Strategy<C> + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Names of the strategies in evaluation order
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Evaluate strategies in order; the first verdict wins. An exhausted
    /// chain allows.
    pub async fn evaluate(&self, subject: &C::Subject, session: &Session) -> Verdict {
        for strategy in &self.strategies {
            if let Some(verdict) = strategy.evaluate(subject, session).await {
                outgoing!(
                    "[{}] {} decided by {}: {verdict:?}",
                    session.id,
                    C::KIND,
                    strategy.name()
                );
                return verdict;
            }
        }

        Verdict::Allow(C::grant(subject))
    }
}

/// The caller's override. Always definitive.
pub struct OverrideStrategy<C: Checkpoint> {
    hook: Override<C::Subject>,
}

impl<C: Checkpoint> OverrideStrategy<C> {
    #[must_use]
    pub const fn new(hook: Override<C::Subject>) -> Self {
        Self { hook }
    }
}

#[async_trait]
impl<C: Checkpoint> Strategy<C> for OverrideStrategy<C> {
    async fn evaluate(&self, subject: &C::Subject, session: &Session) -> Option<Verdict> {
        Some(
            self.hook
                .decide(subject, session)
                .await
                .into_verdict::<C>(subject),
        )
    }

    fn name(&self) -> &'static str {
        "override"
    }
}

/// Credential store; only authoritative once it holds a user.
pub struct CredentialStrategy {
    stores: Arc<Stores>,
}

impl CredentialStrategy {
    #[must_use]
    pub const fn new(stores: Arc<Stores>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl Strategy<Authenticate> for CredentialStrategy {
    async fn evaluate(
        &self,
        subject: &<Authenticate as Checkpoint>::Subject,
        _session: &Session,
    ) -> Option<Verdict> {
        let credentials = &self.stores.credentials;
        if credentials.is_empty() {
            return None;
        }

        Some(
            if credentials.authenticate(&subject.username, &subject.secret) {
                Verdict::Allow(Grant::user(subject.username.clone()))
            } else {
                Verdict::Deny(Rejection::of::<Authenticate>(subject, None, None))
            },
        )
    }

    fn name(&self) -> &'static str {
        "credentials"
    }
}

/// Access rules; only authoritative once rules are installed.
pub struct AccessStrategy {
    stores: Arc<Stores>,
}

impl AccessStrategy {
    #[must_use]
    pub const fn new(stores: Arc<Stores>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl Strategy<Connect> for AccessStrategy {
    async fn evaluate(
        &self,
        subject: &<Connect as Checkpoint>::Subject,
        _session: &Session,
    ) -> Option<Verdict> {
        let rules = self.stores.access.current()?;

        Some(if rules.permits(subject.ip()) {
            Verdict::Allow(Grant::default())
        } else {
            Verdict::Deny(Rejection::of::<Connect>(subject, None, None))
        })
    }

    fn name(&self) -> &'static str {
        "access"
    }
}

/// Accepted recipient domains; only authoritative once a domain is added.
pub struct DomainStrategy {
    stores: Arc<Stores>,
}

impl DomainStrategy {
    #[must_use]
    pub const fn new(stores: Arc<Stores>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl Strategy<RcptTo> for DomainStrategy {
    async fn evaluate(
        &self,
        subject: &<RcptTo as Checkpoint>::Subject,
        _session: &Session,
    ) -> Option<Verdict> {
        let domains = &self.stores.domains;
        if domains.is_empty() {
            return None;
        }

        Some(if domains.accepts(&subject.address) {
            Verdict::Allow(Grant::default())
        } else {
            Verdict::Deny(Rejection::of::<RcptTo>(
                subject,
                Some(format!(
                    "Recipient address {subject} rejected: domain '{}' is not accepted here",
                    subject.domain()
                )),
                None,
            ))
        })
    }

    fn name(&self) -> &'static str {
        "domains"
    }
}

/// Fail-open default.
pub struct AllowAll;

#[async_trait]
impl<C: Checkpoint> Strategy<C> for AllowAll {
    async fn evaluate(&self, subject: &C::Subject, _session: &Session) -> Option<Verdict> {
        Some(Verdict::Allow(C::grant(subject)))
    }

    fn name(&self) -> &'static str {
        "default"
    }
}

/// Default for authenticate: accept the presented identity when
/// authentication is optional, refuse when it is mandatory and nothing
/// authoritative has been configured.
pub struct OptionalAuth {
    optional: bool,
}

impl OptionalAuth {
    #[must_use]
    pub const fn new(optional: bool) -> Self {
        Self { optional }
    }
}

#[async_trait]
impl Strategy<Authenticate> for OptionalAuth {
    async fn evaluate(
        &self,
        subject: &<Authenticate as Checkpoint>::Subject,
        _session: &Session,
    ) -> Option<Verdict> {
        Some(if self.optional {
            Verdict::Allow(Grant::user(subject.username.clone()))
        } else {
            Verdict::Deny(Rejection::of::<Authenticate>(
                subject,
                Some(format!(
                    "Authentication failed for user {}: no credentials are configured",
                    subject.username
                )),
                None,
            ))
        })
    }

    fn name(&self) -> &'static str {
        "default"
    }
}
