use std::sync::Arc;

use parking_lot::RwLock;

use super::{
    strategy::{
        AccessStrategy, AllowAll, CredentialStrategy, DomainStrategy, OptionalAuth,
        OverrideStrategy,
    },
    Authenticate, Chain, Checkpoint, Connect, MailFrom, Override, Overrides, RcptTo, Rejection,
    Verdict,
};
use crate::{
    config::Configuration,
    incoming, internal,
    session::{Address, Credentials, Session},
    status::Status,
    store::Stores,
};

/// Everything a configure call installs, swapped in as one unit.
pub(crate) struct Active {
    pub(crate) config: Arc<Configuration>,
    /// Stores the chains below read from
    pub(crate) stores: Arc<Stores>,
    authenticate: Chain<Authenticate>,
    connect: Chain<Connect>,
    mail_from: Chain<MailFrom>,
    rcpt_to: Chain<RcptTo>,
}

impl Active {
    pub(crate) fn build(config: Arc<Configuration>, overrides: Overrides, stores: &Arc<Stores>) -> Self {
        let authenticate = with_override::<Authenticate>(overrides.on_auth)
            .then(CredentialStrategy::new(Arc::clone(stores)))
            .then(OptionalAuth::new(config.admission.auth_optional));

        let connect = with_override::<Connect>(overrides.on_connect)
            .then(AccessStrategy::new(Arc::clone(stores)))
            .then(AllowAll);

        let mail_from = with_override::<MailFrom>(overrides.on_mail_from).then(AllowAll);

        let rcpt_to = with_override::<RcptTo>(overrides.on_rcpt_to)
            .then(DomainStrategy::new(Arc::clone(stores)))
            .then(AllowAll);

        internal!(
            "Checkpoint chains: authenticate={:?} connect={:?} mail-from={:?} rcpt-to={:?}",
            authenticate.names(),
            connect.names(),
            mail_from.names(),
            rcpt_to.names()
        );

        Self {
            config,
            stores: Arc::clone(stores),
            authenticate,
            connect,
            mail_from,
            rcpt_to,
        }
    }
}

fn with_override<C: Checkpoint>(hook: Option<Override<C::Subject>>) -> Chain<C> {
    let chain = Chain::new();
    match hook {
        Some(hook) => chain.then(OverrideStrategy::<C>::new(hook)),
        None => chain,
    }
}

fn not_configured<C: Checkpoint>(subject: &C::Subject) -> Verdict {
    Verdict::Deny(Rejection::of::<C>(
        subject,
        Some(String::from("Service not available: server is not configured")),
        Some(Status::Unavailable),
    ))
}

pub(crate) type ActiveSlot = Arc<RwLock<Option<Arc<Active>>>>;

/// Per-checkpoint arbitration.
///
/// Cheap to clone; every clone observes the latest configuration. Each
/// evaluation pins the configuration current when it started, so a
/// concurrent reconfigure never yields a half-applied policy.
#[derive(Clone)]
pub struct PolicyResolver {
    slot: ActiveSlot,
}

impl PolicyResolver {
    pub(crate) const fn new(slot: ActiveSlot) -> Self {
        Self { slot }
    }

    fn active(&self) -> Option<Arc<Active>> {
        self.slot.read().clone()
    }

    /// The configuration evaluations would currently use
    #[must_use]
    pub fn configuration(&self) -> Option<Arc<Configuration>> {
        self.active().map(|active| Arc::clone(&active.config))
    }

    #[tracing::instrument(level = "trace", skip_all, fields(session = %session.id))]
    pub async fn authenticate(&self, credentials: &Credentials, session: &Session) -> Verdict {
        incoming!(
            "[{}] AUTH {:?} {}",
            session.id,
            credentials.mechanism,
            credentials.username
        );

        match self.active() {
            Some(active) => active.authenticate.evaluate(credentials, session).await,
            None => not_configured::<Authenticate>(credentials),
        }
    }

    #[tracing::instrument(level = "trace", skip_all, fields(session = %session.id))]
    pub async fn connect(&self, session: &Session) -> Verdict {
        incoming!(
            level = INFO,
            "[{}] Connection from {}",
            session.id,
            session.remote_address
        );

        let peer = session.remote_address;
        match self.active() {
            Some(active) => active.connect.evaluate(&peer, session).await,
            None => not_configured::<Connect>(&peer),
        }
    }

    #[tracing::instrument(level = "trace", skip_all, fields(session = %session.id))]
    pub async fn mail_from(&self, address: &Address, session: &Session) -> Verdict {
        incoming!("[{}] MAIL FROM:{address}", session.id);

        match self.active() {
            Some(active) => active.mail_from.evaluate(address, session).await,
            None => not_configured::<MailFrom>(address),
        }
    }

    #[tracing::instrument(level = "trace", skip_all, fields(session = %session.id))]
    pub async fn rcpt_to(&self, address: &Address, session: &Session) -> Verdict {
        incoming!("[{}] RCPT TO:{address}", session.id);

        match self.active() {
            Some(active) => active.rcpt_to.evaluate(address, session).await,
            None => not_configured::<RcptTo>(address),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::Options, policy::CheckpointKind};

    fn session() -> Session {
        Session::new("203.0.113.5:41000".parse().unwrap())
    }

    fn configured(options: &Options, stores: &Arc<Stores>) -> PolicyResolver {
        let config = Arc::new(Configuration::from_options("test".into(), options).unwrap());
        let active = Active::build(config, options.overrides.clone(), stores);
        PolicyResolver::new(Arc::new(RwLock::new(Some(Arc::new(active)))))
    }

    #[tokio::test]
    async fn unconfigured_resolver_denies_everything() {
        let resolver = PolicyResolver::new(ActiveSlot::default());

        let verdict = resolver.connect(&session()).await;
        let rejection = verdict.rejection().unwrap();
        assert_eq!(rejection.status, Status::Unavailable);
        assert_eq!(rejection.checkpoint, CheckpointKind::Connect);

        assert!(!resolver
            .mail_from(&Address::new("a@example.com"), &session())
            .await
            .is_allowed());
        assert!(resolver.configuration().is_none());
    }

    #[tokio::test]
    async fn override_preempts_populated_store() {
        let stores = Arc::new(Stores::default());
        stores.domains.add_domain("example.com");

        let options = Options::new().on_rcpt_to(Override::predicate(|_: &Address, _: &Session| true));
        let resolver = configured(&options, &stores);

        assert!(resolver
            .rcpt_to(&Address::new("user@elsewhere.org"), &session())
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn store_is_consulted_without_override() {
        let stores = Arc::new(Stores::default());
        let resolver = configured(&Options::new(), &stores);

        assert!(resolver
            .rcpt_to(&Address::new("user@elsewhere.org"), &session())
            .await
            .is_allowed());

        // Visible to evaluations started after the mutation returns
        stores.domains.add_domain("example.com");

        assert!(!resolver
            .rcpt_to(&Address::new("user@elsewhere.org"), &session())
            .await
            .is_allowed());
        assert!(resolver
            .rcpt_to(&Address::new("user@example.com"), &session())
            .await
            .is_allowed());
    }
}
