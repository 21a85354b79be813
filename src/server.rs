//! Lifecycle controller.
//!
//! A [`Server`] moves through [`State`]s as it is configured and started:
//!
//! ```text
//! Unconfigured --configure--> Configured --start--> Starting --bind ok--> Listening
//!                                 ^  ^                  |
//!                                 |  +----configure---- Failed <--bind failed
//!                                 +-----------------------------------------+
//!                                             (Listening handle dropped)
//! ```
//!
//! Reconfiguring is allowed in every state except `Starting` and
//! `Listening`. The store mutators may be used at any time.
//!
//! Users, domains and access rules listed in [`Options`] belong to the
//! configuration that named them and are dropped by the next configure.
//! Entries added through [`Server::add_user`] and the other mutators persist
//! across reconfigures.

use std::{
    fmt::{self, Display},
    io,
    net::SocketAddr,
    sync::Arc,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use ulid::Ulid;

use crate::{
    config::{Configuration, Options, Snapshot},
    error::{ConfigError, Error},
    events::{ErrorReport, Event, EventSink, MessageReceived},
    internal,
    message::{Decoder, MailparseDecoder},
    policy::{
        resolver::{Active, ActiveSlot},
        PolicyResolver,
    },
    session::Session,
    store::{AccessRules, Domain, Stores},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Unconfigured,
    Configured,
    Starting,
    Listening,
    Failed,
}

impl State {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Configured => "configured",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Failed => "failed",
        }
    }
}

impl Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Server {
    id: Arc<str>,
    sink: Arc<dyn EventSink>,
    decoder: Arc<dyn Decoder>,
    /// Entries added through the mutators, carried into every configuration
    runtime: Stores,
    state: Arc<Mutex<State>>,
    active: ActiveSlot,
}

impl Server {
    #[must_use]
    pub fn new(sink: impl EventSink + 'static) -> Self {
        Self {
            id: Ulid::new().to_string().into(),
            sink: Arc::new(sink),
            decoder: Arc::new(MailparseDecoder),
            runtime: Stores::default(),
            state: Arc::new(Mutex::new(State::Unconfigured)),
            active: ActiveSlot::default(),
        }
    }

    /// Replace the message decoder used by [`Server::receive`]
    #[must_use]
    pub fn with_decoder(mut self, decoder: impl Decoder + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Identifier carried as the source of every event this server emits
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> State {
        *self.state.lock()
    }

    /// The active configuration, if any
    #[must_use]
    pub fn configuration(&self) -> Option<Arc<Configuration>> {
        self.active
            .read()
            .as_ref()
            .map(|active| Arc::clone(&active.config))
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.configuration().map(|config| config.snapshot())
    }

    /// Install a new configuration and override table.
    ///
    /// The stores for the new configuration start from the entries added
    /// through the mutators, then take the users, domains and `access` policy
    /// listed in `options`. Configuration, overrides and stores are swapped
    /// in as one unit; evaluations already running finish against the
    /// previous one.
    ///
    /// # Errors
    /// [`ConfigError::Reconfigure`] while starting or listening, or any error
    /// resolving `options`. Nothing changes on error.
    pub fn configure(&self, options: Options) -> crate::Result<Snapshot> {
        let mut state = self.state.lock();

        if matches!(*state, State::Starting | State::Listening) {
            return Err(ConfigError::Reconfigure(state.as_str()).into());
        }

        let config = Arc::new(Configuration::from_options(
            Arc::clone(&self.id),
            &options,
        )?);

        // Mutators hold the read side while they write, so none can land
        // between seeding these stores and installing them
        let mut slot = self.active.write();
        let stores = Arc::new(self.runtime.clone());

        for (username, secret) in options.users {
            stores.credentials.add_user(username, secret);
        }

        for domain in options.domains {
            stores.domains.add_domain(domain);
        }

        if let Some(access) = options.access {
            stores.access.replace(access);
        }

        *slot = Some(Arc::new(Active::build(
            Arc::clone(&config),
            options.overrides,
            &stores,
        )));
        drop(slot);
        *state = State::Configured;

        let snapshot = config.snapshot();
        internal!(
            level = INFO,
            "[{}] Configured {} listener {} on {}:{}",
            self.id,
            snapshot.mode,
            config.name,
            snapshot.host,
            snapshot.port
        );

        Ok(snapshot)
    }

    /// Bind the listener for the active configuration.
    ///
    /// Emits `server:starting` before binding, then `server:started` or
    /// `server:error` depending on the outcome.
    ///
    /// # Errors
    /// [`ConfigError::NotConfigured`] before any configure call (reported as
    /// `server:error`), [`ConfigError::AlreadyStarted`] while starting or
    /// listening, or [`Error::Bind`] when the address cannot be bound.
    #[tracing::instrument(level = "trace", skip_all, fields(server = %self.id))]
    pub async fn start(&self) -> crate::Result<Listening> {
        let active = {
            let mut state = self.state.lock();

            match *state {
                State::Starting | State::Listening => {
                    return Err(ConfigError::AlreadyStarted.into());
                }
                State::Unconfigured => None,
                State::Configured | State::Failed => {
                    let active = self.active.read().clone();
                    if active.is_some() {
                        *state = State::Starting;
                    }
                    active
                }
            }
        };

        let Some(active) = active else {
            let err = Error::from(ConfigError::NotConfigured);
            self.report_error(&err);
            return Err(err);
        };

        let config = Arc::clone(&active.config);
        let snapshot = config.snapshot();
        let address = config.address();

        self.sink.emit(Event::Starting(snapshot.clone()));
        internal!("[{}] Binding {}", self.id, address);

        let bound = match TcpListener::bind(address.as_str()).await {
            Ok(listener) => listener
                .local_addr()
                .map(|local_addr| (listener, local_addr)),
            Err(err) => Err(err),
        };

        match bound {
            Ok((listener, local_addr)) => {
                *self.state.lock() = State::Listening;
                internal!(level = INFO, "[{}] Listening on {}", self.id, local_addr);
                self.sink.emit(Event::Started(snapshot));

                Ok(Listening {
                    listener,
                    local_addr,
                    secure: config.secure,
                    tls: config.tls.as_ref().map(|tls| tls.acceptor()),
                    resolver: PolicyResolver::new(Arc::clone(&self.active)),
                    id: Arc::clone(&self.id),
                    sink: Arc::clone(&self.sink),
                    state: Arc::clone(&self.state),
                })
            }
            Err(source) => {
                *self.state.lock() = State::Failed;
                let err = Error::Bind { address, source };
                self.report_error(&err);
                Err(err)
            }
        }
    }

    /// A resolver bound to this server's configuration and stores.
    ///
    /// # Errors
    /// [`ConfigError::NotConfigured`] before any configure call.
    pub fn resolver(&self) -> crate::Result<PolicyResolver> {
        if self.active.read().is_none() {
            return Err(ConfigError::NotConfigured.into());
        }

        Ok(PolicyResolver::new(Arc::clone(&self.active)))
    }

    pub fn add_user(&self, username: impl Into<String>, secret: impl Into<String>) {
        let (username, secret) = (username.into(), secret.into());
        self.mutate(|stores| stores.credentials.add_user(username.clone(), secret.clone()));
    }

    pub fn add_domain(&self, domain: impl Into<Domain>) {
        let domain = domain.into();
        self.mutate(|stores| stores.domains.add_domain(domain.clone()));
    }

    pub fn set_access_policy(&self, rules: impl AccessRules + 'static) {
        let rules: Arc<dyn AccessRules> = Arc::new(rules);
        self.mutate(|stores| stores.access.replace_shared(Arc::clone(&rules)));
    }

    pub fn clear_access_policy(&self) {
        self.mutate(|stores| stores.access.clear());
    }

    /// Number of users the active configuration authenticates against
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.active.read().as_ref().map_or_else(
            || self.runtime.credentials.len(),
            |active| active.stores.credentials.len(),
        )
    }

    /// Apply a store change to the active configuration and to the entries
    /// carried into later ones
    fn mutate(&self, apply: impl Fn(&Stores)) {
        let active = self.active.read();
        if let Some(active) = active.as_ref() {
            apply(&active.stores);
        }
        apply(&self.runtime);
    }

    /// Decode a completed message and emit it as `server:message`.
    ///
    /// # Errors
    /// [`Error::Decode`] if the decoder rejects `raw`; no event is emitted.
    pub fn receive(&self, raw: &[u8], session: &Session) -> crate::Result<()> {
        let message = self.decoder.decode(raw).map_err(|err| {
            internal!(
                level = WARN,
                "[{}] Unable to decode message from {}: {err}",
                session.id,
                session.remote_address
            );
            err
        })?;

        internal!(
            "[{}] Received {} byte message from {}",
            session.id,
            message.size,
            session.remote_address
        );

        self.sink.emit(Event::Message(MessageReceived {
            source: Arc::clone(&self.id),
            message,
            session: session.clone(),
        }));

        Ok(())
    }

    /// Surface a fault that is not tied to a checkpoint as `server:error`
    pub fn report_error(&self, error: &Error) {
        report(&self.id, self.sink.as_ref(), error);
    }
}

fn report(id: &Arc<str>, sink: &dyn EventSink, error: &Error) {
    internal!(level = ERROR, "[{id}] {error}");
    sink.emit(Event::Error(ErrorReport::new(Arc::clone(id), error)));
}

/// A bound listener, handed to the protocol engine.
///
/// Dropping it closes the socket and returns the server to `Configured`.
pub struct Listening {
    listener: TcpListener,
    local_addr: SocketAddr,
    secure: bool,
    tls: Option<TlsAcceptor>,
    resolver: PolicyResolver,
    id: Arc<str>,
    sink: Arc<dyn EventSink>,
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for Listening {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listening")
            .field("local_addr", &self.local_addr)
            .field("secure", &self.secure)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Listening {
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn resolver(&self) -> PolicyResolver {
        self.resolver.clone()
    }

    /// Acceptor for implicit TLS or STARTTLS, when TLS material is configured
    #[must_use]
    pub fn tls(&self) -> Option<TlsAcceptor> {
        self.tls.clone()
    }

    /// Wait for the next connection. Accept faults are also reported as
    /// `server:error`.
    ///
    /// # Errors
    /// [`Error::Transport`] if accepting fails.
    pub async fn accept(&self) -> crate::Result<(TcpStream, Session)> {
        self.admit(self.listener.accept().await)
    }

    fn admit(
        &self,
        accepted: io::Result<(TcpStream, SocketAddr)>,
    ) -> crate::Result<(TcpStream, Session)> {
        match accepted {
            Ok((stream, peer)) => Ok((stream, Session::new(peer).with_secure(self.secure))),
            Err(source) => {
                let err = Error::Transport(source);
                report(&self.id, self.sink.as_ref(), &err);
                Err(err)
            }
        }
    }
}

impl Drop for Listening {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if *state == State::Listening {
            *state = State::Configured;
            internal!(level = INFO, "[{}] Stopped listening on {}", self.id, self.local_addr);
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::events::MemorySink;

    fn local() -> Options {
        Options::new().with_host("127.0.0.1").with_port(0)
    }

    #[test]
    fn state_display() {
        assert_eq!(State::Unconfigured.to_string(), "unconfigured");
        assert_eq!(State::Listening.to_string(), "listening");
    }

    #[test]
    fn configure_swaps_configuration() {
        let server = Server::new(MemorySink::new());
        assert_eq!(server.state(), State::Unconfigured);
        assert!(server.snapshot().is_none());
        assert!(server.resolver().is_err());

        server.configure(local().with_port(2525)).unwrap();
        let snapshot = server.configure(local().with_port(2626).with_lmtp(true)).unwrap();

        assert_eq!(server.state(), State::Configured);
        assert_eq!(server.snapshot(), Some(snapshot.clone()));
        assert_eq!(snapshot.port, 2626);
        assert_eq!(&*snapshot.id, server.id());
    }

    #[test]
    fn failed_configure_changes_nothing() {
        let server = Server::new(MemorySink::new());
        server.configure(local().with_port(2525)).unwrap();

        let err = server
            .configure(local().with_port(2626).with_user("alice", "s3cret").with_secure(true))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigError::MissingField(_))
        ));

        assert_eq!(server.snapshot().map(|s| s.port), Some(2525));
        assert_eq!(server.user_count(), 0);
    }

    #[tokio::test]
    async fn reconfigure_drops_entries_from_previous_options() {
        use crate::{
            policy::{CheckpointKind, Verdict},
            session::Credentials,
            store::{AccessPolicy, Action},
        };

        let server = Server::new(MemorySink::new());
        server
            .configure(
                local()
                    .with_user("alice", "s3cret")
                    .with_domain("example.com")
                    .with_access(AccessPolicy::new().with_default(Action::Deny)),
            )
            .unwrap();

        let resolver = server.resolver().unwrap();
        let session = Session::new("192.0.2.1:40000".parse().unwrap());
        let verdict = resolver.connect(&session).await;
        assert_eq!(
            verdict.rejection().map(|r| r.checkpoint),
            Some(CheckpointKind::Connect)
        );
        assert_eq!(server.user_count(), 1);

        server.configure(local().with_port(2626)).unwrap();

        assert_eq!(server.user_count(), 0);
        assert!(resolver.connect(&session).await.is_allowed());
        assert!(matches!(
            resolver
                .authenticate(&Credentials::plain("bob", "anything"), &session)
                .await,
            Verdict::Allow(_)
        ));
        assert!(resolver
            .rcpt_to(&crate::session::Address::new("user@example.org"), &session)
            .await
            .is_allowed());
    }

    #[tokio::test]
    async fn mutator_entries_survive_reconfigure() {
        use crate::{session::Credentials, store::AccessPolicy};

        let server = Server::new(MemorySink::new());
        server.add_user("carol", "before");
        server.configure(local().with_user("alice", "s3cret")).unwrap();
        server.add_user("dave", "after");
        server.set_access_policy(AccessPolicy::new().deny("198.51.100.0/24".parse().unwrap()));
        assert_eq!(server.user_count(), 3);

        server.configure(local()).unwrap();
        assert_eq!(server.user_count(), 2);

        let resolver = server.resolver().unwrap();
        let session = Session::new("198.51.100.9:40000".parse().unwrap());
        for (username, secret) in [("carol", "before"), ("dave", "after")] {
            assert!(resolver
                .authenticate(&Credentials::plain(username, secret), &session)
                .await
                .is_allowed());
        }
        assert!(!resolver
            .authenticate(&Credentials::plain("alice", "s3cret"), &session)
            .await
            .is_allowed());
        assert!(!resolver.connect(&session).await.is_allowed());

        server.clear_access_policy();
        server.configure(local()).unwrap();
        assert!(resolver.connect(&session).await.is_allowed());
    }

    #[tokio::test]
    async fn accept_fault_is_reported() {
        let sink = MemorySink::new();
        let server = Server::new(sink.clone());
        server.configure(local()).unwrap();
        let listening = server.start().await.unwrap();
        sink.clear();

        let err = listening
            .admit(Err(io::Error::other("too many open files")))
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));

        let events = sink.events();
        let [Event::Error(report)] = events.as_slice() else {
            panic!("Expected a single error event, got {events:?}");
        };
        assert_eq!(report.kind, "transport");
        assert!(report.message.contains("too many open files"));
        assert_eq!(&*report.source, server.id());
        assert_eq!(server.state(), State::Listening);
    }

    #[tokio::test]
    async fn reconfigure_while_listening_is_rejected() {
        let sink = MemorySink::new();
        let server = Server::new(sink.clone());
        server.configure(local()).unwrap();

        let listening = server.start().await.unwrap();
        assert_eq!(server.state(), State::Listening);

        let err = server.configure(local().with_lmtp(true)).unwrap_err();
        assert!(err.is_usage_error());
        assert!(matches!(
            err,
            Error::Configuration(ConfigError::Reconfigure("listening"))
        ));

        let err = server.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigError::AlreadyStarted)
        ));

        drop(listening);
        assert_eq!(server.state(), State::Configured);
        server.configure(local().with_lmtp(true)).unwrap();
    }

    #[tokio::test]
    async fn receive_attaches_source() {
        let sink = MemorySink::new();
        let server = Server::new(sink.clone());
        let session = Session::new("192.0.2.10:40000".parse().unwrap());

        server
            .receive(b"Subject: hi\r\n\r\nbody\r\n", &session)
            .unwrap();

        let events = sink.events();
        let [Event::Message(received)] = events.as_slice() else {
            panic!("Expected a single message event, got {events:?}");
        };
        assert_eq!(&*received.source, server.id());
        assert_eq!(received.session, session);
    }
}
