//! Shared fixtures for the integration tests

#![allow(dead_code)]

use skyfall_smtp::{
    config::Options,
    events::MemorySink,
    policy::PolicyResolver,
    server::Server,
    session::Session,
};

/// Options bound to an ephemeral loopback port
pub fn local() -> Options {
    Options::new().with_host("127.0.0.1").with_port(0)
}

pub fn session(remote: &str) -> Session {
    Session::new(remote.parse().expect("valid socket address"))
}

/// A configured server, the sink it reports to, and its resolver
pub fn configured(options: Options) -> (Server, MemorySink, PolicyResolver) {
    let sink = MemorySink::new();
    let server = Server::new(sink.clone());

    server.configure(options).expect("configure succeeds");
    let resolver = server.resolver().expect("configured server has a resolver");

    (server, sink, resolver)
}
