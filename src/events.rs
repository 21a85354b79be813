//! Outbound notifications.
//!
//! The lifecycle controller reports transitions, received messages and
//! faults through an [`EventSink`] injected at construction. Sinks are pure
//! consumers: nothing they do feeds back into the controller.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};

use crate::{config::Snapshot, error::Error, internal, message::DecodedMessage, session::Session};

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "server:starting")]
    Starting(Snapshot),
    #[serde(rename = "server:started")]
    Started(Snapshot),
    #[serde(rename = "server:error")]
    Error(ErrorReport),
    #[serde(rename = "server:message")]
    Message(MessageReceived),
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Starting(_) => "server:starting",
            Self::Started(_) => "server:started",
            Self::Error(_) => "server:error",
            Self::Message(_) => "server:message",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    /// Id of the server that raised the error
    pub source: Arc<str>,
    pub kind: &'static str,
    pub message: String,
}

impl ErrorReport {
    #[must_use]
    pub fn new(source: Arc<str>, error: &Error) -> Self {
        Self {
            source,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MessageReceived {
    /// Id of the server that accepted the message
    pub source: Arc<str>,
    pub message: DecodedMessage,
    pub session: Session,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Writes one log line per event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match &event {
            Event::Starting(snapshot) | Event::Started(snapshot) => internal!(
                level = INFO,
                "{} [{}] {} on {}:{}",
                event.name(),
                snapshot.id,
                snapshot.mode,
                snapshot.host,
                snapshot.port
            ),
            Event::Error(report) => internal!(
                level = ERROR,
                "{} [{}] {}: {}",
                event.name(),
                report.source,
                report.kind,
                report.message
            ),
            Event::Message(received) => internal!(
                level = INFO,
                "{} [{}] session={} from={} subject={:?} size={}",
                event.name(),
                received.source,
                received.session.id,
                received.session.remote_address,
                received.message.subject,
                received.message.size
            ),
        }
    }
}

/// Fans events out to any number of subscribers.
///
/// Slow subscribers lag and lose the oldest events; emitting never blocks.
#[derive(Clone, Debug)]
pub struct BroadcastSink {
    sender: broadcast::Sender<Event>,
}

impl BroadcastSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: Event) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

/// Records every event it is given
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Event>>>,
    notify: Arc<Notify>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Names of the recorded events, in emission order
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(Event::name).collect()
    }

    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.name() == name)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Wait until at least `expected` events have been recorded
    pub async fn wait_for_count(&self, expected: usize) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.events.lock().len() >= expected {
                return;
            }
            notified.await;
        }
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::Mode;

    fn snapshot() -> Snapshot {
        Snapshot {
            id: "01SERVER".into(),
            port: 2525,
            host: String::from("127.0.0.1"),
            mode: Mode::Smtp,
        }
    }

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.emit(Event::Starting(snapshot()));
        sink.emit(Event::Started(snapshot()));

        assert_eq!(sink.names(), vec!["server:starting", "server:started"]);
        assert_eq!(sink.count("server:started"), 1);
        assert_eq!(sink.count("server:error"), 0);

        sink.clear();
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn broadcast_sink_fans_out() {
        let sink = BroadcastSink::new(8);
        let mut first = sink.subscribe();
        let mut second = sink.subscribe();

        sink.emit(Event::Error(ErrorReport::new(
            "01SERVER".into(),
            &Error::Transport(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        )));

        for receiver in [&mut first, &mut second] {
            let event = receiver.recv().await.unwrap();
            let Event::Error(report) = &event else {
                panic!("Expected an error event, got {event:?}");
            };
            assert_eq!(report.kind, "transport");
            assert_eq!(&*report.source, "01SERVER");
        }
    }

    #[test]
    fn broadcast_without_subscribers() {
        BroadcastSink::default().emit(Event::Started(snapshot()));
    }

    #[tokio::test]
    async fn wait_for_count_returns_once_recorded() {
        let sink = MemorySink::new();
        let waiter = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.wait_for_count(2).await })
        };

        sink.emit(Event::Starting(snapshot()));
        sink.emit(Event::Started(snapshot()));

        waiter.await.unwrap();
        assert_eq!(sink.events().len(), 2);
    }
}
