//! Caller supplied decision functions.
//!
//! An override comes in one of two declared shapes:
//!
//! - [`Override::Predicate`] answers synchronously with a [`Decision`].
//! - [`Override::Continuation`] receives a [`Completion`] handle and answers
//!   whenever it is ready, e.g. after a database or network lookup. The
//!   handle is consumed by answering, so it can only be used once. Dropping
//!   it unanswered denies the operation.
//!
//! The shape is chosen when the override is registered; nothing is inferred
//! from the function itself.

use std::{
    fmt::{self, Debug},
    net::SocketAddr,
    sync::Arc,
};

use tokio::sync::oneshot;

use super::Decision;
use crate::session::{Address, Credentials, Session};

pub type PredicateFn<S> = dyn Fn(&S, &Session) -> Decision + Send + Sync;
pub type ContinuationFn<S> = dyn Fn(S, Session, Completion) + Send + Sync;

pub enum Override<S> {
    Predicate(Arc<PredicateFn<S>>),
    Continuation(Arc<ContinuationFn<S>>),
}

impl<S: 'static> Override<S> {
    /// Register a synchronous override.
    ///
    /// ```
    /// use skyfall_smtp::{policy::Override, session::Address};
    ///
    /// let no_bounces = Override::<Address>::predicate(|from, _session| !from.address.is_empty());
    /// ```
    pub fn predicate<F, D>(predicate: F) -> Self
    where
        F: Fn(&S, &Session) -> D + Send + Sync + 'static,
        D: Into<Decision>,
    {
        Self::Predicate(Arc::new(move |subject: &S, session: &Session| {
            predicate(subject, session).into()
        }))
    }

    /// Register an override that answers through a [`Completion`].
    pub fn continuation<F>(continuation: F) -> Self
    where
        F: Fn(S, Session, Completion) + Send + Sync + 'static,
    {
        Self::Continuation(Arc::new(continuation))
    }

    pub(crate) async fn decide(&self, subject: &S, session: &Session) -> Decision
    where
        S: Clone,
    {
        match self {
            Self::Predicate(predicate) => predicate(subject, session),
            Self::Continuation(continuation) => {
                let (completion, answer) = Completion::channel();
                continuation(subject.clone(), session.clone(), completion);

                answer.await.unwrap_or_else(|_| {
                    Decision::deny_with("Policy check ended without a decision")
                })
            }
        }
    }
}

impl<S> Clone for Override<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Predicate(predicate) => Self::Predicate(Arc::clone(predicate)),
            Self::Continuation(continuation) => Self::Continuation(Arc::clone(continuation)),
        }
    }
}

impl<S> Debug for Override<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Predicate(_) => "Override::Predicate",
            Self::Continuation(_) => "Override::Continuation",
        })
    }
}

/// One-shot answer channel handed to continuation overrides.
#[derive(Debug)]
pub struct Completion {
    sender: oneshot::Sender<Decision>,
}

impl Completion {
    fn channel() -> (Self, oneshot::Receiver<Decision>) {
        let (sender, receiver) = oneshot::channel();
        (Self { sender }, receiver)
    }

    pub fn complete(self, decision: impl Into<Decision>) {
        // The evaluation may have been abandoned by the engine in the meantime
        let _ = self.sender.send(decision.into());
    }

    pub fn allow(self) {
        self.complete(Decision::allow());
    }

    pub fn allow_as(self, user: impl Into<String>) {
        self.complete(Decision::allow_as(user));
    }

    pub fn deny(self) {
        self.complete(Decision::deny());
    }

    pub fn deny_with(self, reason: impl Into<String>) {
        self.complete(Decision::deny_with(reason));
    }
}

/// Per-checkpoint overrides captured at configure time.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub on_auth: Option<Override<Credentials>>,
    pub on_connect: Option<Override<SocketAddr>>,
    pub on_mail_from: Option<Override<Address>>,
    pub on_rcpt_to: Option<Override<Address>>,
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn session() -> Session {
        Session::new("192.0.2.7:40000".parse().unwrap())
    }

    #[tokio::test]
    async fn predicate_answers_synchronously() {
        let hook = Override::<Address>::predicate(|from, _| from.address.ends_with("@example.com"));

        assert_eq!(
            hook.decide(&Address::new("a@example.com"), &session()).await,
            Decision::allow()
        );
        assert_eq!(
            hook.decide(&Address::new("a@example.net"), &session()).await,
            Decision::deny()
        );
    }

    #[tokio::test]
    async fn continuation_answers_later() {
        let hook = Override::<Credentials>::continuation(|creds, _, completion| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                completion.allow_as(format!("{}@example.com", creds.username));
            });
        });

        assert_eq!(
            hook.decide(&Credentials::plain("alice", "x"), &session()).await,
            Decision::allow_as("alice@example.com")
        );
    }

    #[tokio::test]
    async fn dropped_completion_denies() {
        let hook = Override::<Address>::continuation(|_, _, completion| drop(completion));

        assert!(matches!(
            hook.decide(&Address::new("a@example.com"), &session()).await,
            Decision::Deny { reason: Some(_), .. }
        ));
    }
}
