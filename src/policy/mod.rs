//! Admission decisions for the four protocol checkpoints.
//!
//! Every checkpoint is a marker type implementing [`Checkpoint`], which fixes
//! the subject being judged and the default wording of a denial. Overrides
//! and built-in stores produce [`Decision`]s or [`Verdict`]s; the
//! [`PolicyResolver`] arbitrates between them.

use std::{
    fmt::{self, Debug, Display},
    net::SocketAddr,
};

use serde::Serialize;
use thiserror::Error;

use crate::{
    session::{Address, Credentials},
    status::Status,
};

pub mod overrides;
pub mod resolver;
pub mod strategy;

pub use self::{
    overrides::{Completion, Override, Overrides},
    resolver::PolicyResolver,
    strategy::{Chain, Strategy},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointKind {
    Authenticate,
    Connect,
    MailFrom,
    RcptTo,
}

impl Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Authenticate => "authenticate",
            Self::Connect => "connect",
            Self::MailFrom => "mail-from",
            Self::RcptTo => "rcpt-to",
        })
    }
}

/// Data attached to an allow, such as the identity an authenticator resolved.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Grant {
    pub user: Option<String>,
}

impl Grant {
    #[must_use]
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
        }
    }
}

/// Why a checkpoint refused, and the reply class the engine should use.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize)]
#[error("{status} {reason} ({checkpoint})")]
pub struct Rejection {
    pub checkpoint: CheckpointKind,
    pub status: Status,
    pub reason: String,
}

impl Rejection {
    /// Denial of `subject` at checkpoint `C`, falling back to the
    /// checkpoint's own wording when `reason` is absent or blank.
    #[must_use]
    pub fn of<C: Checkpoint>(
        subject: &C::Subject,
        reason: Option<String>,
        status: Option<Status>,
    ) -> Self {
        Self {
            checkpoint: C::KIND,
            status: status.unwrap_or(C::DENIED),
            reason: reason
                .filter(|reason| !reason.trim().is_empty())
                .unwrap_or_else(|| C::denied(subject)),
        }
    }
}

/// Outcome of a checkpoint evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum Verdict {
    Allow(Grant),
    Deny(Rejection),
}

impl Verdict {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }

    #[must_use]
    pub const fn grant(&self) -> Option<&Grant> {
        match self {
            Self::Allow(grant) => Some(grant),
            Self::Deny(_) => None,
        }
    }

    #[must_use]
    pub const fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Allow(_) => None,
            Self::Deny(rejection) => Some(rejection),
        }
    }

    /// # Errors
    /// [`Error::AdmissionDenied`](crate::Error::AdmissionDenied) for a deny.
    pub fn into_result(self) -> crate::Result<Grant> {
        match self {
            Self::Allow(grant) => Ok(grant),
            Self::Deny(rejection) => Err(rejection.into()),
        }
    }
}

/// What an override answers.
///
/// Predicate overrides usually just return a `bool`; the conversions below
/// turn `true` into an allow and `false` into a deny with the checkpoint's
/// default message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow(Grant),
    Deny {
        reason: Option<String>,
        status: Option<Status>,
    },
}

impl Decision {
    #[must_use]
    pub fn allow() -> Self {
        Self::Allow(Grant::default())
    }

    #[must_use]
    pub fn allow_as(user: impl Into<String>) -> Self {
        Self::Allow(Grant::user(user))
    }

    #[must_use]
    pub const fn deny() -> Self {
        Self::Deny {
            reason: None,
            status: None,
        }
    }

    #[must_use]
    pub fn deny_with(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: Some(reason.into()),
            status: None,
        }
    }

    #[must_use]
    pub fn reject(status: Status, reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: Some(reason.into()),
            status: Some(status),
        }
    }

    /// Resolve into a verdict for `subject` at checkpoint `C`
    #[must_use]
    pub fn into_verdict<C: Checkpoint>(self, subject: &C::Subject) -> Verdict {
        match self {
            Self::Allow(grant) => Verdict::Allow(Grant {
                user: grant.user.or_else(|| C::grant(subject).user),
            }),
            Self::Deny { reason, status } => {
                Verdict::Deny(Rejection::of::<C>(subject, reason, status))
            }
        }
    }
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Self::allow()
        } else {
            Self::deny()
        }
    }
}

impl From<Grant> for Decision {
    fn from(grant: Grant) -> Self {
        Self::Allow(grant)
    }
}

impl From<Option<Grant>> for Decision {
    fn from(grant: Option<Grant>) -> Self {
        grant.map_or_else(Self::deny, Self::Allow)
    }
}

/// A protocol decision point.
pub trait Checkpoint: Send + Sync + 'static {
    /// What is being judged
    type Subject: Clone + Debug + Send + Sync + 'static;

    const KIND: CheckpointKind;

    /// Reply class for a denial that did not pick one
    const DENIED: Status;

    /// Wording for a denial that did not supply a reason
    fn denied(subject: &Self::Subject) -> String;

    /// Allow data implied by an unqualified allow
    fn grant(_subject: &Self::Subject) -> Grant {
        Grant::default()
    }
}

pub struct Authenticate;
pub struct Connect;
pub struct MailFrom;
pub struct RcptTo;

impl Checkpoint for Authenticate {
    type Subject = Credentials;

    const KIND: CheckpointKind = CheckpointKind::Authenticate;
    const DENIED: Status = Status::AuthFailed;

    fn denied(subject: &Self::Subject) -> String {
        format!("Authentication failed for user {}", subject.username)
    }

    fn grant(subject: &Self::Subject) -> Grant {
        Grant::user(subject.username.clone())
    }
}

impl Checkpoint for Connect {
    type Subject = SocketAddr;

    const KIND: CheckpointKind = CheckpointKind::Connect;
    const DENIED: Status = Status::TransactionFailed;

    fn denied(subject: &Self::Subject) -> String {
        format!("Connection from {} is not permitted", subject.ip())
    }
}

impl Checkpoint for MailFrom {
    type Subject = Address;

    const KIND: CheckpointKind = CheckpointKind::MailFrom;
    const DENIED: Status = Status::Error;

    fn denied(subject: &Self::Subject) -> String {
        format!("Sender address {subject} rejected")
    }
}

impl Checkpoint for RcptTo {
    type Subject = Address;

    const KIND: CheckpointKind = CheckpointKind::RcptTo;
    const DENIED: Status = Status::Error;

    fn denied(subject: &Self::Subject) -> String {
        format!("Recipient address {subject} rejected")
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn bool_decisions() {
        let subject = Address::new("user@example.com");

        assert_eq!(
            Decision::from(true).into_verdict::<MailFrom>(&subject),
            Verdict::Allow(Grant::default())
        );

        let verdict = Decision::from(false).into_verdict::<RcptTo>(&subject);
        let rejection = verdict.rejection().unwrap();
        assert_eq!(rejection.checkpoint, CheckpointKind::RcptTo);
        assert_eq!(rejection.status, Status::Error);
        assert_eq!(rejection.reason, "Recipient address <user@example.com> rejected");
    }

    #[test]
    fn blank_reason_uses_default() {
        let subject: SocketAddr = "192.0.2.1:2525".parse().unwrap();
        let verdict = Decision::deny_with("  ").into_verdict::<Connect>(&subject);

        assert_eq!(
            verdict.rejection().unwrap().reason,
            "Connection from 192.0.2.1 is not permitted"
        );
    }

    #[test]
    fn authenticate_grants_presented_identity() {
        let subject = Credentials::plain("alice", "s3cret");

        assert_eq!(
            Decision::allow().into_verdict::<Authenticate>(&subject),
            Verdict::Allow(Grant::user("alice"))
        );
        assert_eq!(
            Decision::allow_as("alice@example.com").into_verdict::<Authenticate>(&subject),
            Verdict::Allow(Grant::user("alice@example.com"))
        );
    }

    #[test]
    fn custom_status_is_kept() {
        let subject = Address::new("spam@example.net");
        let verdict =
            Decision::reject(Status::ActionUnavailable, "Try later").into_verdict::<MailFrom>(&subject);

        let rejection = verdict.rejection().unwrap();
        assert_eq!(rejection.status, Status::ActionUnavailable);
        assert_eq!(rejection.reason, "Try later");
        assert!(matches!(
            verdict.into_result(),
            Err(crate::Error::AdmissionDenied(_))
        ));
    }
}
