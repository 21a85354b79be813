use core::fmt::{self, Display, Formatter};

use serde::Serialize;

/// SMTP reply codes the core attaches to its verdicts.
///
/// The protocol engine owns the wire format; these only tell it which
/// class of reply a rejection maps to.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug, Serialize)]
#[serde(into = "u32")]
pub enum Status {
    Unavailable = 421,
    ActionUnavailable = 451,
    AuthFailed = 535,
    Error = 550,
    TransactionFailed = 554,
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        value as Self
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", u32::from(*self))
    }
}

#[cfg(test)]
mod test {
    use super::Status;

    #[test]
    fn display() {
        assert_eq!(Status::Error.to_string(), "550");
        assert_eq!(Status::Unavailable.to_string(), "421");
    }

    #[test]
    fn serializes_as_code() {
        assert_eq!(u32::from(Status::AuthFailed), 535);
        assert_eq!(u32::from(Status::TransactionFailed), 554);
    }
}
