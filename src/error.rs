//! Error types for the admission core.
//!
//! Admission denials are ordinary outcomes of a checkpoint and are carried in
//! a [`Verdict`](crate::policy::Verdict); they only become an [`Error`] when a
//! caller asks for one via [`Verdict::into_result`](crate::policy::Verdict::into_result).
//! None of these errors are fatal to the process.

use std::io;

use thiserror::Error;

use crate::policy::Rejection;

/// Top level error surfaced by the lifecycle controller and the message path.
#[derive(Debug, Error)]
pub enum Error {
    /// A checkpoint rejected the operation.
    #[error("Admission denied: {0}")]
    AdmissionDenied(#[from] Rejection),

    /// The server was used before it was configured, or configured badly.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// The listening socket could not be acquired.
    #[error("Failed to bind listener to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The message body could not be decoded.
    #[error("Failed to decode message: {0}")]
    Decode(#[from] DecodeError),

    /// A fault on an accepted or accepting socket.
    #[error("Transport error: {0}")]
    Transport(#[source] io::Error),
}

impl Error {
    /// Short, stable name of the error class, used in error events.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AdmissionDenied(_) => "admission",
            Self::Configuration(_) => "configuration",
            Self::Bind { .. } => "bind",
            Self::Decode(_) => "decode",
            Self::Transport(_) => "transport",
        }
    }

    /// Returns `true` if the error is caused by calling the API out of order.
    #[must_use]
    pub const fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(
                ConfigError::NotConfigured
                    | ConfigError::AlreadyStarted
                    | ConfigError::Reconfigure(_)
            )
        )
    }
}

/// Errors raised while building or applying a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `start` was called before `configure`.
    #[error("Server has not been configured")]
    NotConfigured,

    /// `start` was called while a listener is starting or already listening.
    #[error("Server has already been started")]
    AlreadyStarted,

    /// `configure` was called while the listener is active.
    #[error("Cannot reconfigure while the server is {0}")]
    Reconfigure(&'static str),

    /// A required configuration field is missing.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A configuration value is invalid.
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// An access rule could not be parsed as an address or network.
    #[error("Invalid network '{network}': {reason}")]
    InvalidNetwork { network: String, reason: String },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("Unable to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unable to read configuration: {0}")]
    Io(#[from] io::Error),
}

/// Errors that can occur while loading TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Failed to load TLS certificate.
    #[error("Failed to load TLS certificate from {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The certificate file held no certificates.
    #[error("No certificates found in {path}")]
    NoCertificates { path: String },

    /// Failed to load TLS private key.
    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// Rustls library error.
    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Errors produced by a message [`Decoder`](crate::message::Decoder).
#[derive(Debug, Error)]
pub enum DecodeError {
    /// No data was received.
    #[error("Message is empty")]
    Empty,

    /// The data could not be parsed as a message.
    #[error("Malformed message: {0}")]
    Malformed(String),
}

impl From<mailparse::MailParseError> for DecodeError {
    fn from(err: mailparse::MailParseError) -> Self {
        Self::Malformed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::error::Error as StdError;

    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingField("certificate");
        assert_eq!(err.to_string(), "Missing required field: certificate");

        let err = ConfigError::InvalidConfiguration {
            field: "host".to_string(),
            reason: "must not be empty".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid configuration for host: must not be empty"
        );
    }

    #[test]
    fn test_usage_errors() {
        assert!(Error::from(ConfigError::NotConfigured).is_usage_error());
        assert!(Error::from(ConfigError::AlreadyStarted).is_usage_error());
        assert!(Error::from(ConfigError::Reconfigure("listening")).is_usage_error());
        assert!(!Error::from(ConfigError::MissingField("key")).is_usage_error());
        assert!(!Error::from(DecodeError::Empty).is_usage_error());
    }

    #[test]
    fn test_bind_error_source_chain() {
        let err = Error::Bind {
            address: "0.0.0.0:25".to_string(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "access denied"),
        };

        assert!(err.source().is_some());
        assert_eq!(err.kind(), "bind");
        assert_eq!(
            err.to_string(),
            "Failed to bind listener to 0.0.0.0:25: access denied"
        );
    }

    #[test]
    fn test_tls_error_display() {
        let err = TlsError::KeyLoad {
            path: "/path/to/key.pem".to_string(),
            reason: "invalid format".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to load TLS private key from /path/to/key.pem: invalid format"
        );
    }
}
