use std::{
    fmt::{self, Debug},
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer},
        ServerConfig,
    },
    TlsAcceptor,
};

use crate::{error::TlsError, internal};

/// Certificate and key loaded at configure time, ready to hand to the
/// protocol engine for implicit TLS or STARTTLS.
#[derive(Clone)]
pub struct TlsMaterial {
    pub certificate: PathBuf,
    pub key: PathBuf,
    acceptor: TlsAcceptor,
}

impl TlsMaterial {
    /// Load a PEM certificate chain and private key.
    ///
    /// # Errors
    /// If either file cannot be read, holds nothing usable, or the pair is
    /// rejected by rustls.
    pub fn load(certificate: &Path, key: &Path) -> Result<Self, TlsError> {
        internal!(
            "Loading TLS certificate {} and key {}",
            certificate.display(),
            key.display()
        );

        let certs = load_certs(certificate)?;
        let key_der = load_key(key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key_der)?;

        Ok(Self {
            certificate: certificate.to_path_buf(),
            key: key.to_path_buf(),
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    #[must_use]
    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }
}

impl Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("certificate", &self.certificate)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certificate_load = |source| TlsError::CertificateLoad {
        path: path.display().to_string(),
        source,
    };

    let file = File::open(path).map_err(certificate_load)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(certificate_load)?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates {
            path: path.display().to_string(),
        });
    }

    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let key_load = |reason: String| TlsError::KeyLoad {
        path: path.display().to_string(),
        reason,
    };

    let file = File::open(path).map_err(|e| key_load(e.to_string()))?;

    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| key_load(e.to_string()))?
        .ok_or_else(|| {
            key_load(String::from(
                "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)",
            ))
        })
}
