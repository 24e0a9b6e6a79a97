//! TLS acceptor construction and PEM material loading.
//!
//! Builds the rustls server configuration from the configured certificate
//! chain and private key, optionally validating client certificates
//! against a CA bundle. ALPN is restricted to HTTP/1.1. Errors here are
//! surfaced as [`TlsError`] so the listener manager can skip the HTTPS
//! endpoints without taking the plaintext ones down.

use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pemfile::{certs, private_key};
use tokio_rustls::{rustls::ServerConfig, TlsAcceptor};
use tracing::debug;

use crate::config::TlsMaterial;
use crate::error::TlsError;

/// Builds the TLS acceptor for the configured material.
pub fn build_acceptor(material: &TlsMaterial) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(&material.cert)?;
    let key = load_key(&material.key, material.passphrase.is_some())?;

    let builder = match &material.ca {
        Some(ca_path) => {
            let roots = load_ca(ca_path)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| TlsError::BadCa {
                    path: ca_path.clone(),
                    reason: e.to_string(),
                })?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    let mut config = builder.with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Loads a PEM certificate chain.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_owned(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCerts {
            path: path.to_owned(),
        });
    }
    debug!(path = %path.display(), count = certs.len(), "loaded certificates");
    Ok(certs)
}

/// Loads a PEM private key. Keys that fail to parse while a passphrase is
/// configured are reported as encrypted; rustls-pemfile does not decrypt.
fn load_key(path: &Path, has_passphrase: bool) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    let key = private_key(&mut reader).map_err(|source| TlsError::Io {
        path: path.to_owned(),
        source,
    })?;
    match key {
        Some(key) => Ok(key),
        None if has_passphrase => Err(TlsError::EncryptedKey {
            path: path.to_owned(),
        }),
        None => Err(TlsError::NoKey {
            path: path.to_owned(),
        }),
    }
}

fn load_ca(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(|e| TlsError::BadCa {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
    }
    Ok(roots)
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_owned(),
            source,
        })
}
