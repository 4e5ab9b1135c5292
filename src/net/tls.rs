//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Load PEM certificate chains, private keys and client CA bundles
//! - Build the rustls server configuration, including client verification
//! - Advertise ALPN protocols for the enabled HTTP versions

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

use crate::config::{HttpVersion, TlsConfig};

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("invalid client CA bundle: {0}")]
    ClientVerifier(#[from] rustls::server::VerifierBuilderError),
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// ALPN identifiers for `versions`, `h2` first.
pub fn alpn_protocols(versions: &BTreeSet<HttpVersion>) -> Vec<Vec<u8>> {
    let mut protocols = Vec::new();
    if versions.contains(&HttpVersion::Http2) {
        protocols.push(ALPN_H2.to_vec());
    }
    if versions.contains(&HttpVersion::Http1) {
        protocols.push(ALPN_HTTP11.to_vec());
    }
    protocols
}

pub fn build_server_config(
    tls: &TlsConfig,
    versions: &BTreeSet<HttpVersion>,
) -> Result<rustls::ServerConfig, TlsError> {
    let provider = Arc::new(ring::default_provider());
    let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let builder = if let Some(verifier) = &tls.client_verifier {
        builder.with_client_cert_verifier(verifier.clone())
    } else if let Some(ca_path) = &tls.client_ca_path {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots.add(cert)?;
        }
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let certs = load_certs(&tls.cert_path)?;
    let key = load_private_key(&tls.key_path)?;
    let mut config = builder.with_single_cert(certs, key)?;
    config.alpn_protocols = alpn_protocols(versions);
    Ok(config)
}

pub fn build_acceptor(
    tls: &TlsConfig,
    versions: &BTreeSet<HttpVersion>,
) -> Result<TlsAcceptor, TlsError> {
    let config = build_server_config(tls, versions)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
