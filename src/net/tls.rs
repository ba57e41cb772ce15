//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Load the certificate chain and private key (PEM) once at startup
//! - Restrict the protocol-version set and cipher suites per config
//! - Produce the shared, read-only acceptor used by every connection

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, SupportedProtocolVersion};
use tokio_rustls::TlsAcceptor;

use crate::config::{TlsConfig, TlsVersion};
use crate::net::cipher::{apply_cipher_policy, suite_name, CipherPolicyError};

/// Error type for TLS material loading.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("No certificates found in {0:?}")]
    NoCertificates(PathBuf),
    #[error("No private key found in {0:?}")]
    NoPrivateKey(PathBuf),
    #[error("No negotiable TLS protocol version configured")]
    NoProtocolVersions,
    #[error(transparent)]
    CipherPolicy(#[from] CipherPolicyError),
    #[error("Invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Certificate chain and key, loaded read-only at startup.
pub struct TlsMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsMaterial {
    /// Load certificate chain and private key from PEM files.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        Ok(Self {
            certs: load_certs(cert_path)?,
            key: load_private_key(key_path)?,
        })
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Load every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Map configured version names onto the versions rustls can negotiate.
///
/// Legacy names are dropped with a warning. Duplicates collapse, and the
/// result is ordered oldest first.
pub fn protocol_versions(
    versions: &[TlsVersion],
) -> Result<Vec<&'static SupportedProtocolVersion>, TlsError> {
    let mut versions = versions.to_vec();
    versions.sort();
    versions.dedup();

    let mut supported = Vec::new();
    for version in &versions {
        match version {
            TlsVersion::Tls12 => supported.push(&rustls::version::TLS12),
            TlsVersion::Tls13 => supported.push(&rustls::version::TLS13),
            legacy => {
                tracing::warn!(version = %legacy, "Protocol version not supported, ignoring");
            }
        }
    }
    if supported.is_empty() {
        return Err(TlsError::NoProtocolVersions);
    }
    Ok(supported)
}

/// Build the rustls server configuration from material and policy.
pub fn build_server_config(
    config: &TlsConfig,
    material: TlsMaterial,
) -> Result<Arc<ServerConfig>, TlsError> {
    let versions = protocol_versions(&config.protocols)?;

    let mut provider = rustls::crypto::ring::default_provider();
    provider.cipher_suites = apply_cipher_policy(&config.ciphers, &provider.cipher_suites)?;

    tracing::debug!(
        versions = ?versions.iter().map(|v| v.version).collect::<Vec<_>>(),
        suites = ?provider.cipher_suites.iter().map(|s| suite_name(s.suite())).collect::<Vec<_>>(),
        "TLS policy resolved"
    );

    let mut server_config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&versions)?
        .with_no_client_auth()
        .with_single_cert(material.certs, material.key)?;

    // Only HTTP/1.1 is spoken on the client side.
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(server_config))
}

/// Load TLS material from disk and build the shared acceptor.
pub fn load_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    let material = TlsMaterial::load(Path::new(&config.cert_path), Path::new(&config.key_path))?;
    let server_config = build_server_config(config, material)?;

    tracing::info!(
        cert_path = %config.cert_path,
        protocols = ?config.protocols,
        ciphers = %config.ciphers,
        "TLS material loaded"
    );

    Ok(TlsAcceptor::from(server_config))
}
