//! Caller identity: TLS server configuration and peer-certificate
//! extraction.
//!
//! Identity never travels in request payloads. The TLS layer authenticates
//! the peer against the pinned CA, and [`require_owner`] lifts the subject
//! organization out of the verified client certificate. That string is the
//! only requester identity the controller ever sees.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use tracing::warn;
use x509_parser::parse_x509_certificate;

use crate::errors::WorkerError;

/// Server-side TLS: TLS 1.3 only (every 1.3 suite is ECDHE-established with
/// an AEAD), client certificates required and verified against the pinned
/// CA, ALPN restricted to h2 for gRPC.
pub fn server_tls_config(
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
) -> Result<rustls::ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut roots = RootCertStore::empty();
    for ca in load_certs(ca_path)? {
        roots
            .add(ca)
            .with_context(|| format!("add CA from {}", ca_path.display()))?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("build client certificate verifier")?;

    let mut config =
        rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .context("assemble server TLS config")?;
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}

/// All certificates in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("parse certificates in {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates in {}", path.display()));
    }
    Ok(certs)
}

/// First private key in a PEM file.
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    rustls_pemfile::private_key(&mut &pem[..])
        .with_context(|| format!("parse private key in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key in {}", path.display()))
}

/// Owner identity of an authenticated request.
///
/// Refuses requests without a peer certificate (a transport
/// misconfiguration; the TLS layer normally rejects those connections
/// outright) and certificates whose subject carries no organization.
pub fn require_owner<T>(request: &tonic::Request<T>) -> Result<String, WorkerError> {
    let certs = request.peer_certs().ok_or_else(|| {
        warn!("request reached handler without peer certificates");
        WorkerError::PermissionDenied
    })?;
    let leaf = certs.first().ok_or_else(|| {
        warn!("peer certificate list is empty");
        WorkerError::PermissionDenied
    })?;
    owner_from_der(leaf.as_ref())
}

/// Subject organization of a DER-encoded certificate.
pub fn owner_from_der(der: &[u8]) -> Result<String, WorkerError> {
    let (_, cert) = parse_x509_certificate(der).map_err(|e| {
        warn!(error = %e, "unparseable peer certificate");
        WorkerError::PermissionDenied
    })?;
    let owner = cert
        .subject()
        .iter_organization()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::trim)
        .filter(|org| !org.is_empty());
    match owner {
        Some(org) => Ok(org.to_string()),
        None => {
            warn!(subject = %cert.subject(), "peer certificate has no organization");
            Err(WorkerError::PermissionDenied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_der(pem: &[u8]) -> CertificateDer<'static> {
        rustls_pemfile::certs(&mut &pem[..])
            .next()
            .expect("pem has a certificate")
            .expect("certificate parses")
    }

    #[test]
    fn owner_is_the_subject_organization() {
        let der = first_der(include_bytes!("../tests/fixtures/alice.pem"));
        assert_eq!(owner_from_der(der.as_ref()).expect("owner"), "alice");

        let der = first_der(include_bytes!("../tests/fixtures/bob.pem"));
        assert_eq!(owner_from_der(der.as_ref()).expect("owner"), "bob");
    }

    #[test]
    fn certificates_without_an_organization_are_refused() {
        let der = first_der(include_bytes!("../tests/fixtures/noorg.pem"));
        assert!(matches!(
            owner_from_der(der.as_ref()),
            Err(WorkerError::PermissionDenied)
        ));
    }

    #[test]
    fn garbage_der_is_refused() {
        assert!(matches!(
            owner_from_der(b"not a certificate"),
            Err(WorkerError::PermissionDenied)
        ));
    }

    #[test]
    fn server_tls_config_builds_from_fixtures() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
        let config = server_tls_config(
            &dir.join("server.pem"),
            &dir.join("server-key.pem"),
            &dir.join("ca.pem"),
        )
        .expect("tls config");
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }
}
