//! TLS utilities for the TCP transport.
//!
//! This module provides certificate loading for listeners, connector
//! construction for targets, and a no-op certificate verifier for
//! self-signed test backends.

use crate::config::ClientTlsConfig;
use crate::error::TransportError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// No-op certificate verifier for development/testing with self-signed certificates.
///
/// # Warning
/// This disables all TLS security checks - use only against test backends!
#[derive(Debug)]
pub struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(e.to_string())
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| tls_error(format!("Failed to open certificate file '{path}': {e}")))?;
    let mut reader = std::io::BufReader::new(file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| tls_error(format!("Failed to parse certificate file: {e}")))?;

    if certs.is_empty() {
        return Err(tls_error(format!(
            "No certificates found in certificate file: {path}"
        )));
    }
    Ok(certs)
}

/// Create TLS acceptor from certificate and key files.
pub fn create_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(cert_path)?;

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| tls_error(format!("Failed to open private key file '{key_path}': {e}")))?;
    let mut key_reader = std::io::BufReader::new(key_file);

    // Try reading as PKCS8, RSA, or EC private key
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| tls_error(format!("Failed to parse private key file: {e}")))?
        .ok_or_else(|| tls_error(format!("No private key found in key file: {key_path}")))?;

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| tls_error(format!("Failed to build TLS configuration: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Create a TLS connector for dialing a target.
pub fn create_tls_connector(tls: &ClientTlsConfig) -> Result<TlsConnector, TransportError> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?;

    let config = if tls.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        let ca_path = tls
            .ca_path
            .as_deref()
            .ok_or_else(|| tls_error("ca_path is required unless insecure_skip_verify is set"))?;
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots.add(cert).map_err(tls_error)?;
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Resolve the name presented during the handshake.
pub(crate) fn server_name(
    tls: &ClientTlsConfig,
    host: &str,
) -> Result<ServerName<'static>, TransportError> {
    let name = tls.server_name.clone().unwrap_or_else(|| host.to_string());
    ServerName::try_from(name).map_err(tls_error)
}
