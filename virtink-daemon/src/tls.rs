//! TLS material for the migration tunnel.
//!
//! Both daemons load certs from the daemon cert directory. The target side
//! requires client certificates verified against the CA; the source side
//! presents its certificate and skips server verification, since targets are
//! addressed by node IP and carry no stable server name.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("open cert file {}", path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .context("parse certificates")?;
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("open key file {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .context("parse private key")?
        .context("no private key found")
}

fn load_ca_roots(cert_dir: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&cert_dir.join("ca.crt"))? {
        roots.add(cert).context("add CA certificate")?;
    }
    Ok(roots)
}

/// Server config for the migration target: TLS 1.2+, client certs required.
pub fn server_config(cert_dir: &Path) -> Result<ServerConfig> {
    let roots = load_ca_roots(cert_dir)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("build client verifier")?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            load_certs(&cert_dir.join("tls.crt"))?,
            load_key(&cert_dir.join("tls.key"))?,
        )
        .context("build server config")?;
    Ok(config)
}

/// Client config for the migration source: presents the daemon cert, skips
/// server verification.
pub fn client_config(cert_dir: &Path) -> Result<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureServerVerifier))
        .with_client_auth_cert(
            load_certs(&cert_dir.join("tls.crt"))?,
            load_key(&cert_dir.join("tls.key"))?,
        )
        .context("build client config")?;
    Ok(config)
}

/// Accepts any server certificate. The tunnel authenticates the peer through
/// the client certificate the target requires, not the server name.
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
