//! TLS client configuration for ldaps:// connections.

use crate::config::TlsSettings;
use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::io::BufReader;
use std::sync::Arc;
use tracing::warn;

/// Build a rustls ClientConfig: system roots plus `ca_file`, optional client certificate.
/// With `skip_verify` the server certificate is accepted unchecked.
pub fn client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>> {
    let roots = root_store(settings.ca_file.as_deref())?;
    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut config = match (settings.cert_file.as_deref(), settings.key_file.as_deref()) {
        (Some(cert_file), Some(key_file)) => {
            let chain = load_certs_from_file(cert_file)?;
            let key = load_private_key_from_file(key_file)?;
            builder
                .with_client_auth_cert(chain, key)
                .context("Build ClientConfig with client certificate")?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => anyhow::bail!("tls.cert_file and tls.key_file must be set together"),
    };
    if settings.skip_verify {
        warn!("TLS server certificate verification disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(InsecureServerVerifier));
    }
    Ok(Arc::new(config))
}

fn root_store(ca_file: Option<&str>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(native) => {
            for cert in native {
                let _ = roots.add(cert);
            }
        }
        Err(e) => warn!("Could not load system CA certs: {}", e),
    }
    if let Some(path) = ca_file {
        for cert in load_certs_from_file(path)? {
            roots
                .add(cert)
                .with_context(|| format!("Add CA certificate from {}", path))?;
        }
    }
    Ok(roots)
}

fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open cert file: {}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

fn load_private_key_from_file(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).with_context(|| format!("Open key file: {}", path))?;
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM PKCS8 keys")?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let rsa: Vec<_> = rsa_private_keys(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM RSA keys")?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path))
}

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

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}
