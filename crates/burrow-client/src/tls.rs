//! Client-side TLS configuration.
//!
//! Metadata servers are self-hosted and typically present self-signed
//! certificates, so the verifier accepts whatever the server offers. The
//! password handshake in the protocol is what authenticates the parties.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::{ClientError, KeyPair};

#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub(crate) fn client_config(
    key_pair: Option<&KeyPair>,
) -> Result<Arc<rustls::ClientConfig>, ClientError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::TlsConfig(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }));
    let config = match key_pair {
        Some(kp) => {
            let (certs, key) = load_key_pair(kp)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::TlsConfig(e.to_string()))?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

fn load_key_pair(
    kp: &KeyPair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ClientError> {
    let mut cert_reader = BufReader::new(File::open(&kp.cert_file)?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(e.to_string()))?;
    let mut key_reader = BufReader::new(File::open(&kp.key_file)?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ClientError::TlsConfig(e.to_string()))?
        .ok_or_else(|| {
            ClientError::TlsConfig(format!("no private key in {}", kp.key_file.display()))
        })?;
    Ok((certs, key))
}

/// Extract the host portion of `host:port` for SNI.
pub(crate) fn server_name(address: &str) -> Result<ServerName<'static>, ClientError> {
    let host = address
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .unwrap_or(address);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_owned()).map_err(|_| ClientError::BadAddress(address.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_accepts_hostnames_and_addresses() {
        assert!(server_name("meta.example.org:6660").is_ok());
        assert!(server_name("127.0.0.1:6660").is_ok());
        assert!(server_name("[::1]:6660").is_ok());
        assert!(server_name("localhost:0").is_ok());
    }
}
