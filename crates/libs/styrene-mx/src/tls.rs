//! Mutual TLS where identity is a certificate thumbprint rather than a CA
//! chain. Both verifiers check signatures normally and replace path
//! validation with a thumbprint check.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::Resumption;
use rustls::crypto::{aws_lc_rs, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::NoServerSessionStorage;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme,
};

use crate::endpoint::normalize_thumbprint;
use crate::error::MxError;
use crate::trust::{describe_certificate, thumbprint, ClientAuthorizer};

/// Certificate chain and key this process presents to its peers.
pub struct TlsIdentity {
    certificate_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    thumbprint: String,
    subject: String,
}

impl TlsIdentity {
    pub fn from_der(
        certificate_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self, MxError> {
        let leaf = certificate_chain
            .first()
            .ok_or_else(|| MxError::config("identity has no certificate"))?;
        let thumbprint = thumbprint(leaf.as_ref());
        let subject = describe_certificate(leaf.as_ref());
        Ok(Self { certificate_chain, private_key, thumbprint, subject })
    }

    pub fn from_pem_files(certificate: &Path, private_key: &Path) -> Result<Self, MxError> {
        Self::from_der(load_cert_chain(certificate)?, load_private_key(private_key)?)
    }

    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            certificate_chain: self.certificate_chain.clone(),
            private_key: self.private_key.clone_key(),
            thumbprint: self.thumbprint.clone(),
            subject: self.subject.clone(),
        }
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("thumbprint", &self.thumbprint)
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

/// Client configuration that only accepts a server presenting
/// `expected_thumbprint`.
pub fn client_config(
    identity: &TlsIdentity,
    expected_thumbprint: &str,
) -> Result<Arc<ClientConfig>, MxError> {
    let provider = Arc::new(aws_lc_rs::default_provider());
    let verifier = ExpectedServerVerifier {
        expected: normalize_thumbprint(expected_thumbprint),
        provider: provider.clone(),
    };
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_config_error)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(identity.certificate_chain.clone(), identity.private_key.clone_key())
        .map_err(tls_config_error)?;
    // A resumed session would skip the thumbprint checks on both sides.
    config.resumption = Resumption::disabled();
    Ok(Arc::new(config))
}

/// Server configuration that asks every client for a certificate and runs
/// it through `authorizer`.
pub fn server_config(
    identity: &TlsIdentity,
    authorizer: Arc<ClientAuthorizer>,
) -> Result<Arc<ServerConfig>, MxError> {
    let provider = Arc::new(aws_lc_rs::default_provider());
    let verifier = AuthorizingClientVerifier { authorizer, provider: provider.clone() };
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_config_error)?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(identity.certificate_chain.clone(), identity.private_key.clone_key())
        .map_err(tls_config_error)?;
    config.session_storage = Arc::new(NoServerSessionStorage {});
    config.send_tls13_tickets = 0;
    Ok(Arc::new(config))
}

/// Name sent in SNI. Verification ignores it, but rustls needs one.
pub fn server_name(host: &str) -> Result<ServerName<'static>, MxError> {
    ServerName::try_from(host.to_string())
        .map_err(|err| MxError::config(format!("invalid server name {}: {}", host, err)))
}

fn tls_config_error(err: rustls::Error) -> MxError {
    MxError::config(format!("invalid TLS configuration: {}", err))
}

#[derive(Debug)]
struct ExpectedServerVerifier {
    expected: String,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for ExpectedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = thumbprint(end_entity.as_ref());
        if presented == self.expected {
            return Ok(ServerCertVerified::assertion());
        }
        log::warn!(
            "mx_client: server presented {} ({}) but {} was expected",
            presented,
            describe_certificate(end_entity.as_ref()),
            self.expected
        );
        Err(rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[derive(Debug)]
struct AuthorizingClientVerifier {
    authorizer: Arc<ClientAuthorizer>,
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AuthorizingClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        match self.authorizer.authorize(end_entity.as_ref()) {
            Some(_) => Ok(ClientCertVerified::assertion()),
            None => Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, MxError> {
    let file = File::open(path)
        .map_err(|err| MxError::config(format!("failed to open {}: {}", path.display(), err)))?;
    let mut reader = BufReader::new(file);
    let certificates =
        rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>().map_err(|err| {
            MxError::config(format!("failed to parse PEM certs from {}: {}", path.display(), err))
        })?;
    if certificates.is_empty() {
        return Err(MxError::config(format!("no certificates found in {}", path.display())));
    }
    Ok(certificates)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, MxError> {
    let file = File::open(path)
        .map_err(|err| MxError::config(format!("failed to open {}: {}", path.display(), err)))?;
    let mut reader = BufReader::new(file);
    let key = rustls_pemfile::private_key(&mut reader).map_err(|err| {
        MxError::config(format!("failed to parse private key {}: {}", path.display(), err))
    })?;
    key.ok_or_else(|| MxError::config(format!("no private key found in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rustls::pki_types::PrivatePkcs8KeyDer;

    use super::*;
    use crate::trust::{BlockUnauthorized, TrustStore};

    fn generated(name: &str) -> (rcgen::Certificate, Vec<u8>) {
        let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).expect("generate");
        let der = cert.serialize_der().expect("der");
        (cert, der)
    }

    #[test]
    fn identity_thumbprint_matches_the_leaf_certificate() {
        let (cert, der) = generated("localhost");
        let identity = TlsIdentity::from_der(
            vec![CertificateDer::from(der.clone())],
            PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()).into(),
        )
        .expect("identity");
        assert_eq!(identity.thumbprint(), thumbprint(&der));
        assert!(format!("{:?}", identity.clone()).contains(identity.thumbprint()));

        let trust = Arc::new(TrustStore::new());
        let authorizer = Arc::new(ClientAuthorizer::new(trust, Arc::new(BlockUnauthorized)));
        assert!(server_config(&identity, authorizer).is_ok());
        assert!(client_config(&identity, identity.thumbprint()).is_ok());
    }

    #[test]
    fn loads_identity_from_pem_files() {
        let (cert, _) = generated("node-a");
        let mut cert_file = tempfile::NamedTempFile::new().expect("cert file");
        cert_file.write_all(cert.serialize_pem().expect("pem").as_bytes()).expect("write cert");
        let mut key_file = tempfile::NamedTempFile::new().expect("key file");
        key_file.write_all(cert.serialize_private_key_pem().as_bytes()).expect("write key");

        let identity =
            TlsIdentity::from_pem_files(cert_file.path(), key_file.path()).expect("identity");
        assert_eq!(identity.thumbprint().len(), 64);
        assert_eq!(identity.subject(), "rcgen self signed cert");

        let empty = tempfile::NamedTempFile::new().expect("empty file");
        assert!(matches!(
            TlsIdentity::from_pem_files(empty.path(), key_file.path()),
            Err(MxError::Config { .. })
        ));
    }

    #[test]
    fn rejects_invalid_server_names() {
        assert!(server_name("localhost").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
