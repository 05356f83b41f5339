//! TLS identity material and certificate verification.
//!
//! Each node presents an ephemeral self-signed certificate generated from
//! its Ed25519 identity key at startup. Authentication is key pinning, not
//! PKI: the verifiers extract the Ed25519 public key from the presented
//! certificate and compare bytes. Possession of the matching private key is
//! proven by the TLS handshake itself (CertificateVerify).
//!
//! - Outbound: the client pins the exact key it intends to dial; any other
//!   key fails the handshake.
//! - Inbound: the server admits any certificate carrying a well-formed
//!   Ed25519 key; federation membership is enforced by the acceptor loop
//!   after the handshake.

use crate::NetworkError;
use gridbot_types::{KeyPair, PeerKey, PEER_KEY_LEN};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme,
};
use std::sync::Arc;

/// A node's ephemeral TLS identity: self-signed certificate plus the
/// PKCS#8-encoded private key it was issued from.
pub(crate) struct TlsIdentity {
    pub cert: CertificateDer<'static>,
    pkcs8: Vec<u8>,
}

impl TlsIdentity {
    /// Issue a fresh self-signed certificate bound to the node key pair.
    pub fn generate(keypair: &KeyPair) -> Result<Self, NetworkError> {
        let pkcs8 = keypair
            .to_pkcs8_der()
            .map_err(|e| NetworkError::Handshake(e.to_string()))?;
        let rc_key = rcgen::KeyPair::try_from(&pkcs8[..])
            .map_err(|e| NetworkError::Handshake(e.to_string()))?;

        let mut params = rcgen::CertificateParams::new(vec!["gridbot".to_string()])
            .map_err(|e| NetworkError::Handshake(e.to_string()))?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "gridbot peer");

        let cert = params
            .self_signed(&rc_key)
            .map_err(|e| NetworkError::Handshake(e.to_string()))?;

        Ok(TlsIdentity {
            cert: cert.der().clone(),
            pkcs8,
        })
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.pkcs8.clone()))
    }

    /// Client configuration pinned to one expected remote key.
    pub fn client_config(&self, expected: PeerKey) -> Result<ClientConfig, NetworkError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let algorithms = provider.signature_verification_algorithms;
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| NetworkError::Handshake(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier {
                expected,
                algorithms,
            }))
            .with_client_auth_cert(vec![self.cert.clone()], self.private_key())
            .map_err(|e| NetworkError::Handshake(e.to_string()))?;
        Ok(config)
    }

    /// Server configuration requiring a client certificate with a
    /// well-formed Ed25519 key.
    pub fn server_config(&self) -> Result<ServerConfig, NetworkError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let algorithms = provider.signature_verification_algorithms;
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| NetworkError::Handshake(e.to_string()))?
            .with_client_cert_verifier(Arc::new(AnyPeerClientVerifier { algorithms }))
            .with_single_cert(vec![self.cert.clone()], self.private_key())
            .map_err(|e| NetworkError::Handshake(e.to_string()))?;
        Ok(config)
    }
}

/// The SNI name used on outbound handshakes. The pinned verifier ignores
/// it; certificates are matched on key bytes only.
pub(crate) fn dial_server_name() -> ServerName<'static> {
    ServerName::try_from("gridbot").expect("static dns name is valid")
}

/// Extract the Ed25519 identity key from a presented certificate.
pub(crate) fn peer_key_from_cert(cert: &CertificateDer<'_>) -> Result<PeerKey, NetworkError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| NetworkError::InvalidPeerCertificate(format!("{e:?}")))?;
    let spki = parsed.public_key();
    if spki.algorithm.algorithm != x509_parser::oid_registry::OID_SIG_ED25519 {
        return Err(NetworkError::InvalidPeerCertificate(
            "certificate key is not ed25519".into(),
        ));
    }
    let data = spki.subject_public_key.data.as_ref();
    let bytes: [u8; PEER_KEY_LEN] = data.try_into().map_err(|_| {
        NetworkError::InvalidPeerCertificate(format!("unexpected key length {}", data.len()))
    })?;
    Ok(PeerKey::from_bytes(bytes))
}

/// Accepts exactly one server identity: the certificate must carry the
/// pinned Ed25519 key.
#[derive(Debug)]
struct PinnedServerVerifier {
    expected: PeerKey,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented =
            peer_key_from_cert(end_entity).map_err(|e| rustls::Error::General(e.to_string()))?;
        if presented != self.expected {
            return Err(rustls::Error::General(format!(
                "peer key mismatch: expected {}, presented {}",
                self.expected, presented
            )));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Requires a client certificate with a parseable Ed25519 key but defers
/// federation membership to the acceptor loop.
#[derive(Debug)]
struct AnyPeerClientVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AnyPeerClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        peer_key_from_cert(end_entity).map_err(|e| rustls::Error::General(e.to_string()))?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
