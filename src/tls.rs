//! Ephemeral TLS identity for encrypted peer links and hub connections.
//!
//! Peers authenticate each other through certificate fingerprints advertised on the hub, not
//! through a PKI, so the client side accepts any certificate and checks the fingerprint later.

use crate::{
    error::{Error, Result},
    tiger::encode_base32,
};
use rcgen::{CertificateParams, KeyPair, SerialNumber};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::{self, CryptoProvider},
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
        ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme,
    },
    TlsAcceptor, TlsConnector,
};

pub(crate) struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    fingerprint: String,
}

impl TlsContext {
    /// Generates a self-signed certificate with a random 128-bit serial.
    pub fn generate() -> Result<Self> {
        let provider = Arc::new(crypto::ring::default_provider());

        let key_pair = KeyPair::generate().map_err(tls_error)?;
        let mut params =
            CertificateParams::new(vec!["localhost".to_owned()]).map_err(tls_error)?;
        let mut serial: [u8; 16] = rand::random();
        // Keep the DER integer positive.
        serial[0] &= 0x7f;
        params.serial_number = Some(SerialNumber::from_slice(&serial));
        let certificate = params.self_signed(&key_pair).map_err(tls_error)?;

        let certificate_der: CertificateDer<'static> = certificate.der().clone();
        let fingerprint = fingerprint(&certificate_der);
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let server_config = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .with_no_client_auth()
            .with_single_cert(vec![certificate_der], key_der)
            .map_err(tls_error)?;

        let client_config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth();

        log::debug!("Generated TLS certificate {}", fingerprint);

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
            fingerprint,
        })
    }

    /// Our certificate fingerprint, as advertised in `KP`.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<tokio_rustls::server::TlsStream<TcpStream>> {
        self.acceptor
            .accept(stream)
            .await
            .map_err(|error| Error::Tls(error.to_string()))
    }

    /// Connects as a TLS client. Returns the stream and the fingerprint of the server
    /// certificate.
    pub async fn connect(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<(tokio_rustls::client::TlsStream<TcpStream>, Option<String>)> {
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|error| Error::Tls(error.to_string()))?;

        let stream = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|error| Error::Tls(error.to_string()))?;

        let peer_fingerprint = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certificates| certificates.first())
            .map(fingerprint);

        Ok((stream, peer_fingerprint))
    }
}

/// `SHA256/<base32>` of a DER certificate.
pub(crate) fn fingerprint(certificate: &CertificateDer) -> String {
    format!("SHA256/{}", encode_base32(&Sha256::digest(certificate.as_ref())))
}

fn tls_error(error: impl std::fmt::Display) -> Error {
    Error::Tls(error.to_string())
}

#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
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
        certificate: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            certificate,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        certificate: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            certificate,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    #[tokio::test]
    async fn client_sees_server_fingerprint() {
        let server = Arc::new(TlsContext::generate().unwrap());
        let client = TlsContext::generate().unwrap();
        assert!(server.fingerprint().starts_with("SHA256/"));
        assert_ne!(server.fingerprint(), client.fingerprint());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn({
            let server = server.clone();
            async move {
                let (socket, _) = listener.accept().await.unwrap();
                let mut stream = server.accept(socket).await.unwrap();
                stream.write_all(b"hello").await.unwrap();
                stream.flush().await.unwrap();
            }
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        let (mut stream, seen) = client.connect("127.0.0.1", socket).await.unwrap();

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(seen.as_deref(), Some(server.fingerprint()));

        accept.await.unwrap();
    }
}
