use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioTimer},
};
use std::{sync::Arc, time::Duration};
use tokio_rustls::rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{self, ring, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};

pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Incoming>;

/// Builds the HTTP(S) client used to reach the upstream.
pub struct Connector {
    /// Verify the upstream certificate against the webpki roots.
    verify_tls: bool,

    /// Connect timeout.
    connect_timeout: Duration,
}

impl Connector {
    pub fn new(verify_tls: bool, connect_timeout: Duration) -> Self {
        Connector {
            verify_tls,
            connect_timeout,
        }
    }

    /// Build a pooled client speaking http or https depending on the upstream scheme.
    pub fn client(&self) -> std::io::Result<UpstreamClient> {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(self.connect_timeout));
        http.enforce_http(false);

        let builder = if self.verify_tls {
            HttpsConnectorBuilder::new().with_webpki_roots()
        } else {
            tracing::warn!("Upstream TLS certificates will not be verified");
            HttpsConnectorBuilder::new().with_tls_config(insecure_client_config())
        };
        let connector = builder.https_or_http().enable_http1().wrap_connector(http);

        Ok(Client::builder(TokioExecutor::new())
            .timer(TokioTimer::new())
            .http1_title_case_headers(true)
            .http1_preserve_header_case(true)
            .build(connector))
    }
}

/// Client config that accepts any upstream certificate.
///
/// Handshake signatures are still checked, so the peer must hold the key of
/// the certificate it presents, but the certificate itself is never trusted
/// or rejected.
pub fn insecure_client_config() -> ClientConfig {
    let provider = Arc::new(ring::default_provider());
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth()
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
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
