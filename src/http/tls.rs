use super::server::io_other;
use crate::identity::Identity;
use std::{fmt, io, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::timeout,
};
use tokio_rustls::{rustls::ServerConfig, server::TlsStream, TlsAcceptor};

/// Tls acceptor using rustls.
#[derive(Clone)]
pub struct RustlsAcceptor {
    inner: TlsAcceptor,
    handshake_timeout: Duration,
}

impl RustlsAcceptor {
    /// Create a new rustls acceptor presenting `identity` to every client.
    pub fn new(identity: Identity, handshake_timeout: Duration) -> io::Result<Self> {
        let config = server_config(identity)?;

        Ok(Self {
            inner: TlsAcceptor::from(Arc::new(config)),
            handshake_timeout,
        })
    }

    /// Complete the TLS handshake, giving up after the handshake timeout.
    pub async fn accept<I>(&self, stream: I) -> io::Result<TlsStream<I>>
    where
        I: AsyncRead + AsyncWrite + Unpin,
    {
        match timeout(self.handshake_timeout, self.inner.accept(stream)).await {
            Ok(result) => result,
            Err(elapsed) => Err(io::Error::new(io::ErrorKind::TimedOut, elapsed)),
        }
    }
}

impl fmt::Debug for RustlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsAcceptor").finish()
    }
}

fn server_config(identity: Identity) -> io::Result<ServerConfig> {
    let (cert_chain, key) = identity.into_parts();

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(io_other)?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}
