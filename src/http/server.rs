use super::{
    access::AccessRecord, connect::Connector, deadline::Deadline, forward::Forwarder,
    tls::RustlsAcceptor, ProxyBody,
};
use crate::{identity::Identity, serve::Context};
use hyper::{body::Incoming, service::service_fn, Request, Response};
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto::Builder,
};
use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    time::Duration,
};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Listen backlog.
const BACKLOG: u32 = 1024;

/// Extra idle allowance on client connections, so an upstream timeout is
/// still answered with 504 before the connection deadline fires.
const RESPONSE_GRACE: Duration = Duration::from_secs(1);

/// HTTPS server.
pub struct Server {
    acceptor: RustlsAcceptor,
    builder: Builder<TokioExecutor>,
    listener: TcpListener,
    handler: Handler,
    timeout: Duration,
}

impl Server {
    /// Bind the listening socket and prepare the forwarding chain.
    pub fn new(ctx: Context, identity: Identity) -> crate::Result<Self> {
        let acceptor = RustlsAcceptor::new(identity, ctx.timeout)?;
        let connector = Connector::new(ctx.verify_upstream_tls, ctx.timeout);
        let handler = Handler {
            forwarder: Forwarder::new(ctx.upstream, &connector, ctx.timeout)?,
        };

        let socket = if ctx.bind.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(ctx.bind)?;
        let listener = socket.listen(BACKLOG)?;

        let mut builder = Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(ctx.timeout)
            .title_case_headers(true)
            .preserve_header_case(true);
        builder.http2().timer(TokioTimer::new());

        Ok(Self {
            acceptor,
            builder,
            listener,
            handler,
            timeout: ctx.timeout + RESPONSE_GRACE,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve the proxy.
    pub async fn serve(self) -> crate::Result<()> {
        let Self {
            acceptor,
            builder,
            listener,
            handler,
            timeout,
        } = self;

        loop {
            let (tcp_stream, socket_addr) = accept(&listener).await;

            let handler = handler.clone();
            let acceptor = acceptor.clone();
            let builder = builder.clone();

            tokio::spawn(async move {
                let stream = match acceptor.accept(tcp_stream).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        tracing::debug!("TLS handshake with {} failed: {}", socket_addr, err);
                        return;
                    }
                };

                if let Err(err) = builder
                    .serve_connection_with_upgrades(
                        TokioIo::new(Deadline::new(stream, timeout)),
                        service_fn(|req| handler.clone().proxy(socket_addr, req)),
                    )
                    .await
                {
                    tracing::debug!("Failed to serve connection: {:?}", err);
                }
            });
        }
    }
}

async fn accept(listener: &TcpListener) -> (TcpStream, SocketAddr) {
    loop {
        match listener.accept().await {
            Ok(value) => return value,
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub(super) fn io_other<E: Into<BoxError>>(error: E) -> io::Error {
    io::Error::new(ErrorKind::Other, error)
}

#[derive(Clone)]
struct Handler {
    forwarder: Forwarder,
}

impl Handler {
    async fn proxy(
        self,
        socket: SocketAddr,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, http::Error> {
        AccessRecord {
            method: req.method(),
            client: socket,
            upstream: self.forwarder.upstream(),
        }
        .log();

        self.forwarder.forward(socket, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{http::connect::insecure_client_config, identity::Source};
    use bytes::Bytes;
    use http::{header, Method, StatusCode};
    use http_body_util::{BodyExt, Full};
    use hyper::server::conn::http1;
    use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
    use hyper_util::client::legacy::{connect::HttpConnector, Client};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::{rustls::pki_types::ServerName, TlsConnector};
    use tracing_subscriber::fmt::MakeWriter;

    type TestClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

    fn test_identity() -> Identity {
        let generated = rcgen::generate_simple_self_signed(vec![
            "localhost".to_owned(),
            "127.0.0.1".to_owned(),
        ])
        .unwrap();

        Identity::from_pem(
            generated.cert.pem().as_bytes(),
            generated.key_pair.serialize_pem().as_bytes(),
            Source::Generated,
        )
        .unwrap()
    }

    /// Plain HTTP upstream that echoes the request body, or `{"ok":true}` when empty.
    async fn spawn_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(echo))
                        .await;
                });
            }
        });

        addr
    }

    /// HTTPS upstream presenting a self-signed certificate.
    async fn spawn_tls_upstream() -> SocketAddr {
        let acceptor = RustlsAcceptor::new(test_identity(), Duration::from_secs(5)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(stream) = acceptor.accept(stream).await {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service_fn(echo))
                            .await;
                    }
                });
            }
        });

        addr
    }

    async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let seen = format!("{} {} {}", req.method(), req.uri(), host);

        let body = req.into_body().collect().await?.to_bytes();
        let body = if body.is_empty() {
            Bytes::from_static(b"{\"ok\":true}")
        } else {
            body
        };

        Ok(Response::builder()
            .header("x-seen", seen)
            .body(Full::new(body))
            .unwrap())
    }

    async fn spawn_proxy(upstream: &str) -> SocketAddr {
        spawn_proxy_with(upstream, false, Duration::from_secs(15)).await
    }

    async fn spawn_proxy_with(upstream: &str, verify: bool, timeout: Duration) -> SocketAddr {
        let ctx = Context {
            bind: "127.0.0.1:0".parse().unwrap(),
            upstream: upstream.parse().unwrap(),
            verify_upstream_tls: verify,
            timeout,
        };

        let server = Server::new(ctx, test_identity()).unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.serve());
        addr
    }

    fn client() -> TestClient {
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(insecure_client_config())
            .https_only()
            .enable_http1()
            .build();

        Client::builder(TokioExecutor::new()).build(connector)
    }

    /// In-memory sink for tracing output.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'w> MakeWriter<'w> for Captured {
        type Writer = Self;

        fn make_writer(&'w self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_forward_round_trip() {
        let upstream = spawn_upstream().await;
        let proxy = spawn_proxy(&format!("http://{upstream}")).await;

        let resp = client()
            .get(format!("https://{proxy}/foo").parse().unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-seen"], format!("GET /foo {upstream}"));

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_forward_preserves_body() {
        let upstream = spawn_upstream().await;
        let proxy = spawn_proxy(&format!("http://{upstream}/api")).await;

        let payload = Bytes::from_static(&[0, 159, 146, 150, b'\n', 255]);
        let req = Request::builder()
            .method(Method::PUT)
            .uri(format!("https://{proxy}/items?id=7"))
            .body(Full::new(payload.clone()))
            .unwrap();

        let resp = client().request(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["x-seen"],
            format!("PUT /api/items?id=7 {upstream}")
        );

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, payload);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = closed.local_addr().unwrap();
        drop(closed);

        let proxy = spawn_proxy(&format!("http://{upstream}")).await;
        let resp = client()
            .get(format!("https://{proxy}/").parse().unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        // the listener keeps serving after a failed forward
        let resp = client()
            .get(format!("https://{proxy}/again").parse().unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ctx = Context {
            bind: taken.local_addr().unwrap(),
            upstream: "http://127.0.0.1:9000".parse().unwrap(),
            verify_upstream_tls: false,
            timeout: Duration::from_secs(15),
        };

        assert!(Server::new(ctx, test_identity()).is_err());
    }

    #[tokio::test]
    async fn test_access_line_is_written() {
        let sink = Captured::default();
        let subscriber = crate::logger::subscriber(tracing::Level::INFO, sink.clone()).unwrap();
        // current-thread runtime: the proxy tasks log on this thread
        let _guard = tracing::subscriber::set_default(subscriber);

        // upstream that snapshots the log when the request reaches it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!("http://{}", listener.local_addr().unwrap());
        let at_upstream = Captured::default();
        {
            let sink = sink.clone();
            let at_upstream = at_upstream.clone();
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let service = service_fn(move |_req: Request<Incoming>| {
                    let snapshot = sink.text();
                    at_upstream.0.lock().unwrap().extend_from_slice(snapshot.as_bytes());
                    async {
                        Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from_static(b"ok"))))
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }

        let proxy = spawn_proxy(&target).await;
        let resp = client()
            .get(format!("https://{proxy}/").parse().unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let logged = sink.text();
        let access = logged
            .lines()
            .filter(|line| line.contains("GET from 127.0.0.1:"))
            .collect::<Vec<_>>();
        assert_eq!(access.len(), 1, "{logged:?}");
        assert!(access[0].contains("INFO"));
        assert!(access[0].ends_with(&format!("to {target}")));

        assert!(at_upstream.text().contains(access[0]));
    }

    #[tokio::test]
    async fn test_access_line_precedes_failed_forward() {
        let sink = Captured::default();
        let subscriber = crate::logger::subscriber(tracing::Level::INFO, sink.clone()).unwrap();
        let _guard = tracing::subscriber::set_default(subscriber);

        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!("http://{}", closed.local_addr().unwrap());
        drop(closed);

        let proxy = spawn_proxy(&target).await;
        let resp = client()
            .get(format!("https://{proxy}/").parse().unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        assert!(sink.text().contains("GET from 127.0.0.1:"));
        assert!(sink.text().contains(&format!("to {target}")));
    }

    #[tokio::test]
    async fn test_self_signed_upstream_without_verification() {
        let upstream = spawn_tls_upstream().await;
        let proxy = spawn_proxy_with(
            &format!("https://{upstream}/base"),
            false,
            Duration::from_secs(15),
        )
        .await;

        let resp = client()
            .get(format!("https://{proxy}/leaf?a=1").parse().unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["x-seen"],
            format!("GET /base/leaf?a=1 {upstream}")
        );
    }

    #[tokio::test]
    async fn test_self_signed_upstream_rejected_when_verified() {
        let upstream = spawn_tls_upstream().await;
        let proxy = spawn_proxy_with(
            &format!("https://{upstream}"),
            true,
            Duration::from_secs(15),
        )
        .await;

        let resp = client()
            .get(format!("https://{proxy}/").parse().unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    /// Open a TLS connection with the given ALPN, send `opening`, then go
    /// quiet and wait for the proxy to hang up.
    async fn assert_idle_connection_closed(alpn: &[u8], opening: &[u8]) {
        let upstream = spawn_upstream().await;
        let proxy = spawn_proxy_with(
            &format!("http://{upstream}"),
            false,
            Duration::from_secs(1),
        )
        .await;

        let mut config = insecure_client_config();
        config.alpn_protocols = vec![alpn.to_vec()];
        let connector = TlsConnector::from(Arc::new(config));

        let tcp = TcpStream::connect(proxy).await.unwrap();
        let mut tls = connector
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap();
        assert_eq!(tls.get_ref().1.alpn_protocol(), Some(alpn));
        tls.write_all(opening).await.unwrap();

        let mut buf = [0u8; 4096];
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match tls.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "idle connection was left open");
    }

    #[tokio::test]
    async fn test_idle_http1_connection_is_closed() {
        // one keep-alive exchange, then silence
        assert_idle_connection_closed(
            b"http/1.1",
            b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n",
        )
        .await;
    }

    #[tokio::test]
    async fn test_idle_http2_connection_is_closed() {
        // client preface followed by an empty SETTINGS frame, then silence
        let mut opening = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n".to_vec();
        opening.extend_from_slice(&[0, 0, 0, 4, 0, 0, 0, 0, 0]);
        assert_idle_connection_closed(b"h2", &opening).await;
    }
}
