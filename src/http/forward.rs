use super::{
    connect::{Connector, UpstreamClient},
    error::Error,
    upstream::Upstream,
    ProxyBody,
};
use http::{
    header::{self, HeaderMap, HeaderName, HeaderValue},
    Request, Response, StatusCode, Version,
};
use http_body_util::BodyExt;
use hyper::{body::Incoming, upgrade::OnUpgrade};
use hyper_util::rt::TokioIo;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::time::timeout;

/// Headers that only describe a single connection and must not be forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Reverse proxy to a single upstream origin.
#[derive(Clone)]
pub struct Forwarder {
    inner: Arc<InnerForwarder>,
}

struct InnerForwarder {
    upstream: Upstream,
    client: UpstreamClient,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(upstream: Upstream, connector: &Connector, timeout: Duration) -> std::io::Result<Self> {
        Ok(Forwarder {
            inner: Arc::new(InnerForwarder {
                upstream,
                client: connector.client()?,
                timeout,
            }),
        })
    }

    pub fn upstream(&self) -> &Upstream {
        &self.inner.upstream
    }

    /// Forward `req` to the upstream and relay its response.
    ///
    /// Upstream failures become a gateway error response for this client only.
    pub async fn forward(
        &self,
        client: SocketAddr,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, http::Error> {
        match self.try_forward(client, req).await {
            Ok(resp) => Ok(resp),
            Err(err) => {
                tracing::warn!("Failed to forward request to {}: {}", self.upstream(), err);
                err.try_into()
            }
        }
    }

    async fn try_forward(
        &self,
        client: SocketAddr,
        mut req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, Error> {
        let client_upgrade = upgrade_type(req.headers())
            .is_some()
            .then(|| hyper::upgrade::on(&mut req));

        rewrite_request(&mut req, self.upstream(), client)?;
        tracing::debug!("Forwarding {} {}", req.method(), req.uri());

        let mut resp = timeout(self.inner.timeout, self.inner.client.request(req)).await??;

        if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
            let client_upgrade = client_upgrade.ok_or(Error::UnexpectedUpgrade)?;
            let upstream_upgrade = hyper::upgrade::on(&mut resp);
            tokio::spawn(tunnel(client_upgrade, upstream_upgrade));
        } else {
            remove_hop_by_hop(resp.headers_mut());
        }

        Ok(resp.map(|body| body.boxed()))
    }
}

/// Retarget `req` at the upstream and adjust the proxy headers.
pub(super) fn rewrite_request<B>(
    req: &mut Request<B>,
    upstream: &Upstream,
    client: SocketAddr,
) -> Result<(), http::Error> {
    let upgrade = upgrade_type(req.headers());
    let te_trailers = header_has_token(req.headers(), header::TE, "trailers");

    *req.uri_mut() = upstream.target(req.uri())?;
    *req.version_mut() = Version::HTTP_11;

    let headers = req.headers_mut();
    remove_hop_by_hop(headers);

    if te_trailers {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
    }
    if let Some(upgrade) = upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, upgrade);
    }

    headers.insert(
        header::HOST,
        HeaderValue::from_str(upstream.authority().as_str())?,
    );

    // prior values are kept byte for byte, even when they are not UTF-8
    let mut forwarded_for = Vec::new();
    for value in headers.get_all(X_FORWARDED_FOR) {
        forwarded_for.extend_from_slice(value.as_bytes());
        forwarded_for.extend_from_slice(b", ");
    }
    forwarded_for.extend_from_slice(client.ip().to_string().as_bytes());
    headers.insert(
        HeaderName::from_static(X_FORWARDED_FOR),
        HeaderValue::from_bytes(&forwarded_for)?,
    );

    Ok(())
}

pub(super) fn remove_hop_by_hop(headers: &mut HeaderMap) {
    // Connection may name further per-connection headers
    let listed = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>();

    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
    if header_has_token(headers, header::CONNECTION, "upgrade") {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

// Splice the client and upstream connections once both sides have switched protocols.
async fn tunnel(client: OnUpgrade, upstream: OnUpgrade) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!("upgrade error: {}", err);
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut TokioIo::new(client), &mut TokioIo::new(upstream))
        .await
    {
        Ok((from_client, from_server)) => {
            tracing::debug!(
                "client wrote {} bytes and received {} bytes",
                from_client,
                from_server
            );
        }
        Err(err) => {
            tracing::debug!("tunnel error: {}", err);
        }
    }
}
