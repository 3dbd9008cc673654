use super::{full, ProxyBody};
use http::{header, Response, StatusCode};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] http::Error),

    #[error(transparent)]
    HyperLegacy(#[from] hyper_util::client::legacy::Error),

    #[error(transparent)]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("upstream switched protocols without an upgrade request")]
    UnexpectedUpgrade,
}

impl TryInto<Response<ProxyBody>> for Error {
    type Error = http::Error;

    /// Gateway response shown to the client when forwarding fails.
    fn try_into(self) -> Result<Response<ProxyBody>, Self::Error> {
        let status = match self {
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(full(status.canonical_reason().unwrap_or_default()))
    }
}
