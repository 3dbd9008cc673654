mod access;
mod connect;
mod deadline;
mod error;
mod forward;
mod server;
mod tls;
pub mod upstream;

use crate::{identity::Identity, serve::Context};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use server::Server;

/// Body type of every response handed back to clients.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub async fn https_proxy(ctx: Context, identity: Identity) -> crate::Result<()> {
    tracing::info!("Forwarding every request to {}", ctx.upstream);

    let server = Server::new(ctx, identity)?;
    tracing::info!("HTTPS proxy server listening on {}", server.local_addr()?);

    server.serve().await
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
