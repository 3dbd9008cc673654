use crate::{identity, logger, Opt, Result};
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

/// Every interface, HTTPS port.
const LISTEN_ADDR: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 443));

/// Bound on TLS handshakes, request header reads and upstream round trips.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Whether upstream certificates are checked. Upstreams are commonly
/// self-signed, so verification is off.
const VERIFY_UPSTREAM_TLS: bool = false;

/// Immutable settings shared by the listener and the forwarder.
pub struct Context {
    /// Bind address
    pub bind: SocketAddr,

    /// Upstream origin
    pub upstream: crate::http::upstream::Upstream,

    /// Verify the upstream TLS certificate
    pub verify_upstream_tls: bool,

    /// Per-connection read/write timeout
    pub timeout: Duration,
}

/// Run the server with the provided options.
pub fn run(opt: Opt) -> Result<()> {
    let log_path = logger::default_path()?;
    logger::init(opt.log, &log_path)?;

    tracing::info!("OS: {}", std::env::consts::OS);
    tracing::info!("Arch: {}", std::env::consts::ARCH);
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Log file: {}", log_path.display());

    let identity = identity::resolve(&opt.files)?;
    tracing::info!("TLS identity: {:?}", identity.source());

    let ctx = Context {
        bind: LISTEN_ADDR,
        upstream: opt.upstream,
        verify_upstream_tls: VERIFY_UPSTREAM_TLS,
        timeout: CONNECTION_TIMEOUT,
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(crate::http::https_proxy(ctx, identity))
}
