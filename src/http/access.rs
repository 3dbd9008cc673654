use super::upstream::Upstream;
use http::Method;
use std::{fmt, net::SocketAddr};

/// One access log line: who asked for what, and where it went.
pub struct AccessRecord<'a> {
    pub method: &'a Method,
    pub client: SocketAddr,
    pub upstream: &'a Upstream,
}

impl fmt::Display for AccessRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} to {}", self.method, self.client, self.upstream)
    }
}

impl AccessRecord<'_> {
    pub fn log(&self) {
        tracing::info!("{}", self);
    }
}
