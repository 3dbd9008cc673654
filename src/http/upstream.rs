use http::uri::{Authority, InvalidUri, PathAndQuery, Scheme, Uri};
use std::{fmt, str::FromStr};

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    #[error(transparent)]
    InvalidUri(#[from] InvalidUri),

    #[error("upstream scheme must be http or https")]
    UnsupportedScheme,

    #[error("upstream must include a host")]
    MissingHost,
}

/// The single origin every request is forwarded to.
#[derive(Clone, Debug)]
pub struct Upstream {
    raw: String,
    scheme: Scheme,
    authority: Authority,
    path: String,
    query: Option<String>,
}

impl FromStr for Upstream {
    type Err = UpstreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri = s.parse::<Uri>()?;

        let scheme = match uri.scheme() {
            Some(scheme) if *scheme == Scheme::HTTP || *scheme == Scheme::HTTPS => scheme.clone(),
            _ => return Err(UpstreamError::UnsupportedScheme),
        };
        let authority = match uri.authority() {
            Some(authority) if !authority.host().is_empty() => authority.clone(),
            _ => return Err(UpstreamError::MissingHost),
        };

        Ok(Self {
            raw: s.to_owned(),
            scheme,
            authority,
            path: uri.path().to_owned(),
            query: uri.query().map(ToOwned::to_owned),
        })
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Upstream {
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Point a request target at this origin.
    ///
    /// The request path is appended to the upstream path with a single slash
    /// between them, and both query strings are kept.
    pub fn target(&self, req: &Uri) -> Result<Uri, http::Error> {
        let path = join_path(&self.path, req.path());
        let base = self.query.as_deref().filter(|q| !q.is_empty());
        let query = req.query().filter(|q| !q.is_empty());
        let path_and_query = match (base, query) {
            (Some(base), Some(query)) => format!("{path}?{base}&{query}"),
            (Some(query), None) | (None, Some(query)) => format!("{path}?{query}"),
            (None, None) => path,
        };

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(PathAndQuery::try_from(path_and_query)?)
            .build()
    }
}

fn join_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}
