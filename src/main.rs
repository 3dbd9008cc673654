pub mod alloc;
mod error;
mod http;
mod identity;
mod logger;
mod serve;

use crate::http::upstream::Upstream;
use clap::Parser;
use std::process::ExitCode;

type Result<T, E = error::Error> = std::result::Result<T, E>;

const BIN_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Parser)]
#[clap(author, version, about, arg_required_else_help = true)]
pub struct Opt {
    /// Log level e.g. trace, debug, info, warn, error
    #[clap(long, env = "TLSFRONT_LOG", default_value = "info")]
    log: tracing::Level,

    /// Upstream origin every request is forwarded to, e.g. http://127.0.0.1:9000
    upstream: Upstream,

    /// TLS private key and certificate files, in either order.
    /// A path containing "key" is the key, one containing "cert" or "cer" is the certificate.
    files: Vec<String>,
}

fn main() -> ExitCode {
    let opt = Opt::parse();
    match serve::run(opt) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // the log file may be what failed, so stderr always gets it
            eprintln!("{}", startup_failure(&err));
            tracing::error!("{}", startup_failure(&err));
            ExitCode::FAILURE
        }
    }
}

fn startup_failure(err: &error::Error) -> String {
    format!("{} failed to start: {}", BIN_NAME, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_failure_names_the_cause() {
        let dir = tempfile::tempdir().unwrap();
        let err = logger::open(&dir.path().join("missing").join("logs.txt"))
            .map_err(error::Error::from)
            .unwrap_err();

        let message = startup_failure(&err);
        assert!(message.starts_with("tlsfront failed to start: "));
        assert!(message.ends_with(&err.to_string()));
    }
}
