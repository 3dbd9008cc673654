#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    SetGlobalDefaultError(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error(transparent)]
    DirectiveParseError(#[from] tracing_subscriber::filter::ParseError),

    #[error(transparent)]
    IdentityError(#[from] crate::identity::IdentityError),

    #[error("unable to resolve the home directory for the log file")]
    HomeDirUnavailable,
}
