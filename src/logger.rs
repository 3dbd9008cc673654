use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt::MakeWriter, EnvFilter, FmtSubscriber};

#[cfg(not(windows))]
const LOG_PATH: &str = "/opt/logs.txt";

#[cfg(windows)]
const LOG_PATH: &str = "Desktop\\logs.txt";

/// Resolve the platform log file path.
///
/// On Windows the file lives on the invoking user's desktop, everywhere else
/// it is a fixed absolute path.
pub fn default_path() -> crate::Result<PathBuf> {
    if cfg!(windows) {
        dirs::home_dir()
            .map(|home| home.join(LOG_PATH))
            .ok_or(crate::error::Error::HomeDirUnavailable)
    } else {
        Ok(PathBuf::from(LOG_PATH))
    }
}

/// Open the log file for appending, creating it when absent.
pub fn open(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Build the subscriber that formats events at `level` and above into `writer`.
pub fn subscriber<W>(
    level: tracing::Level,
    writer: W,
) -> crate::Result<impl Subscriber + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::from_default_env()
        .add_directive(LevelFilter::from_level(level).into())
        .add_directive("rustls=warn".parse()?);

    Ok(FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .finish())
}

/// Route every tracing event of the process into the log file.
pub fn init(level: tracing::Level, path: &Path) -> crate::Result<()> {
    let file = open(path)?;
    tracing::subscriber::set_global_default(subscriber(level, Mutex::new(file))?)?;
    Ok(())
}
