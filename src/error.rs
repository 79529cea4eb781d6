use std::path::PathBuf;

/// Conditions callers may want to match on. Everything is propagated as an
/// `anyhow::Error`; use `downcast_ref::<Error>()` to recover these.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corrupt file {}: {reason} at offset {offset}", path.display())]
    Corruption {
        path: PathBuf,
        offset: u64,
        reason: String,
    },
}

impl Error {
    pub(crate) fn corruption<P, S>(path: P, offset: u64, reason: S) -> Self
    where
        P: Into<PathBuf>,
        S: Into<String>,
    {
        Error::Corruption {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }
}

pub(crate) fn check_key(key: &str) -> anyhow::Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("key must not be empty".into()).into());
    }
    if u32::try_from(key.len()).is_err() {
        return Err(Error::InvalidArgument(format!("key of {} bytes is too long", key.len())).into());
    }
    Ok(())
}
