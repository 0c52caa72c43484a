use std::path::PathBuf;
use thiserror::Error;

/// Conditions a caller needs to tell apart. They travel inside `anyhow::Error`
/// and come back out with `downcast_ref::<CoreError>()`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("source file missing: {0:?}")]
    SourceMissing(PathBuf),
    #[error("source file vanished while retrying: {0:?}")]
    SourceVanished(PathBuf),
    #[error("move aborted: {src:?} -> {dst:?}")]
    MoveAborted { src: PathBuf, dst: PathBuf },
    #[error("move failed after {attempts} attempts: {src:?} -> {dst:?} ({source})")]
    MoveFailed {
        src: PathBuf,
        dst: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("target folder already exists: {0:?}")]
    TargetExists(PathBuf),
    #[error("unit not found: {0}")]
    UnitNotFound(String),
    #[error("unit is externally managed: {0}")]
    ExternallyManaged(String),
    #[error("profile {requested:?} would overwrite profile {existing:?}")]
    ProfileNameTaken { requested: String, existing: String },
}

impl CoreError {
    pub fn is_cancelled(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<CoreError>(), Some(CoreError::Cancelled))
    }
}

pub fn check_cancelled(token: &tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    if token.is_cancelled() {
        return Err(CoreError::Cancelled.into());
    }
    Ok(())
}
