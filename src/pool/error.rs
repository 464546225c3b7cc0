use std::time::Duration;

/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The pool was shut down: it will never hand out resources again.
    #[error("The pool has been shut down")]
    Shutdown,
    #[error("Timed out after {0:?} waiting for a healthy resource")]
    Timeout(Duration),
    #[error("Invalid pool configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl Error {
    /// Errors after which retrying `acquire` cannot succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Shutdown | Self::Configuration(_))
    }
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self::Backend(err.into())
    }
}

/// Maps a deadpool failure, given the wait bound the pool was configured with.
pub(super) fn from_pool_error(
    err: deadpool::managed::PoolError<Error>,
    acquire_timeout: Duration,
) -> Error {
    use deadpool::managed::PoolError;
    match err {
        PoolError::Backend(e) => e,
        PoolError::Closed => Error::Shutdown,
        PoolError::Timeout(_) => Error::Timeout(acquire_timeout),
        err => Error::Backend(anyhow::anyhow!("{err}")),
    }
}
