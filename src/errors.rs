use std::fmt;

/// Ошибки операций пула (`start`, `add`, `results`, `wait`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PoolError {
    #[error("pool is not running")]
    NotRunning,
    #[error("pool has already been started")]
    AlreadyStarted,
    #[error("results disabled for pool")]
    ResultsDisabled,
    /// Отменён scope вызывающей стороны.
    #[error("operation cancelled by caller")]
    Cancelled,
    /// Отменён внутренний scope пула (родительский токен из `start`).
    #[error("pool context cancelled")]
    PoolCancelled,
    #[error("no tokio runtime available to spawn workers")]
    NoRuntime,
}

/// Ошибка одной задачи. Пул никогда не возвращает её из своих методов,
/// она приходит только внутри `JobResult`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError<E> {
    Failed(E),
    Panicked(String),
    Aborted(String),
}

impl<E> JobError<E> {
    pub fn is_panic(&self) -> bool {
        matches!(self, JobError::Panicked(_))
    }

    /// Ошибка самой задачи, если она вернула `Err`.
    pub fn into_failure(self) -> Option<E> {
        match self {
            JobError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for JobError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Failed(err) => write!(f, "job failed: {err}"),
            JobError::Panicked(msg) => write!(f, "job panicked: {msg}"),
            JobError::Aborted(msg) => write!(f, "job aborted: {msg}"),
        }
    }
}

impl<E> std::error::Error for JobError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JobError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
