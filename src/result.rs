use super::errors::JobError;

/// Результат одной задачи: значение либо ошибка задачи.
pub type JobResult<T, E> = Result<T, JobError<E>>;

/// Ошибка задачи по умолчанию, аналог "любой ошибки".
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
