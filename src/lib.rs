//! Ограниченный пул воркеров поверх tokio
//!
//! # Features
//! - Фиксированное число воркеров и ограниченная очередь задач (backpressure)
//! - Опциональная очередь результатов
//! - Отмена через `CancellationToken` на стороне пула и вызывающего
//! - Детерминированный drain и shutdown без потери результатов
//! - Паника в задаче не роняет воркера

pub mod errors;
pub mod handle;
mod latch;
pub mod model;
pub mod pool;
pub mod result;

pub use errors::{JobError, PoolError};
pub use handle::ResultHandle;
pub use model::{PoolMetrics, PoolState};
pub use pool::{Config, Pool};
pub use result::{BoxError, JobResult};
pub use tokio_util::sync::CancellationToken;
