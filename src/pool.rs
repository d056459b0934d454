use super::{
    errors::{panic_message, JobError, PoolError},
    handle::ResultHandle,
    latch::Latch,
    model::{PoolMetrics, PoolState},
    result::{BoxError, JobResult},
};
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use futures::{future::BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot, Mutex as AsyncMutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};


pub const DEFAULT_JOB_BUFFER: usize = 10;
/// Запас очереди результатов сверх `job_buffer`. Снижает (но не исключает)
/// блокировки воркеров на отправке результата во время drain.
pub const DEFAULT_RESULT_SLACK: usize = 2;

/// Конфигурация пула
#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    pub job_buffer: usize,
    pub results_enabled: bool,
    pub result_slack: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            job_buffer: DEFAULT_JOB_BUFFER,
            results_enabled: true,
            result_slack: DEFAULT_RESULT_SLACK,
        }
    }
}

impl Config {
    /// Fire-and-forget: задачи выполняются, результаты никуда не отправляются.
    pub fn without_results() -> Self {
        Self {
            results_enabled: false,
            ..Default::default()
        }
    }

    fn normalized(mut self) -> Self {
        if self.workers == 0 {
            warn!("worker count must be positive, falling back to 1");
            self.workers = 1;
        }
        self
    }

    // tokio mpsc не умеет канал нулевой ёмкости: при 0 используется одна ячейка,
    // а `add` дополнительно ждёт, пока воркер заберёт задачу
    #[inline]
    fn job_capacity(&self) -> usize {
        self.job_buffer.max(1)
    }

    #[inline]
    fn is_rendezvous(&self) -> bool {
        self.job_buffer == 0
    }

    #[inline]
    fn result_capacity(&self) -> usize {
        (self.job_buffer + self.result_slack).max(1)
    }
}


type Job<T, E> = BoxFuture<'static, JobResult<T, E>>;

/// Задача в очереди. `claimed` есть только в режиме rendezvous.
struct Envelope<T, E> {
    job: Job<T, E>,
    claimed: Option<oneshot::Sender<()>>,
}

/// Ожидание, пока воркер заберёт задачу (rendezvous).
///
/// Если `add` прерван (отмена или drop future) до того, как воркер забрал
/// задачу, она отзывается и счётчик возвращается назад.
struct PendingClaim<'a> {
    claimed: oneshot::Receiver<()>,
    outstanding: &'a Latch,
    settled: bool,
}

impl PendingClaim<'_> {
    /// `true`, если воркер успел забрать задачу до отзыва.
    fn withdraw(&mut self) -> bool {
        self.settled = true;
        self.claimed.close();
        if self.claimed.try_recv().is_ok() {
            return true;
        }
        self.outstanding.done();
        false
    }
}

impl Drop for PendingClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.withdraw();
        }
    }
}

enum Lifecycle {
    Created,
    Running(CancellationToken),
    Stopped,
}

struct Shared<T, E> {
    config: Config,
    state: RwLock<Lifecycle>,
    jobs_tx: Mutex<Option<mpsc::Sender<Envelope<T, E>>>>,
    jobs_rx: AsyncMutex<mpsc::Receiver<Envelope<T, E>>>,
    results_tx: Mutex<Option<mpsc::Sender<JobResult<T, E>>>>,
    results_rx: Option<Arc<AsyncMutex<mpsc::Receiver<JobResult<T, E>>>>>,
    outstanding: Latch,
    live_workers: Latch,
    submitted: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

struct WorkerGuard<'a>(&'a Latch);

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        self.0.done();
    }
}

impl<T, E> Shared<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    async fn next_job(&self) -> Option<Envelope<T, E>> {
        self.jobs_rx.lock().await.recv().await
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        token: CancellationToken,
        results: Option<mpsc::Sender<JobResult<T, E>>>,
    ) {
        let _guard = WorkerGuard(&self.live_workers);
        trace!(worker_id, "worker started");

        loop {
            let Envelope { job, claimed } = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                envelope = self.next_job() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            // отправитель уже отозвал задачу, она не посчитана
            if let Some(claimed) = claimed {
                if claimed.send(()).is_err() {
                    trace!(worker_id, "job withdrawn before claim, skipped");
                    continue;
                }
            }

            let result = match AssertUnwindSafe(job).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(JobError::Panicked(panic_message(&*payload))),
            };

            if result.is_ok() {
                self.completed.fetch_add(1, Ordering::Relaxed);
            } else {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }

            // результат должен стать видимым до уменьшения счётчика
            if let Some(tx) = &results {
                tokio::select! {
                    biased;
                    sent = tx.send(result) => {
                        if sent.is_err() {
                            trace!(worker_id, "result queue closed, result dropped");
                        }
                    }
                    _ = token.cancelled() => {
                        trace!(worker_id, "pool cancelled, result dropped");
                    }
                }
            }
            self.outstanding.done();
        }

        trace!(worker_id, "worker stopped");
    }
}


/// Ограниченный пул воркеров.
///
/// Жизненный цикл: `new` -> `start` -> `add`/`results` -> `wait`.
/// Пул одноразовый, после успешного `wait` все операции возвращают
/// [`PoolError::NotRunning`].
pub struct Pool<T, E = BoxError> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Default for Pool<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl<T, E> Pool<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new(config: Config) -> Self {
        let config = config.normalized();
        let (jobs_tx, jobs_rx) = mpsc::channel(config.job_capacity());
        let (results_tx, results_rx) = if config.results_enabled {
            let (tx, rx) = mpsc::channel(config.result_capacity());
            (Some(tx), Some(Arc::new(AsyncMutex::new(rx))))
        } else {
            (None, None)
        };

        let shared = Arc::new(Shared {
            config,
            state: RwLock::new(Lifecycle::Created),
            jobs_tx: Mutex::new(Some(jobs_tx)),
            jobs_rx: AsyncMutex::new(jobs_rx),
            results_tx: Mutex::new(results_tx),
            results_rx,
            outstanding: Latch::new(),
            live_workers: Latch::new(),
            submitted: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });

        Self { shared }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Запускает воркеров. Внутренний scope пула становится дочерним для `parent`:
    /// отмена `parent` аварийно останавливает пул.
    pub fn start(&self, parent: &CancellationToken) -> Result<(), PoolError> {
        let runtime = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;
        let workers = self.shared.config.workers;

        // воркеры регистрируются под тем же локом, что и смена состояния,
        // поэтому конкурентный wait не увидит Running без живых воркеров
        let mut state = self.shared.state.write();
        if !matches!(*state, Lifecycle::Created) {
            return Err(PoolError::AlreadyStarted);
        }
        let token = parent.child_token();
        *state = Lifecycle::Running(token.clone());

        let results = self.shared.results_tx.lock().clone();
        for worker_id in 0..workers {
            self.shared.live_workers.add();
            runtime.spawn(
                self.shared
                    .clone()
                    .worker_loop(worker_id, token.clone(), results.clone()),
            );
        }
        drop(state);

        debug!(
            workers,
            job_buffer = self.shared.config.job_buffer,
            results_enabled = self.shared.config.results_enabled,
            "pool started"
        );
        Ok(())
    }

    fn running_token(&self) -> Result<CancellationToken, PoolError> {
        match &*self.shared.state.read() {
            Lifecycle::Running(token) => Ok(token.clone()),
            _ => Err(PoolError::NotRunning),
        }
    }

    /// Добавляет асинхронную задачу. Блокируется, пока очередь заполнена.
    pub async fn add<F>(&self, scope: &CancellationToken, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let job = job.map(|result| result.map_err(JobError::Failed)).boxed();
        self.submit(scope, job).await
    }

    /// Добавляет синхронную задачу, она выполнится в `spawn_blocking`.
    pub async fn add_blocking<F>(&self, scope: &CancellationToken, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let job = async move {
            match tokio::task::spawn_blocking(f).await {
                Ok(result) => result.map_err(JobError::Failed),
                Err(join_err) if join_err.is_panic() => {
                    Err(JobError::Panicked(panic_message(&*join_err.into_panic())))
                }
                Err(join_err) => Err(JobError::Aborted(join_err.to_string())),
            }
        };
        self.submit(scope, job.boxed()).await
    }

    async fn submit(&self, scope: &CancellationToken, job: Job<T, E>) -> Result<(), PoolError> {
        let pool_token = self.running_token()?;
        let sender = self
            .shared
            .jobs_tx
            .lock()
            .clone()
            .ok_or(PoolError::NotRunning)?;

        let permit = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(PoolError::Cancelled),
            _ = pool_token.cancelled() => return Err(self.pool_cancelled_error()),
            permit = sender.reserve() => permit.map_err(|_| PoolError::NotRunning)?,
        };

        // счётчик растёт до того, как задачу увидит воркер
        if !self.shared.outstanding.add() {
            return Err(PoolError::NotRunning);
        }

        if !self.shared.config.is_rendezvous() {
            permit.send(Envelope { job, claimed: None });
            self.shared.submitted.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let (claimed_tx, claimed_rx) = oneshot::channel();
        permit.send(Envelope {
            job,
            claimed: Some(claimed_tx),
        });
        self.await_claim(scope, &pool_token, claimed_rx).await?;
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn await_claim(
        &self,
        scope: &CancellationToken,
        pool_token: &CancellationToken,
        claimed: oneshot::Receiver<()>,
    ) -> Result<(), PoolError> {
        let mut pending = PendingClaim {
            claimed,
            outstanding: &self.shared.outstanding,
            settled: false,
        };

        let err = tokio::select! {
            biased;
            _ = scope.cancelled() => PoolError::Cancelled,
            _ = pool_token.cancelled() => self.pool_cancelled_error(),
            ack = &mut pending.claimed => match ack {
                Ok(()) => {
                    pending.settled = true;
                    return Ok(());
                }
                Err(_) => PoolError::PoolCancelled,
            },
        };

        if pending.withdraw() {
            Ok(())
        } else {
            Err(err)
        }
    }

    // внутренний scope отменяет и штатный drain в `wait`, это не авария
    fn pool_cancelled_error(&self) -> PoolError {
        if self.shared.outstanding.is_sealed() {
            PoolError::NotRunning
        } else {
            PoolError::PoolCancelled
        }
    }

    pub fn results(&self) -> Result<ResultHandle<T, E>, PoolError> {
        self.running_token()?;

        match &self.shared.results_rx {
            Some(receiver) => Ok(ResultHandle::new(receiver.clone())),
            None => Err(PoolError::ResultsDisabled),
        }
    }

    /// Ждёт завершения всех принятых задач и останавливает пул.
    ///
    /// Отмена `scope` прерывает только ожидание: пул остаётся `Running`,
    /// `wait` можно вызвать снова. Если отменён родительский scope пула,
    /// пул разбирается и возвращается [`PoolError::PoolCancelled`].
    pub async fn wait(&self, scope: &CancellationToken) -> Result<(), PoolError> {
        let pool_token = self.running_token()?;

        let outcome = tokio::select! {
            biased;
            _ = scope.cancelled() => return Err(PoolError::Cancelled),
            _ = self.shared.outstanding.seal_when_zero() => Ok(()),
            _ = pool_token.cancelled() => Err(PoolError::PoolCancelled),
        };

        if outcome.is_ok() {
            debug!("all jobs drained");
            pool_token.cancel();
        } else {
            warn!(
                outstanding = self.shared.outstanding.count(),
                "pool cancelled before drain, queued jobs discarded"
            );
        }

        self.shutdown().await;
        outcome
    }

    async fn shutdown(&self) {
        // сначала очередь задач, потом результатов: после drain никто уже не пишет
        drop(self.shared.jobs_tx.lock().take());
        drop(self.shared.results_tx.lock().take());

        self.shared.live_workers.wait_zero().await;
        *self.shared.state.write() = Lifecycle::Stopped;
        debug!("pool stopped");
    }

    pub fn state(&self) -> PoolState {
        match &*self.shared.state.read() {
            Lifecycle::Created => PoolState::Created,
            Lifecycle::Running(_) => PoolState::Running,
            Lifecycle::Stopped => PoolState::Stopped,
        }
    }

    #[inline]
    pub fn metrics(&self) -> PoolMetrics {
        let queued_jobs = self
            .shared
            .jobs_tx
            .lock()
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0);

        PoolMetrics {
            workers: self.shared.config.workers,
            live_workers: self.shared.live_workers.count(),
            outstanding_jobs: self.shared.outstanding.count(),
            queued_jobs,
            submitted_jobs: self.shared.submitted.load(Ordering::Relaxed),
            completed_jobs: self.shared.completed.load(Ordering::Relaxed),
            failed_jobs: self.shared.failed.load(Ordering::Relaxed),
        }
    }
}

impl<T, E> Drop for Pool<T, E> {
    fn drop(&mut self) {
        // воркеры держат Arc на общее состояние, без отмены они бы не завершились
        if let Lifecycle::Running(token) = &*self.shared.state.read() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, Pool};
    use crate::{errors::PoolError, CancellationToken};

    #[tokio::test]
    async fn add_after_drain_started_is_not_running() {
        let pool = Pool::<i32, String>::new(Config {
            workers: 1,
            ..Config::without_results()
        });
        let ctx = CancellationToken::new();
        pool.start(&ctx).unwrap();

        // состояние между печатью счётчика и остановкой воркеров в `wait`
        pool.shared.outstanding.seal_when_zero().await;
        pool.running_token().unwrap().cancel();

        assert_eq!(
            pool.add(&ctx, async { Ok(1) }).await,
            Err(PoolError::NotRunning)
        );
        assert_eq!(pool.shared.outstanding.count(), 0);
    }
}
