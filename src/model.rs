/// Состояние жизненного цикла пула. Переходы только вперёд.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub workers: usize,
    pub live_workers: usize,
    /// Принятые, но ещё не завершённые задачи.
    pub outstanding_jobs: usize,
    pub queued_jobs: usize,
    pub submitted_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
}

impl PoolMetrics {
    /// Доля воркеров, занятых выполнением задачи.
    pub fn utilization(&self) -> f64 {
        if self.live_workers == 0 {
            return 0.0;
        }
        let busy = self.outstanding_jobs.saturating_sub(self.queued_jobs);
        busy.min(self.live_workers) as f64 / self.live_workers as f64
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.completed_jobs + self.failed_jobs;
        if total == 0 {
            return 1.0;
        }
        self.completed_jobs as f64 / total as f64
    }
}
