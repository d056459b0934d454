use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

const SEALED: usize = 1 << (usize::BITS - 1);

/// Счётчик с ожиданием нуля (аналог WaitGroup).
///
/// Старший бит хранит флаг "запечатан": после `seal_when_zero` новые `add`
/// отклоняются, так что задача не может проскочить мимо завершившегося drain.
pub(crate) struct Latch {
    state: AtomicUsize,
    notify: Notify,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Возвращает `false`, если счётчик уже запечатан.
    #[inline]
    pub(crate) fn add(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & SEALED != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    pub(crate) fn done(&self) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & !SEALED > 0, "latch counter underflow");
        if prev & !SEALED == 1 {
            self.notify.notify_waiters();
        }
    }

    #[inline]
    pub(crate) fn is_sealed(&self) -> bool {
        self.state.load(Ordering::Acquire) & SEALED != 0
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.state.load(Ordering::Acquire) & !SEALED
    }

    pub(crate) async fn wait_zero(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Ждёт нуля и атомарно запечатывает счётчик.
    pub(crate) async fn seal_when_zero(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self
                .state
                .compare_exchange(0, SEALED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) if actual & !SEALED == 0 => return,
                Err(_) => notified.await,
            }
        }
    }
}
