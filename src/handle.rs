use super::result::JobResult;
use futures::stream::{self, Stream};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};


/// Handle на очередь результатов.
///
/// Все клоны читают из одного и того же получателя. Последовательность
/// конечна: после закрытия очереди при shutdown `next()` всегда возвращает `None`.
pub struct ResultHandle<T, E> {
    receiver: Arc<Mutex<mpsc::Receiver<JobResult<T, E>>>>,
}

impl<T, E> Clone for ResultHandle<T, E> {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
        }
    }
}

impl<T, E> ResultHandle<T, E> {

    pub(crate) fn new(receiver: Arc<Mutex<mpsc::Receiver<JobResult<T, E>>>>) -> Self {
        Self { receiver }
    }

    #[inline]
    pub async fn next(&self) -> Option<JobResult<T, E>> {
        self.receiver.lock().await.recv().await
    }

    /// Вычитывает очередь до конца. Завершится только после `Pool::wait`.
    pub async fn collect(&self) -> Vec<JobResult<T, E>> {
        let mut results = Vec::new();
        while let Some(result) = self.next().await {
            results.push(result);
        }
        results
    }

    pub fn into_stream(self) -> impl Stream<Item = JobResult<T, E>> {
        stream::unfold(self, |handle| async move {
            let item = handle.next().await?;
            Some((item, handle))
        })
    }
}
