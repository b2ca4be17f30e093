use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::IndexerError;
use crate::metrics;

type ProcessFn<V> =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, Result<HashMap<String, V>, IndexerError>> + Send + Sync>;

type Waiter<V> = oneshot::Sender<Result<Option<V>, Arc<IndexerError>>>;

struct BatchState<V> {
    waiters: HashMap<String, Vec<Waiter<V>>>,
    timer: Option<JoinHandle<()>>,
}

struct BatcherInner<V> {
    max_size: usize,
    max_time: Duration,
    process: ProcessFn<V>,
    state: Mutex<BatchState<V>>,
}

/// Groups calls of the same kind inside a time/size window into one
/// multi-key request. `add` parks the caller on a oneshot; a flush (size
/// threshold or timer) runs `process` over the pending keys and fans the
/// keyed result back out. A key absent from the result resolves to `None`.
#[derive(Clone)]
pub struct Batcher<V> {
    inner: Arc<BatcherInner<V>>,
}

impl<V: Clone + Send + Sync + 'static> Batcher<V> {
    pub fn new<F>(max_size: usize, max_time: Duration, process: F) -> Self
    where
        F: Fn(Vec<String>) -> BoxFuture<'static, Result<HashMap<String, V>, IndexerError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            inner: Arc::new(BatcherInner {
                max_size,
                max_time,
                process: Arc::new(process),
                state: Mutex::new(BatchState {
                    waiters: HashMap::new(),
                    timer: None,
                }),
            }),
        }
    }

    pub async fn add(&self, key: &str) -> Result<Option<V>, IndexerError> {
        let (tx, rx) = oneshot::channel();

        let flush_now = {
            let mut state = self.inner.state.lock().await;
            state.waiters.entry(key.to_string()).or_default().push(tx);

            if state.waiters.len() >= self.inner.max_size {
                true
            } else {
                if state.timer.is_none() {
                    let inner = Arc::clone(&self.inner);
                    state.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(inner.max_time).await;
                        {
                            // Drop our own handle before flushing so the
                            // flush doesn't abort the task running it.
                            let mut state = inner.state.lock().await;
                            state.timer = None;
                        }
                        inner.flush().await;
                    }));
                }
                false
            }
        };

        if flush_now {
            self.inner.flush().await;
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(IndexerError::Shared(e)),
            Err(_) => Err(IndexerError::Canceled(key.to_string())),
        }
    }

    pub async fn flush(&self) {
        self.inner.flush().await;
    }
}

impl<V: Clone + Send + Sync + 'static> BatcherInner<V> {
    async fn flush(&self) {
        let waiters = {
            let mut state = self.state.lock().await;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut state.waiters)
        };

        if waiters.is_empty() {
            return;
        }

        let keys: Vec<String> = waiters.keys().cloned().collect();
        metrics::BATCH_SIZE.observe(keys.len() as f64);

        match (self.process)(keys).await {
            Ok(mut results) => {
                for (key, senders) in waiters {
                    let value = results.remove(&key);
                    for sender in senders {
                        let _ = sender.send(Ok(value.clone()));
                    }
                }
            }
            Err(e) => {
                let e = Arc::new(e);
                for (_, senders) in waiters {
                    for sender in senders {
                        let _ = sender.send(Err(Arc::clone(&e)));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn echo_batcher(max_size: usize, max_time: Duration, calls: Arc<AtomicU32>) -> Batcher<String> {
        Batcher::new(max_size, max_time, move |keys| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(keys
                    .into_iter()
                    .map(|k| (k.clone(), format!("value:{}", k)))
                    .collect())
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_when_size_threshold_reached() {
        let calls = Arc::new(AtomicU32::new(0));
        let batcher = echo_batcher(2, Duration::from_secs(60), calls.clone());

        let a = {
            let b = batcher.clone();
            tokio::spawn(async move { b.add("a").await })
        };
        tokio::task::yield_now().await;
        let b_result = batcher.add("b").await.unwrap();

        assert_eq!(b_result.as_deref(), Some("value:b"));
        assert_eq!(a.await.unwrap().unwrap().as_deref(), Some("value:a"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_timer() {
        let calls = Arc::new(AtomicU32::new(0));
        let batcher = echo_batcher(25, Duration::from_millis(100), calls.clone());

        let value = batcher.add("solo").await.unwrap();
        assert_eq!(value.as_deref(), Some("value:solo"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_keys_share_a_slot() {
        let calls = Arc::new(AtomicU32::new(0));
        let batcher = echo_batcher(25, Duration::from_millis(50), calls.clone());

        let first = {
            let b = batcher.clone();
            tokio::spawn(async move { b.add("dup").await })
        };
        tokio::task::yield_now().await;
        let second = batcher.add("dup").await.unwrap();

        assert_eq!(second.as_deref(), Some("value:dup"));
        assert_eq!(first.await.unwrap().unwrap().as_deref(), Some("value:dup"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_key_resolves_to_none() {
        let batcher: Batcher<String> = Batcher::new(25, Duration::from_millis(10), |_keys| {
            async { Ok(HashMap::new()) }.boxed()
        });
        assert!(batcher.add("absent").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn process_error_rejects_all_waiters() {
        let batcher: Batcher<String> = Batcher::new(2, Duration::from_secs(60), |_keys| {
            async { Err(IndexerError::InvalidRecord("batch failed".into())) }.boxed()
        });

        let first = {
            let b = batcher.clone();
            tokio::spawn(async move { b.add("x").await })
        };
        tokio::task::yield_now().await;
        let second = batcher.add("y").await;

        assert!(matches!(second, Err(IndexerError::Shared(_))));
        assert!(first.await.unwrap().is_err());
    }
}
