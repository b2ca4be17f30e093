use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use crate::error::IndexerError;

type SharedResult<T> = Result<T, Arc<IndexerError>>;
type InFlight<T> = Shared<BoxFuture<'static, SharedResult<T>>>;

/// Deduplicates concurrent requests by id: while a call for an id is in
/// flight, later callers attach to the same future instead of issuing a
/// duplicate request. Entries remove themselves on completion, so a
/// finished result is never served stale.
pub struct RequestGroup<T: Clone> {
    inflight: Arc<Mutex<HashMap<String, InFlight<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> RequestGroup<T> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run<F>(&self, id: &str, make: F) -> Result<T, IndexerError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, IndexerError>>,
    {
        let shared = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(id) {
                Some(existing) => existing.clone(),
                None => {
                    let map = Arc::clone(&self.inflight);
                    let key = id.to_string();
                    let fut = make();
                    let wrapped: BoxFuture<'static, SharedResult<T>> = async move {
                        let result = fut.await.map_err(Arc::new);
                        map.lock().await.remove(&key);
                        result
                    }
                    .boxed();
                    let shared = wrapped.shared();
                    inflight.insert(id.to_string(), shared.clone());
                    shared
                }
            }
        };

        shared.await.map_err(IndexerError::Shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_calls_share_one_issuance() {
        let group = Arc::new(RequestGroup::<u32>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut joins = Vec::new();
        for _ in 0..5 {
            let group = group.clone();
            let calls = calls.clone();
            joins.push(tokio::spawn(async move {
                group
                    .run("same-id", move || {
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(7)
                        }
                        .boxed()
                    })
                    .await
            }));
        }

        for join in joins {
            assert_eq!(join.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_calls_issue_again() {
        let group = RequestGroup::<u32>::new();
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let value = group
                .run("id", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(1) }.boxed()
                })
                .await
                .unwrap();
            assert_eq!(value, 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn errors_propagate_to_all_waiters() {
        let group = Arc::new(RequestGroup::<u32>::new());

        let g1 = group.clone();
        let first = tokio::spawn(async move {
            g1.run("boom", || {
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err(IndexerError::InvalidRecord("boom".into()))
                }
                .boxed()
            })
            .await
        });
        // Give the first call time to register.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = group
            .run("boom", || async { Ok(0) }.boxed())
            .await;

        assert!(first.await.unwrap().is_err());
        assert!(matches!(second, Err(IndexerError::Shared(_))));
    }
}
