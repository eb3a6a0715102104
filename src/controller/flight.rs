//! Keyed single-flight.
//!
//! Concurrent callers for the same cache key share one in-flight operation.
//! The shared result carries its TTL so followers can reuse it directly.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::cache::lock::mutex_lock;
use crate::domain::ProxyError;

const SOURCE: &str = "controller::flight";

pub type TtlBytes = (Bytes, Duration);
type SharedCall = Shared<BoxFuture<'static, Result<TtlBytes, ProxyError>>>;

/// Deduplicates concurrent calls per key by handing followers a clone of the
/// leader's shared future.
#[derive(Default)]
pub struct Flight {
    inflight: Mutex<HashMap<String, SharedCall>>,
}

impl Flight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key`, or await the already-running call for it.
    pub async fn run<F>(&self, key: &str, make: F) -> Result<TtlBytes, ProxyError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<TtlBytes, ProxyError>>,
    {
        let (call, leader) = {
            let mut inflight = mutex_lock(&self.inflight, SOURCE, "run");
            match inflight.get(key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let call = make().shared();
                    inflight.insert(key.to_string(), call.clone());
                    (call, true)
                }
            }
        };

        let result = call.await;

        if leader {
            mutex_lock(&self.inflight, SOURCE, "cleanup").remove(key);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flight = Arc::new(Flight::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                flight
                    .run("a1", move || {
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok((Bytes::from_static(b"shared"), Duration::from_secs(60)))
                        }
                        .boxed()
                    })
                    .await
            }));
        }

        for handle in handles {
            let (value, ttl) = handle.await.expect("task").expect("result");
            assert_eq!(value, Bytes::from_static(b"shared"));
            assert_eq!(ttl, Duration::from_secs(60));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_share() {
        let flight = Flight::new();
        let calls = Arc::new(AtomicU32::new(0));

        for key in ["a1", "a2"] {
            let calls = Arc::clone(&calls);
            let result = flight
                .run(key, move || {
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok((Bytes::from_static(b"x"), Duration::from_secs(1)))
                    }
                    .boxed()
                })
                .await;
            assert!(result.is_ok());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn errors_are_shared_then_cleared() {
        let flight = Flight::new();

        let result = flight
            .run("a1", || async { Err(ProxyError::NotFound) }.boxed())
            .await;
        assert_eq!(result, Err(ProxyError::NotFound));

        // The key is free again after completion.
        let result = flight
            .run("a1", || {
                async { Ok((Bytes::from_static(b"fresh"), Duration::from_secs(1))) }.boxed()
            })
            .await;
        assert!(result.is_ok());
    }
}
