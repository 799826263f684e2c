//! Request/response correlation for unary HTTP tunnels.
//!
//! Each outstanding request owns one slot keyed by its request id. A slot
//! resolves at most once: by the matching RESPONSE, by the timeout, or by
//! the control channel going away. Whatever comes later finds no slot and
//! is dropped.

use std::time::Duration;

use dashmap::DashMap;
use portway_shared::{Error, HttpResponse, Result};
use tokio::sync::oneshot;
use tracing::debug;

/// Default bound on a single request/response exchange
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct PendingRequests {
    slots: DashMap<String, oneshot::Sender<HttpResponse>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `id`. A stale slot with the same id is failed.
    pub fn register(&self, id: impl Into<String>) -> oneshot::Receiver<HttpResponse> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id.into(), tx);
        rx
    }

    /// Hand a response to its waiter. Returns false when no slot exists.
    pub fn resolve(&self, response: HttpResponse) -> bool {
        match self.slots.remove(&response.id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => {
                debug!("no pending request for response {}", response.id);
                false
            }
        }
    }

    pub fn cancel(&self, id: &str) {
        self.slots.remove(id);
    }

    /// Fail every outstanding slot; waiters see `TunnelUnavailable`
    pub fn fail_all(&self) -> usize {
        let ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.slots.remove(*id).is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Wait for the slot registered under `id`
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<HttpResponse>,
        timeout: Duration,
    ) -> Result<HttpResponse> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::TunnelUnavailable),
            Err(_) => {
                self.slots.remove(id);
                Err(Error::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn response(id: &str, status: u16) -> HttpResponse {
        HttpResponse {
            id: id.to_string(),
            status,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_delivers_exact_response() {
        let pending = PendingRequests::new();
        let rx = pending.register("r1");
        assert!(pending.resolve(response("r1", 201)));

        let got = pending.wait("r1", rx, DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(got.status, 201);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_second_response_is_ignored() {
        let pending = PendingRequests::new();
        let _rx = pending.register("r1");
        assert!(pending.resolve(response("r1", 200)));
        assert!(!pending.resolve(response("r1", 500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_not_before_deadline() {
        let pending = Arc::new(PendingRequests::new());
        let rx = pending.register("r1");
        let started = tokio::time::Instant::now();

        let err = pending
            .wait("r1", rx, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout));
        assert!(started.elapsed() >= Duration::from_secs(5));
        // the slot is gone, so a late response is dropped
        assert!(!pending.resolve(response("r1", 200)));
    }

    #[tokio::test]
    async fn test_fail_all_wakes_waiters() {
        let pending = Arc::new(PendingRequests::new());
        let rx = pending.register("r1");

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.wait("r1", rx, DEFAULT_TIMEOUT).await })
        };
        assert_eq!(pending.fail_all(), 1);

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::TunnelUnavailable)));
    }

    #[tokio::test]
    async fn test_slots_are_independent() {
        let pending = PendingRequests::new();
        let rx_a = pending.register("a");
        let rx_b = pending.register("b");

        assert!(pending.resolve(response("b", 204)));
        assert!(pending.resolve(response("a", 200)));

        assert_eq!(pending.wait("a", rx_a, DEFAULT_TIMEOUT).await.unwrap().status, 200);
        assert_eq!(pending.wait("b", rx_b, DEFAULT_TIMEOUT).await.unwrap().status, 204);
    }
}
