//! Client-side response correlation.
//!
//! Every request carries a fresh non-zero response id; the router keeps a
//! waiter per outstanding id and completes it when the matching response
//! frame arrives. Ids that time out are completed with `Timeout` and
//! removed; duplicates for an already-completed id are dropped; disconnect
//! drains everything with `Aborted`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::RequestError;

type ResponseResult = Result<Bytes, RequestError>;

/// response-id → waiter table plus the id allocator.
pub struct ResponseRouter {
    waiters: Mutex<HashMap<u32, oneshot::Sender<ResponseResult>>>,
    next_id: AtomicU32,
}

impl ResponseRouter {
    /// Create an empty router. Ids start at 1; 0 stays reserved for
    /// fire-and-forget.
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocate a fresh non-zero response id.
    pub fn allocate(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Store a waiter for `id` and hand back its receiving half.
    pub fn register(&self, id: u32) -> oneshot::Receiver<ResponseResult> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        rx
    }

    /// Complete the waiter for `id` with a response payload.
    ///
    /// Returns false when no waiter exists (duplicate or expired response),
    /// in which case the payload is dropped.
    pub fn complete(&self, id: u32, payload: Bytes) -> bool {
        let Some(tx) = self.waiters.lock().remove(&id) else {
            debug!(id, "response with no waiter dropped");
            return false;
        };
        let _ = tx.send(Ok(payload));
        true
    }

    /// Remove the waiter for `id` without completing it (timeout cleanup).
    pub fn cancel(&self, id: u32) -> bool {
        self.waiters.lock().remove(&id).is_some()
    }

    /// Drain every waiter with `Aborted`.
    pub fn fail_all(&self) {
        let drained: Vec<_> = {
            let mut waiters = self.waiters.lock();
            waiters.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(RequestError::Aborted));
        }
    }

    /// Outstanding waiter count.
    pub fn pending(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Default for ResponseRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_non_zero_and_distinct() {
        let router = ResponseRouter::new();
        let a = router.allocate();
        let b = router.allocate();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn complete_delivers_payload() {
        let router = ResponseRouter::new();
        let id = router.allocate();
        let rx = router.register(id);

        assert!(router.complete(id, Bytes::from_static(b"pong")));
        let got = rx.await.unwrap().unwrap();
        assert_eq!(&got[..], b"pong");
        assert_eq!(router.pending(), 0);
    }

    #[test]
    fn duplicate_completion_is_dropped() {
        let router = ResponseRouter::new();
        let id = router.allocate();
        let _rx = router.register(id);

        assert!(router.complete(id, Bytes::from_static(b"first")));
        assert!(!router.complete(id, Bytes::from_static(b"dup")));
    }

    #[test]
    fn cancel_removes_the_waiter() {
        let router = ResponseRouter::new();
        let id = router.allocate();
        let mut rx = router.register(id);

        assert!(router.cancel(id));
        assert!(!router.complete(id, Bytes::new()));
        // sender side is gone
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fail_all_aborts_every_waiter() {
        let router = ResponseRouter::new();
        let rx1 = router.register(router.allocate());
        let rx2 = router.register(router.allocate());

        router.fail_all();
        assert!(matches!(rx1.await.unwrap(), Err(RequestError::Aborted)));
        assert!(matches!(rx2.await.unwrap(), Err(RequestError::Aborted)));
        assert_eq!(router.pending(), 0);
    }
}
