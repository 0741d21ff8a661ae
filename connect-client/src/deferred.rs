//! Replay of deferred calls
//!
//! A drain walks the queue in insertion order. Each unclaimed entry is
//! claimed, then either submitted directly or handed to the registered
//! [`DeferredCallHandler`]. Entries are deleted only after a successful
//! submission; failures release the claim and are reported together once
//! the pass is over.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::error::{ConnectError, Result};
use crate::queue::{DeferredCall, RequestQueue};

/// Submits one stored call to the server
#[async_trait]
pub trait SubmitCall: Send + Sync {
    async fn submit_call(&self, call: &DeferredCall) -> Result<Value>;
}

/// Handle given to a [`DeferredCallHandler`] for one entry
pub struct DeferredCallSubmitter<'a> {
    call: DeferredCall,
    submitter: &'a dyn SubmitCall,
    keep: AtomicBool,
}

impl<'a> DeferredCallSubmitter<'a> {
    fn new(call: DeferredCall, submitter: &'a dyn SubmitCall) -> Self {
        Self {
            call,
            submitter,
            keep: AtomicBool::new(false),
        }
    }

    pub fn deferred_call(&self) -> &DeferredCall {
        &self.call
    }

    /// Send the call to the server now
    pub async fn submit(&self) -> Result<Value> {
        self.submitter.submit_call(&self.call).await
    }

    /// Keep the entry after this pass even if the handler succeeds
    pub fn keep_in_the_queue(&self) {
        self.keep.store(true, Ordering::SeqCst);
    }

    pub fn is_kept(&self) -> bool {
        self.keep.load(Ordering::SeqCst)
    }
}

/// Caller-supplied policy for replaying entries.
///
/// Returning `Ok` deletes the entry unless `keep_in_the_queue()` was called;
/// returning `Err` keeps it and reports the error.
#[async_trait]
pub trait DeferredCallHandler: Send + Sync {
    async fn handle_deferred_call_submission(
        &self,
        submitter: &DeferredCallSubmitter<'_>,
    ) -> Result<()>;
}

/// Claim on one entry; released on drop unless settled
struct Claim<'a> {
    queue: &'a RequestQueue,
    id: u64,
    settled: bool,
}

impl<'a> Claim<'a> {
    fn new(queue: &'a RequestQueue, id: u64) -> Self {
        Self {
            queue,
            id,
            settled: false,
        }
    }

    fn remove(mut self) -> Result<()> {
        self.settled = true;
        self.queue.remove(self.id)
    }

    fn release(mut self) -> Result<()> {
        self.settled = true;
        self.queue.release(self.id)
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        debug!(id = self.id, "Drain interrupted, releasing deferred call");
        if let Err(e) = self.queue.release(self.id) {
            warn!(id = self.id, error = %e, "Failed to release deferred call");
        }
    }
}

/// Drains a [`RequestQueue`]
pub struct DeferredCallProcessor {
    queue: RequestQueue,
    handler: RwLock<Option<Arc<dyn DeferredCallHandler>>>,
}

impl DeferredCallProcessor {
    pub fn new(queue: RequestQueue) -> Self {
        Self {
            queue,
            handler: RwLock::new(None),
        }
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn set_handler(&self, handler: Option<Arc<dyn DeferredCallHandler>>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    fn handler(&self) -> Option<Arc<dyn DeferredCallHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one pass over the queue and return how many entries were delivered.
    ///
    /// Fails with [`ConnectError::DeferredCalls`] when any entry failed; the
    /// remaining entries are still attempted.
    pub async fn process(&self, submitter: &dyn SubmitCall) -> Result<usize> {
        let handler = self.handler();
        let mut errors = Vec::new();
        let mut delivered = 0;

        for entry in self.queue.list()? {
            if entry.submitting {
                continue;
            }
            let call = match self.queue.claim(entry.id) {
                Ok(Some(call)) => call,
                Ok(None) => {
                    debug!(id = entry.id, "Deferred call claimed elsewhere");
                    continue;
                }
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            let claim = Claim::new(&self.queue, call.id);

            let outcome = match &handler {
                Some(handler) => {
                    let call_submitter = DeferredCallSubmitter::new(call.clone(), submitter);
                    handler
                        .handle_deferred_call_submission(&call_submitter)
                        .await
                        .map(|()| !call_submitter.is_kept())
                }
                None => submitter.submit_call(&call).await.map(|_| true),
            };

            let settled = match outcome {
                Ok(true) => claim.remove().map(|()| delivered += 1),
                Ok(false) => {
                    debug!(id = call.id, "Deferred call kept in the queue");
                    claim.release()
                }
                Err(e) => {
                    warn!(id = call.id, endpoint = %call.endpoint, method = %call.method, error = %e, "Deferred call failed");
                    errors.push(e);
                    claim.release()
                }
            };
            if let Err(e) = settled {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            if delivered > 0 {
                info!(delivered, "Deferred calls submitted");
            }
            Ok(delivered)
        } else {
            warn!(delivered, failed = errors.len(), "Deferred call drain finished with failures");
            Err(ConnectError::DeferredCalls(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ClientStorage;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeServer {
        calls: AtomicUsize,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl SubmitCall for FakeServer {
        async fn submit_call(&self, call: &DeferredCall) -> Result<Value> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ConnectError::Response {
                    status: 500,
                    body: "Unexpected error".into(),
                })
            } else {
                Ok(json!({ "method": call.method }))
            }
        }
    }

    async fn queue_with(n: usize) -> RequestQueue {
        let storage = ClientStorage::temporary().unwrap();
        let queue = RequestQueue::open(&storage).unwrap();
        for i in 0..n {
            queue
                .push("FooEndpoint", "fooMethod", Some(json!({ "fooParam": i })))
                .await
                .unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn test_successful_drain_empties_queue() {
        let processor = DeferredCallProcessor::new(queue_with(3).await);
        let server = FakeServer::default();

        let delivered = processor.process(&server).await.unwrap();

        assert_eq!(delivered, 3);
        assert_eq!(server.calls.load(Ordering::SeqCst), 3);
        assert!(processor.queue().is_empty());
    }

    #[tokio::test]
    async fn test_failed_drain_keeps_entries_and_aggregates_errors() {
        let processor = DeferredCallProcessor::new(queue_with(3).await);
        let server = FakeServer {
            fail: true,
            ..Default::default()
        };

        let err = processor.process(&server).await.unwrap_err();

        match err {
            ConnectError::DeferredCalls(errors) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
        let remaining = processor.queue().list().unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|c| !c.submitting));
    }

    #[tokio::test]
    async fn test_concurrent_drains_submit_once() {
        let processor = DeferredCallProcessor::new(queue_with(1).await);
        let server = FakeServer {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };

        let (a, b, c) = tokio::join!(
            processor.process(&server),
            processor.process(&server),
            processor.process(&server)
        );

        assert_eq!(a.unwrap() + b.unwrap() + c.unwrap(), 1);
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
        assert!(processor.queue().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_drain_releases_claim() {
        let processor = DeferredCallProcessor::new(queue_with(1).await);
        let slow = FakeServer {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        };

        let interrupted =
            tokio::time::timeout(Duration::from_millis(20), processor.process(&slow)).await;
        assert!(interrupted.is_err());
        assert!(processor.queue().list().unwrap().iter().all(|c| !c.submitting));

        let server = FakeServer::default();
        assert_eq!(processor.process(&server).await.unwrap(), 1);
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
        assert!(processor.queue().is_empty());
    }

    struct KeepEverything;

    #[async_trait]
    impl DeferredCallHandler for KeepEverything {
        async fn handle_deferred_call_submission(&self, submitter: &DeferredCallSubmitter<'_>) -> Result<()> {
            submitter.submit().await?;
            submitter.keep_in_the_queue();
            Ok(())
        }
    }

    struct SubmitAndDelete;

    #[async_trait]
    impl DeferredCallHandler for SubmitAndDelete {
        async fn handle_deferred_call_submission(&self, submitter: &DeferredCallSubmitter<'_>) -> Result<()> {
            assert_eq!(submitter.deferred_call().endpoint, "FooEndpoint");
            submitter.submit().await.map(|_| ())
        }
    }

    #[tokio::test]
    async fn test_handler_can_keep_entries() {
        let processor = DeferredCallProcessor::new(queue_with(2).await);
        processor.set_handler(Some(Arc::new(KeepEverything)));
        let server = FakeServer::default();

        let delivered = processor.process(&server).await.unwrap();

        assert_eq!(delivered, 0);
        assert_eq!(server.calls.load(Ordering::SeqCst), 2);
        let remaining = processor.queue().list().unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|c| !c.submitting));
    }

    #[tokio::test]
    async fn test_handler_success_deletes_entries() {
        let processor = DeferredCallProcessor::new(queue_with(2).await);
        processor.set_handler(Some(Arc::new(SubmitAndDelete)));
        let server = FakeServer::default();

        assert_eq!(processor.process(&server).await.unwrap(), 2);
        assert!(processor.queue().is_empty());
    }

    #[tokio::test]
    async fn test_handler_error_keeps_entry() {
        let processor = DeferredCallProcessor::new(queue_with(1).await);
        processor.set_handler(Some(Arc::new(SubmitAndDelete)));
        let server = FakeServer {
            fail: true,
            ..Default::default()
        };

        assert!(processor.process(&server).await.is_err());
        assert_eq!(processor.queue().len(), 1);
    }
}
