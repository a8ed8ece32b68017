use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use strand_core::error::{Result, StrandError};
use strand_core::event::EventEnvelope;

/// An event externalized by a feature for message processors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureMessage {
    /// Key of the feature that produced the message.
    pub feature: String,
    #[serde(flatten)]
    pub envelope: EventEnvelope,
}

impl FeatureMessage {
    pub fn new(feature: impl Into<String>, envelope: EventEnvelope) -> Self {
        Self {
            feature: feature.into(),
            envelope,
        }
    }
}

/// Consumer of feature messages (log sinks, remote writers, ...).
pub trait MessageProcessor: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Called before the first message of a run.
    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn process_message(&self, message: FeatureMessage) -> BoxFuture<'_, Result<()>>;

    /// Called once the last run using this processor has ended.
    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

pub type MessageFilter = Arc<dyn Fn(&FeatureMessage) -> bool + Send + Sync>;

/// A processor as attached to a pipeline: a mutable filter, an open/closed
/// signal and a use count shared by concurrent runs.
pub struct ProcessorHandle {
    processor: Arc<dyn MessageProcessor>,
    filter: RwLock<MessageFilter>,
    open: watch::Sender<bool>,
    users: Mutex<usize>,
}

impl ProcessorHandle {
    pub(crate) fn new(processor: Arc<dyn MessageProcessor>) -> Self {
        let (open, _) = watch::channel(false);
        Self {
            processor,
            filter: RwLock::new(Arc::new(|_: &FeatureMessage| true)),
            open,
            users: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &str {
        self.processor.name()
    }

    pub fn processor(&self) -> &Arc<dyn MessageProcessor> {
        &self.processor
    }

    /// Replace the filter. Messages it rejects never reach `process_message`.
    pub fn set_filter(&self, filter: impl Fn(&FeatureMessage) -> bool + Send + Sync + 'static) {
        let mut guard = self.filter.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(filter);
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Watch the open/closed state.
    pub fn subscribe_open(&self) -> watch::Receiver<bool> {
        self.open.subscribe()
    }

    /// Filter, then forward. Returns whether the processor received the message.
    pub async fn on_message(&self, message: FeatureMessage) -> Result<bool> {
        if !self.is_open() {
            debug!(processor = self.name(), "Processor closed, dropping message");
            return Ok(false);
        }

        let filter = Arc::clone(&*self.filter.read().unwrap_or_else(|e| e.into_inner()));
        match std::panic::catch_unwind(AssertUnwindSafe(|| filter(&message))) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(_) => {
                return Err(StrandError::MessageProcessor(format!(
                    "{} filter panicked",
                    self.name()
                )))
            }
        }

        let processing = async { self.processor.process_message(message).await };
        match AssertUnwindSafe(processing)
            .catch_unwind()
            .await
        {
            Ok(result) => result.map(|()| true),
            Err(_) => Err(StrandError::MessageProcessor(format!("{} panicked", self.name()))),
        }
    }

    pub(crate) async fn acquire(&self) -> Result<()> {
        let mut users = self.users.lock().await;
        if *users == 0 {
            self.processor.initialize().await?;
            self.open.send_replace(true);
            debug!(processor = self.name(), "Processor opened");
        }
        *users += 1;
        Ok(())
    }

    pub(crate) async fn release(&self) {
        let mut users = self.users.lock().await;
        *users = users.saturating_sub(1);
        if *users == 0 && self.is_open() {
            self.open.send_replace(false);
            if let Err(e) = self.processor.close().await {
                warn!(processor = self.name(), error = %e, "Processor close failed");
            }
            debug!(processor = self.name(), "Processor closed");
        }
    }
}

/// Releases acquired processors when dropped before `release` ran,
/// i.e. when the scoped future was cancelled.
struct ReleaseGuard {
    handles: Vec<Arc<ProcessorHandle>>,
}

impl ReleaseGuard {
    async fn release(mut self) {
        for handle in std::mem::take(&mut self.handles) {
            handle.release().await;
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        let handles = std::mem::take(&mut self.handles);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    for handle in handles {
                        handle.release().await;
                    }
                });
            }
            Err(_) => warn!("No runtime to close message processors on"),
        }
    }
}

pub(crate) async fn run_scoped<T>(
    handles: &[Arc<ProcessorHandle>],
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    let mut guard = ReleaseGuard {
        handles: Vec::with_capacity(handles.len()),
    };
    for handle in handles {
        handle.acquire().await?;
        guard.handles.push(Arc::clone(handle));
    }

    let result = fut.await;
    guard.release().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strand_core::event::AgentEvent;
    use strand_core::types::{AgentId, RunId};

    #[derive(Default)]
    struct Counting {
        initialized: AtomicUsize,
        processed: AtomicUsize,
        closed: AtomicUsize,
    }

    impl MessageProcessor for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn initialize(&self) -> BoxFuture<'_, Result<()>> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn process_message(&self, _message: FeatureMessage) -> BoxFuture<'_, Result<()>> {
            self.processed.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn close(&self) -> BoxFuture<'_, Result<()>> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    fn message(event: AgentEvent) -> FeatureMessage {
        FeatureMessage::new(
            "trace",
            EventEnvelope::new(AgentId::new(), RunId::new(), "s", event),
        )
    }

    #[tokio::test]
    async fn test_filter_drops_before_processing() {
        let processor = Arc::new(Counting::default());
        let handle = Arc::new(ProcessorHandle::new(processor.clone()));
        handle.acquire().await.unwrap();

        handle.set_filter(|m| m.envelope.event.is_terminal());
        let started = message(AgentEvent::AgentStarting {
            input: serde_json::Value::Null,
        });
        let failed = message(AgentEvent::AgentExecutionFailed { error: "x".into() });
        assert!(!handle.on_message(started).await.unwrap());
        assert!(handle.on_message(failed).await.unwrap());
        assert_eq!(processor.processed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_filter_is_reported() {
        let processor = Arc::new(Counting::default());
        let handle = Arc::new(ProcessorHandle::new(processor.clone()));
        handle.acquire().await.unwrap();

        handle.set_filter(|_| panic!("filter bug"));
        let err = handle
            .on_message(message(AgentEvent::AgentStarting {
                input: serde_json::Value::Null,
            }))
            .await
            .unwrap_err();
        assert!(matches!(&err, StrandError::MessageProcessor(m) if m == "counting filter panicked"));
        assert_eq!(processor.processed.load(Ordering::SeqCst), 0);

        // The handle stays usable once the filter is fixed.
        handle.set_filter(|_| true);
        assert!(handle
            .on_message(message(AgentEvent::AgentCompleted {
                result: serde_json::Value::Null,
            }))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_scoped_lifecycle_is_shared_and_released() {
        let processor = Arc::new(Counting::default());
        let handles = vec![Arc::new(ProcessorHandle::new(processor.clone()))];
        let mut open = handles[0].subscribe_open();

        let result: Result<()> = run_scoped(&handles, async {
            assert!(handles[0].is_open());
            run_scoped(&handles, async { Ok(()) }).await?;
            assert!(handles[0].is_open());
            Err(StrandError::Cancelled)
        })
        .await;

        assert!(result.is_err());
        assert!(!handles[0].is_open());
        assert!(open.has_changed().unwrap());
        open.borrow_and_update();
        assert_eq!(processor.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(processor.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_processor_receives_nothing() {
        let processor = Arc::new(Counting::default());
        let handle = ProcessorHandle::new(processor.clone());
        let delivered = handle
            .on_message(message(AgentEvent::AgentStarting {
                input: serde_json::Value::Null,
            }))
            .await
            .unwrap();
        assert!(!delivered);
        assert_eq!(processor.processed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_scope_still_closes() {
        let processor = Arc::new(Counting::default());
        let handles = vec![Arc::new(ProcessorHandle::new(processor.clone()))];

        let scoped = run_scoped(&handles, futures::future::pending::<Result<()>>());
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), scoped).await;
        assert!(timed_out.is_err());

        for _ in 0..50 {
            if !handles[0].is_open() {
                break;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert!(!handles[0].is_open());
        assert_eq!(processor.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_message_flattens_envelope() {
        let json = serde_json::to_value(message(AgentEvent::StrategyStarting {
            strategy: "loop".into(),
        }))
        .unwrap();
        assert_eq!(json["feature"], "trace");
        assert_eq!(json["strategy"], "s");
        assert_eq!(json["event"]["type"], "strategy_starting");
    }
}
