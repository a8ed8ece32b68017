//! Feature pipeline: installed cross-cutting features and event dispatch.
//!
//! Features are installed once, at agent build time, into a
//! `PipelineBuilder`. Installing registers event handlers (and optionally
//! message processors) and yields a feature instance stored under the
//! feature's key. The resulting `FeaturePipeline` is immutable for the
//! lifetime of the agent.

pub mod event_handler;
pub mod message;
pub mod persistence;
pub mod processors;
pub mod trace;

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use strand_core::error::{FeatureInstallError, Result, StrandError};
use strand_core::event::{AgentEvent, EventEnvelope, EventKind};
use strand_tools::RollbackRegistry;

use crate::context::AgentContext;

pub use event_handler::{EventHandler, EventHandlerConfig};
pub use message::{FeatureMessage, MessageFilter, MessageProcessor, ProcessorHandle};
pub use persistence::{Persistence, PersistenceFeatureConfig};
pub use processors::{BroadcastMessageProcessor, JsonlMessageProcessor, LogMessageProcessor};
pub use trace::{Trace, TraceFeatureConfig};

/// A pluggable concern installed into an agent's pipeline.
pub trait Feature: Send + Sync + Sized + 'static {
    type Config: Default + Send;

    /// Unique key the instance is stored under.
    const KEY: &'static str;

    /// Register handlers on `pipeline` and build the instance.
    fn install(
        config: Self::Config,
        pipeline: &mut PipelineBuilder,
    ) -> std::result::Result<Self, FeatureInstallError>;
}

/// Type-erased event callback.
pub type EventHandlerFn =
    Arc<dyn Fn(&EventEnvelope, &AgentContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    feature: &'static str,
    kind: Option<EventKind>,
    handler: EventHandlerFn,
}

struct HandlerFailure {
    feature: &'static str,
    error: String,
}

/// Collects features, handlers and processors before the pipeline is frozen.
pub struct PipelineBuilder {
    features: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
    order: Vec<&'static str>,
    handlers: Vec<Registration>,
    processors: Vec<Arc<ProcessorHandle>>,
    rollback: Arc<RollbackRegistry>,
    installing: Option<&'static str>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::with_rollback(Arc::new(RollbackRegistry::new()))
    }

    /// Share a rollback registry with the tool executor and features.
    pub fn with_rollback(rollback: Arc<RollbackRegistry>) -> Self {
        Self {
            features: HashMap::new(),
            order: Vec::new(),
            handlers: Vec::new(),
            processors: Vec::new(),
            rollback,
            installing: None,
        }
    }

    /// Install `F` with `config`. Keys must be unique.
    pub fn install<F: Feature>(
        &mut self,
        config: F::Config,
    ) -> std::result::Result<(), FeatureInstallError> {
        if self.features.contains_key(F::KEY) {
            return Err(FeatureInstallError::DuplicateKey(F::KEY.to_string()));
        }

        let previous = self.installing.replace(F::KEY);
        let installed = F::install(config, self);
        self.installing = previous;

        let instance = installed?;
        self.features.insert(F::KEY, Arc::new(instance));
        self.order.push(F::KEY);
        debug!(feature = F::KEY, "Feature installed");
        Ok(())
    }

    pub fn is_installed(&self, key: &str) -> bool {
        self.features.contains_key(key)
    }

    /// Fail the current installation unless `D` is already installed.
    pub fn require<D: Feature>(&self) -> std::result::Result<(), FeatureInstallError> {
        if self.features.contains_key(D::KEY) {
            Ok(())
        } else {
            Err(FeatureInstallError::MissingDependency {
                feature: self.installing.unwrap_or("pipeline").to_string(),
                dependency: D::KEY.to_string(),
            })
        }
    }

    /// Register a handler for one event kind.
    pub fn on<F, Fut>(&mut self, kind: EventKind, handler: F)
    where
        F: Fn(&EventEnvelope, &AgentContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(Some(kind), handler);
    }

    /// Register a handler for every event.
    pub fn on_all<F, Fut>(&mut self, handler: F)
    where
        F: Fn(&EventEnvelope, &AgentContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(None, handler);
    }

    fn register<F, Fut>(&mut self, kind: Option<EventKind>, handler: F)
    where
        F: Fn(&EventEnvelope, &AgentContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let erased: EventHandlerFn = Arc::new(
            move |envelope: &EventEnvelope, ctx: &AgentContext| -> BoxFuture<'static, Result<()>> {
                Box::pin(handler(envelope, ctx))
            },
        );
        self.handlers.push(Registration {
            feature: self.installing.unwrap_or("pipeline"),
            kind,
            handler: erased,
        });
    }

    /// Attach a message processor whose lifecycle follows each run.
    pub fn add_processor(&mut self, processor: Arc<dyn MessageProcessor>) -> Arc<ProcessorHandle> {
        let handle = Arc::new(ProcessorHandle::new(processor));
        self.processors.push(Arc::clone(&handle));
        handle
    }

    pub fn rollback(&self) -> &Arc<RollbackRegistry> {
        &self.rollback
    }

    pub fn build(self) -> FeaturePipeline {
        FeaturePipeline {
            features: self.features,
            order: self.order,
            handlers: self.handlers,
            processors: self.processors,
            rollback: self.rollback,
        }
    }
}

/// The frozen set of installed features.
pub struct FeaturePipeline {
    features: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
    order: Vec<&'static str>,
    handlers: Vec<Registration>,
    processors: Vec<Arc<ProcessorHandle>>,
    rollback: Arc<RollbackRegistry>,
}

impl FeaturePipeline {
    /// A pipeline with nothing installed.
    pub fn empty() -> Self {
        PipelineBuilder::new().build()
    }

    pub fn feature<F: Feature>(&self) -> Result<Arc<F>> {
        self.features
            .get(F::KEY)
            .and_then(|instance| Arc::clone(instance).downcast::<F>().ok())
            .ok_or_else(|| StrandError::FeatureNotInstalled(F::KEY.to_string()))
    }

    /// Installed feature keys in installation order.
    pub fn installed(&self) -> &[&'static str] {
        &self.order
    }

    pub fn processors(&self) -> &[Arc<ProcessorHandle>] {
        &self.processors
    }

    pub fn rollback(&self) -> &Arc<RollbackRegistry> {
        &self.rollback
    }

    /// Deliver `envelope` to every matching handler, in installation order.
    ///
    /// A failing or panicking handler does not stop delivery to the rest.
    /// Each failure is logged and re-surfaced once as `FeatureHandlerFailed`;
    /// failures while delivering that event are only logged.
    pub async fn dispatch(&self, envelope: EventEnvelope, ctx: &AgentContext) {
        let failures = self.deliver(&envelope, ctx).await;
        if envelope.kind() == EventKind::FeatureHandlerFailed {
            return;
        }

        for failure in failures {
            let resurfaced = EventEnvelope::new(
                envelope.agent_id.clone(),
                envelope.run_id.clone(),
                envelope.strategy.clone(),
                AgentEvent::FeatureHandlerFailed {
                    feature: failure.feature.to_string(),
                    event: envelope.kind(),
                    error: failure.error,
                },
            );
            self.deliver(&resurfaced, ctx).await;
        }
    }

    async fn deliver(&self, envelope: &EventEnvelope, ctx: &AgentContext) -> Vec<HandlerFailure> {
        let kind = envelope.kind();
        let mut failures = Vec::new();

        for registration in &self.handlers {
            if registration.kind.is_some_and(|k| k != kind) {
                continue;
            }

            // Handlers may panic when called as well as when polled.
            let called = std::panic::catch_unwind(AssertUnwindSafe(|| (registration.handler)(envelope, ctx)));
            let error = match called {
                Ok(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => "handler panicked".to_string(),
                },
                Err(_) => "handler panicked".to_string(),
            };

            warn!(
                feature = registration.feature,
                event = %kind,
                error = %error,
                "Feature handler failed"
            );
            failures.push(HandlerFailure {
                feature: registration.feature,
                error,
            });
        }

        failures
    }

    /// Run `fut` with every message processor initialized, closing them
    /// afterwards on every exit path, including cancellation.
    pub async fn scoped<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        message::run_scoped(&self.processors, fut).await
    }
}

impl std::fmt::Debug for FeaturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeaturePipeline")
            .field("features", &self.order)
            .field("handlers", &self.handlers.len())
            .field("processors", &self.processors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use strand_test_utils::MockLlmClient;

    struct Counter {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[derive(Default)]
    struct CounterConfig {
        fail: bool,
    }

    impl Feature for Counter {
        type Config = CounterConfig;
        const KEY: &'static str = "counter";

        fn install(
            config: Self::Config,
            pipeline: &mut PipelineBuilder,
        ) -> std::result::Result<Self, FeatureInstallError> {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let recorded = Arc::clone(&seen);
            let fail = config.fail;
            pipeline.on_all(move |envelope, _ctx| {
                recorded.lock().unwrap().push(envelope.kind().to_string());
                async move {
                    if fail {
                        Err(StrandError::FeatureHandler {
                            feature: "counter".into(),
                            message: "boom".into(),
                        })
                    } else {
                        Ok(())
                    }
                }
            });
            Ok(Self { seen })
        }
    }

    struct Dependent;

    impl Feature for Dependent {
        type Config = ();
        const KEY: &'static str = "dependent";

        fn install(
            _config: (),
            pipeline: &mut PipelineBuilder,
        ) -> std::result::Result<Self, FeatureInstallError> {
            pipeline.require::<Counter>()?;
            Ok(Self)
        }
    }

    fn context(pipeline: FeaturePipeline) -> AgentContext {
        AgentContext::builder(Arc::new(MockLlmClient::new()))
            .pipeline(Arc::new(pipeline))
            .build()
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut builder = PipelineBuilder::new();
        builder.install::<Counter>(CounterConfig::default()).unwrap();
        let err = builder.install::<Counter>(CounterConfig::default()).unwrap_err();
        assert_eq!(err, FeatureInstallError::DuplicateKey("counter".into()));
    }

    #[test]
    fn test_missing_dependency() {
        let mut builder = PipelineBuilder::new();
        let err = builder.install::<Dependent>(()).unwrap_err();
        assert_eq!(
            err,
            FeatureInstallError::MissingDependency {
                feature: "dependent".into(),
                dependency: "counter".into(),
            }
        );
        assert!(!builder.is_installed("dependent"));

        builder.install::<Counter>(CounterConfig::default()).unwrap();
        builder.install::<Dependent>(()).unwrap();
        assert_eq!(builder.build().installed(), &["counter", "dependent"]);
    }

    #[test]
    fn test_feature_lookup() {
        let mut builder = PipelineBuilder::new();
        builder.install::<Counter>(CounterConfig::default()).unwrap();
        let pipeline = builder.build();
        assert!(pipeline.feature::<Counter>().is_ok());
        assert!(matches!(
            pipeline.feature::<Dependent>(),
            Err(StrandError::FeatureNotInstalled(key)) if key == "dependent"
        ));
    }

    #[tokio::test]
    async fn test_failing_handler_isolated_and_resurfaced_once() {
        let after = Arc::new(Mutex::new(Vec::new()));
        let mut builder = PipelineBuilder::new();
        builder.install::<Counter>(CounterConfig { fail: true }).unwrap();
        let recorded = Arc::clone(&after);
        builder.on_all(move |envelope, _ctx| {
            recorded.lock().unwrap().push(envelope.kind());
            async { Ok(()) }
        });

        let ctx = context(builder.build());
        ctx.emit(AgentEvent::StrategyStarting {
            strategy: "s".into(),
        })
        .await;

        assert_eq!(
            *after.lock().unwrap(),
            vec![EventKind::StrategyStarting, EventKind::FeatureHandlerFailed]
        );
        let counter = ctx.feature::<Counter>().unwrap();
        assert_eq!(
            *counter.seen.lock().unwrap(),
            vec!["strategy_starting", "feature_handler_failed"]
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_isolated() {
        let delivered = Arc::new(Mutex::new(0usize));
        let mut builder = PipelineBuilder::new();
        builder.on(EventKind::AgentStarting, |_envelope, _ctx| async {
            if true {
                panic!("handler bug");
            }
            Ok(())
        });
        let count = Arc::clone(&delivered);
        builder.on(EventKind::AgentStarting, move |_envelope, _ctx| {
            *count.lock().unwrap() += 1;
            async { Ok(()) }
        });

        let ctx = context(builder.build());
        ctx.emit(AgentEvent::AgentStarting {
            input: serde_json::Value::Null,
        })
        .await;
        assert_eq!(*delivered.lock().unwrap(), 1);
    }
}
