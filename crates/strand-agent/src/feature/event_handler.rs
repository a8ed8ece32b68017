use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use strand_core::error::{FeatureInstallError, Result};
use strand_core::event::{EventEnvelope, EventKind};

use super::{EventHandlerFn, Feature, PipelineBuilder};
use crate::context::AgentContext;

/// User callbacks attached per event kind.
///
/// ```ignore
/// builder.install::<EventHandler>(
///     EventHandlerConfig::default()
///         .on(EventKind::ToolCallCompleted, |e| println!("{:?}", e.event)),
/// )?;
/// ```
#[derive(Default)]
pub struct EventHandlerConfig {
    handlers: Vec<(Option<EventKind>, EventHandlerFn)>,
}

impl EventHandlerConfig {
    /// Synchronous callback for one event kind.
    pub fn on(mut self, kind: EventKind, f: impl Fn(&EventEnvelope) + Send + Sync + 'static) -> Self {
        self.handlers.push((Some(kind), sync_handler(f)));
        self
    }

    /// Synchronous callback for every event.
    pub fn on_any(mut self, f: impl Fn(&EventEnvelope) + Send + Sync + 'static) -> Self {
        self.handlers.push((None, sync_handler(f)));
        self
    }

    /// Asynchronous, fallible callback with access to the run context.
    pub fn on_async<F, Fut>(mut self, kind: EventKind, f: F) -> Self
    where
        F: Fn(EventEnvelope, AgentContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: EventHandlerFn = Arc::new(
            move |envelope: &EventEnvelope, ctx: &AgentContext| -> BoxFuture<'static, Result<()>> {
                Box::pin(f(envelope.clone(), ctx.clone()))
            },
        );
        self.handlers.push((Some(kind), handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn sync_handler(f: impl Fn(&EventEnvelope) + Send + Sync + 'static) -> EventHandlerFn {
    Arc::new(
        move |envelope: &EventEnvelope, _ctx: &AgentContext| -> BoxFuture<'static, Result<()>> {
            f(envelope);
            Box::pin(async { Ok(()) })
        },
    )
}

/// Observability hook: forwards events to user callbacks.
#[derive(Debug)]
pub struct EventHandler {
    handlers: usize,
}

impl EventHandler {
    /// Number of registered callbacks.
    pub fn handler_count(&self) -> usize {
        self.handlers
    }
}

impl Feature for EventHandler {
    type Config = EventHandlerConfig;
    const KEY: &'static str = "event_handler";

    fn install(
        config: Self::Config,
        pipeline: &mut PipelineBuilder,
    ) -> std::result::Result<Self, FeatureInstallError> {
        let handlers = config.handlers.len();
        for (kind, handler) in config.handlers {
            let call = move |envelope: &EventEnvelope, ctx: &AgentContext| handler(envelope, ctx);
            match kind {
                Some(kind) => pipeline.on(kind, call),
                None => pipeline.on_all(call),
            }
        }
        Ok(Self { handlers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use strand_core::error::StrandError;
    use strand_core::event::AgentEvent;
    use strand_test_utils::MockLlmClient;

    #[tokio::test]
    async fn test_callbacks_receive_matching_events() {
        let tools = Arc::new(Mutex::new(Vec::new()));
        let all = Arc::new(Mutex::new(0usize));
        let tools_seen = Arc::clone(&tools);
        let all_seen = Arc::clone(&all);

        let mut builder = PipelineBuilder::new();
        builder
            .install::<EventHandler>(
                EventHandlerConfig::default()
                    .on(EventKind::ToolCallCompleted, move |e| {
                        if let AgentEvent::ToolCallCompleted { tool, .. } = &e.event {
                            tools_seen.lock().unwrap().push(tool.clone());
                        }
                    })
                    .on_any(move |_| *all_seen.lock().unwrap() += 1),
            )
            .unwrap();

        let ctx = AgentContext::builder(Arc::new(MockLlmClient::new()))
            .pipeline(Arc::new(builder.build()))
            .build();
        assert_eq!(ctx.feature::<EventHandler>().unwrap().handler_count(), 2);

        ctx.emit(AgentEvent::ToolCallCompleted {
            call_id: "c1".into(),
            tool: "calculator".into(),
            content: "4".into(),
        })
        .await;
        ctx.emit(AgentEvent::StrategyStarting {
            strategy: "s".into(),
        })
        .await;

        assert_eq!(*tools.lock().unwrap(), vec!["calculator".to_string()]);
        assert_eq!(*all.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_async_callback_failure_is_resurfaced() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&failures);

        let mut builder = PipelineBuilder::new();
        builder
            .install::<EventHandler>(
                EventHandlerConfig::default()
                    .on_async(EventKind::AgentStarting, |_e, _ctx| async {
                        Err(StrandError::FeatureHandler {
                            feature: "event_handler".into(),
                            message: "rejected".into(),
                        })
                    })
                    .on(EventKind::FeatureHandlerFailed, move |e| {
                        if let AgentEvent::FeatureHandlerFailed { feature, event, .. } = &e.event {
                            seen.lock().unwrap().push((feature.clone(), *event));
                        }
                    }),
            )
            .unwrap();

        let ctx = AgentContext::builder(Arc::new(MockLlmClient::new()))
            .pipeline(Arc::new(builder.build()))
            .build();
        ctx.emit(AgentEvent::AgentStarting {
            input: serde_json::Value::Null,
        })
        .await;

        assert_eq!(
            *failures.lock().unwrap(),
            vec![("event_handler".to_string(), EventKind::AgentStarting)]
        );
    }

    #[tokio::test]
    async fn test_panicking_sync_callback_does_not_block_others() {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&delivered);

        let mut builder = PipelineBuilder::new();
        builder
            .install::<EventHandler>(EventHandlerConfig::default().on(EventKind::StrategyStarting, |_| {
                panic!("callback bug")
            }))
            .unwrap();
        builder.on_all(move |envelope, _ctx| {
            seen.lock().unwrap().push(envelope.event.clone());
            async { Ok(()) }
        });

        let ctx = AgentContext::builder(Arc::new(MockLlmClient::new()))
            .pipeline(Arc::new(builder.build()))
            .build();
        ctx.emit(AgentEvent::StrategyStarting {
            strategy: "s".into(),
        })
        .await;

        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].kind(), EventKind::StrategyStarting);
        match &delivered[1] {
            AgentEvent::FeatureHandlerFailed { feature, event, error } => {
                assert_eq!(feature, "event_handler");
                assert_eq!(*event, EventKind::StrategyStarting);
                assert_eq!(error, "handler panicked");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
