use std::sync::Arc;

use strand_core::config::TraceConfig;
use strand_core::error::{FeatureInstallError, StrandError};
use strand_core::event::{EventBus, EventKind};

use super::message::{FeatureMessage, MessageProcessor, ProcessorHandle};
use super::processors::{BroadcastMessageProcessor, JsonlMessageProcessor, LogMessageProcessor};
use super::{Feature, PipelineBuilder};

#[derive(Default)]
pub struct TraceFeatureConfig {
    processors: Vec<Arc<dyn MessageProcessor>>,
    only: Option<Vec<EventKind>>,
}

impl TraceFeatureConfig {
    pub fn with_processor(mut self, processor: impl MessageProcessor) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    pub fn with_processor_arc(mut self, processor: Arc<dyn MessageProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Trace only these event kinds.
    pub fn only(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.only = Some(kinds.into_iter().collect());
        self
    }

    /// Processors selected by the `[trace]` config section.
    pub fn from_settings(settings: &TraceConfig, bus: Option<Arc<EventBus>>) -> Self {
        let mut config = Self::default();
        if settings.log_messages {
            config = config.with_processor(LogMessageProcessor);
        }
        if let Some(dir) = settings.jsonl_dir() {
            config = config.with_processor(JsonlMessageProcessor::new(dir));
        }
        if let Some(bus) = bus {
            config = config.with_processor(BroadcastMessageProcessor::new(bus));
        }
        config
    }
}

/// Externalizes engine events as `FeatureMessage`s to message processors.
pub struct Trace {
    processors: Vec<Arc<ProcessorHandle>>,
}

impl Trace {
    pub fn processors(&self) -> &[Arc<ProcessorHandle>] {
        &self.processors
    }

    pub fn processor(&self, name: &str) -> Option<&Arc<ProcessorHandle>> {
        self.processors.iter().find(|p| p.name() == name)
    }
}

impl Feature for Trace {
    type Config = TraceFeatureConfig;
    const KEY: &'static str = "trace";

    fn install(
        config: Self::Config,
        pipeline: &mut PipelineBuilder,
    ) -> std::result::Result<Self, FeatureInstallError> {
        if config.processors.is_empty() {
            return Err(FeatureInstallError::InvalidConfig {
                feature: Self::KEY.to_string(),
                message: "at least one message processor is required".to_string(),
            });
        }

        let processors: Arc<Vec<Arc<ProcessorHandle>>> = Arc::new(
            config
                .processors
                .into_iter()
                .map(|p| pipeline.add_processor(p))
                .collect(),
        );
        let only = config.only;

        let targets = Arc::clone(&processors);
        pipeline.on_all(move |envelope, _ctx| {
            let wanted = only.as_ref().map_or(true, |kinds| kinds.contains(&envelope.kind()));
            let message = wanted.then(|| FeatureMessage::new(Trace::KEY, envelope.clone()));
            let targets = Arc::clone(&targets);
            async move {
                let Some(message) = message else {
                    return Ok(());
                };
                let mut errors = Vec::new();
                for processor in targets.iter() {
                    if let Err(e) = processor.on_message(message.clone()).await {
                        errors.push(format!("{}: {}", processor.name(), e));
                    }
                }
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(StrandError::MessageProcessor(errors.join("; ")))
                }
            }
        });

        Ok(Self {
            processors: processors.to_vec(),
        })
    }
}
