pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod keyed_mutex;
pub mod traits;
pub mod types;

pub use checkpoint::Checkpoint;
pub use config::EngineConfig;
pub use error::{Result, StrandError};
pub use event::{AgentEvent, EventBus, EventEnvelope, EventKind};
pub use keyed_mutex::{KeyedMutex, KeyedMutexGuard};
pub use types::*;
