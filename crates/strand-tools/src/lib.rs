pub mod executor;
pub mod registry;
pub mod rollback;
pub mod schema;
pub mod typed;

pub use executor::{NoopObserver, ToolCallObserver, ToolExecutor};
pub use registry::ToolRegistry;
pub use rollback::{AppliedCall, RollbackEntry, RollbackRegistry, RollbackReport};
pub use schema::validate_arguments;
pub use typed::{Typed, TypedTool};
