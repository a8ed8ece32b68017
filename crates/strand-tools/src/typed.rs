use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use strand_core::error::{Result, StrandError};
use strand_core::traits::Tool;
use strand_core::types::{ToolContext, ToolResult};

/// A tool whose arguments are a Rust type.
///
/// The input schema is derived from `Args` and the raw JSON is deserialized
/// before `call` runs; a payload that does not fit is reported as invalid
/// arguments rather than as an execution failure.
pub trait TypedTool: Send + Sync + 'static {
    type Args: DeserializeOwned + JsonSchema + Send + 'static;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn call(&self, args: Self::Args, ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>>;

    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// Adapter exposing a `TypedTool` through the untyped `Tool` contract.
pub struct Typed<T>(pub T);

impl<T: TypedTool> Tool for Typed<T> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn description(&self) -> &str {
        self.0.description()
    }

    fn input_schema(&self) -> serde_json::Value {
        let schema = schemars::gen::SchemaGenerator::default().into_root_schema_for::<T::Args>();
        serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        match serde_json::from_value::<T::Args>(input) {
            Ok(args) => self.0.call(args, ctx),
            Err(e) => {
                let tool = self.0.name().to_string();
                Box::pin(async move {
                    Err(StrandError::InvalidToolArguments {
                        tool,
                        message: e.to_string(),
                    })
                })
            }
        }
    }

    fn timeout_secs(&self) -> Option<u64> {
        self.0.timeout_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use strand_core::types::{AgentId, RunId};

    #[derive(Deserialize, JsonSchema)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    struct Add;

    impl TypedTool for Add {
        type Args = AddArgs;

        fn name(&self) -> &str {
            "add"
        }

        fn description(&self) -> &str {
            "Add two integers"
        }

        fn call(&self, args: AddArgs, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
            Box::pin(async move { Ok(ToolResult::success((args.a + args.b).to_string())) })
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new(AgentId::from("a"), RunId::from("r"), "c1")
    }

    #[test]
    fn test_schema_derived_from_args() {
        let schema = Typed(Add).input_schema();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["a"].is_object());
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 2);
    }

    #[tokio::test]
    async fn test_typed_call() {
        let result = Typed(Add).execute(json!({"a": 2, "b": 2}), ctx()).await.unwrap();
        assert_eq!(result.content, "4");
    }

    #[tokio::test]
    async fn test_bad_payload_is_invalid_arguments() {
        let err = Typed(Add).execute(json!({"a": "two"}), ctx()).await.unwrap_err();
        assert!(matches!(err, StrandError::InvalidToolArguments { .. }));
    }
}
