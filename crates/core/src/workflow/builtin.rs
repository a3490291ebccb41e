// Handlers available in every deployment

use super::handler::{HandlerError, StepContext, StepHandler};
use super::inputs::render_named;
use super::registry::HandlerRegistry;
use crate::error::EngineResult;
use crate::types::ValueMap;
use serde_json::Value;
use std::sync::Arc;

/// Returns its inputs unchanged
pub struct EchoHandler;

#[async_trait::async_trait]
impl StepHandler for EchoHandler {
    async fn execute(&self, inputs: ValueMap, _ctx: StepContext) -> Result<ValueMap, HandlerError> {
        Ok(inputs)
    }
}

/// Renders the `template` input into the `text` output.
///
/// `{{name}}` placeholders are filled from the step's other inputs.
pub struct TemplateHandler;

#[async_trait::async_trait]
impl StepHandler for TemplateHandler {
    async fn execute(&self, mut inputs: ValueMap, _ctx: StepContext) -> Result<ValueMap, HandlerError> {
        let template = match inputs.remove("template") {
            Some(Value::String(template)) => template,
            Some(other) => {
                return Err(HandlerError::new("input 'template' must be a string")
                    .with_detail(other))
            }
            None => return Err(HandlerError::new("missing input 'template'")),
        };

        let text = render_named(&template, &inputs).map_err(HandlerError::new)?;

        let mut outputs = ValueMap::new();
        outputs.insert("text".to_string(), Value::String(text));
        Ok(outputs)
    }
}

/// Merges the outputs of all dependencies, then the step's own inputs.
/// Later dependencies (by step id) and inputs win on key collisions.
pub struct MergeHandler;

#[async_trait::async_trait]
impl StepHandler for MergeHandler {
    async fn execute(&self, inputs: ValueMap, ctx: StepContext) -> Result<ValueMap, HandlerError> {
        let mut merged = ValueMap::new();
        for (_step_id, outputs) in ctx.dependency_outputs() {
            merged.extend(outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged.extend(inputs);
        Ok(merged)
    }
}

/// Register `echo`, `template` and `merge`
pub fn register_builtin_handlers(registry: &HandlerRegistry) -> EngineResult<()> {
    registry.register("echo", Arc::new(EchoHandler))?;
    registry.register("template", Arc::new(TemplateHandler))?;
    registry.register("merge", Arc::new(MergeHandler))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunId, StepId, WorkflowId};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ctx(deps: BTreeMap<StepId, ValueMap>) -> StepContext {
        StepContext::new(
            RunId::new(),
            WorkflowId::new("wf"),
            StepId::new("step"),
            ValueMap::new(),
            deps,
        )
    }

    fn map(pairs: &[(&str, Value)]) -> ValueMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_echo() {
        let inputs = map(&[("a", json!(1)), ("b", json!("two"))]);
        let out = EchoHandler.execute(inputs.clone(), ctx(BTreeMap::new())).await.unwrap();
        assert_eq!(out, inputs);
    }

    #[tokio::test]
    async fn test_template() {
        let inputs = map(&[
            ("template", json!("{{greeting}}, {{name}}! x{{count}}")),
            ("greeting", json!("Hello")),
            ("name", json!("Ada")),
            ("count", json!(2)),
        ]);
        let out = TemplateHandler.execute(inputs, ctx(BTreeMap::new())).await.unwrap();
        assert_eq!(out, map(&[("text", json!("Hello, Ada! x2"))]));
    }

    #[tokio::test]
    async fn test_template_errors() {
        let err = TemplateHandler
            .execute(ValueMap::new(), ctx(BTreeMap::new()))
            .await
            .unwrap_err();
        assert_eq!(err.message, "missing input 'template'");

        let err = TemplateHandler
            .execute(map(&[("template", json!(3))]), ctx(BTreeMap::new()))
            .await
            .unwrap_err();
        assert_eq!(err.detail, Some(json!(3)));

        let err = TemplateHandler
            .execute(map(&[("template", json!("{{who}}"))]), ctx(BTreeMap::new()))
            .await
            .unwrap_err();
        assert!(err.message.contains("who"));
    }

    #[tokio::test]
    async fn test_merge_prefers_own_inputs() {
        let mut deps = BTreeMap::new();
        deps.insert(StepId::new("a"), map(&[("x", json!(1)), ("y", json!(1))]));
        deps.insert(StepId::new("b"), map(&[("y", json!(2))]));

        let out = MergeHandler
            .execute(map(&[("z", json!(3)), ("x", json!(9))]), ctx(deps))
            .await
            .unwrap();
        assert_eq!(out, map(&[("x", json!(9)), ("y", json!(2)), ("z", json!(3))]));
    }

    #[test]
    fn test_register_builtins_once() {
        let registry = HandlerRegistry::new();
        register_builtin_handlers(&registry).unwrap();
        assert_eq!(registry.registered_types(), vec!["echo", "merge", "template"]);
        assert!(register_builtin_handlers(&registry).is_err());
    }
}
