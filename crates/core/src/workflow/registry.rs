use super::handler::{FnHandler, HandlerError, StepContext, StepHandler};
use crate::error::{EngineError, EngineResult};
use crate::types::ValueMap;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Maps step-type tags to handlers.
///
/// Populated at startup; lookups during execution only take the read lock.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn StepHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler. Registering the same step type twice is an error.
    pub fn register(
        &self,
        step_type: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) -> EngineResult<()> {
        let step_type = step_type.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);

        if handlers.contains_key(&step_type) {
            return Err(EngineError::DuplicateHandler(step_type));
        }

        tracing::debug!("Registered handler for step type '{}'", step_type);
        handlers.insert(step_type, handler);
        Ok(())
    }

    /// Register a synchronous closure as a handler
    pub fn register_fn<F>(&self, step_type: impl Into<String>, func: F) -> EngineResult<()>
    where
        F: Fn(ValueMap, &StepContext) -> Result<ValueMap, HandlerError> + Send + Sync + 'static,
    {
        self.register(step_type, Arc::new(FnHandler::new(func)))
    }

    /// Look up the handler for a step type
    pub fn resolve(&self, step_type: &str) -> EngineResult<Arc<dyn StepHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(step_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStepType(step_type.to_string()))
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(step_type)
    }

    /// Registered step types, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn noop(inputs: ValueMap, _ctx: &StepContext) -> Result<ValueMap, HandlerError> {
        Ok(inputs)
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = HandlerRegistry::new();
        registry.register_fn("noop", noop).unwrap();

        assert!(registry.contains("noop"));
        assert!(registry.resolve("noop").is_ok());
        assert_eq!(registry.registered_types(), vec!["noop".to_string()]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = HandlerRegistry::new();
        registry.register_fn("noop", noop).unwrap();

        let err = registry.register_fn("noop", noop).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateHandler);
        assert_eq!(err.to_string(), "a handler is already registered for step type 'noop'");
    }

    #[test]
    fn test_unknown_step_type() {
        let registry = HandlerRegistry::new();
        match registry.resolve("llm") {
            Err(EngineError::UnknownStepType(t)) => assert_eq!(t, "llm"),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("resolved an unregistered step type"),
        }
    }
}
