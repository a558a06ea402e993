//! Saga definitions: the ordered, name-indexed steps of one saga type.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::SagaContext;
use crate::error::{Result, SagaError};
use crate::step::SagaStep;

/// The steps of one saga type, in declaration order.
///
/// Built once at assembly time. Compensation and recovery look steps up by
/// name through the index instead of matching on strings.
pub struct SagaDefinition {
    saga_type: String,
    steps: Vec<Arc<dyn SagaStep>>,
    index: HashMap<String, usize>,
}

impl SagaDefinition {
    /// Starts building a definition for `saga_type`.
    pub fn builder(saga_type: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder {
            saga_type: saga_type.into(),
            steps: Vec::new(),
        }
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }

    /// Looks a step up by name.
    pub fn step(&self, name: &str) -> Option<&Arc<dyn SagaStep>> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    /// Position of a step in declaration order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Creates a fresh context for a saga of this type.
    pub fn new_context(&self, correlation_id: impl Into<String>) -> SagaContext {
        SagaContext::new(self.saga_type.clone(), correlation_id)
    }
}

impl std::fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("saga_type", &self.saga_type)
            .field("steps", &self.step_names())
            .finish()
    }
}

/// Builder for [`SagaDefinition`].
pub struct SagaDefinitionBuilder {
    saga_type: String,
    steps: Vec<Arc<dyn SagaStep>>,
}

impl SagaDefinitionBuilder {
    /// Appends a step.
    pub fn step(self, step: impl SagaStep + 'static) -> Self {
        self.shared_step(Arc::new(step))
    }

    /// Appends a step that is shared with other definitions.
    pub fn shared_step(mut self, step: Arc<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// Validates and builds the definition.
    ///
    /// Fails if there are no steps, two steps share a name, or a name is
    /// empty or contains `": "`. Failures are persisted as `"step: error"`,
    /// which must split back at the first separator.
    pub fn build(self) -> Result<SagaDefinition> {
        if self.steps.is_empty() {
            return Err(SagaError::EmptyDefinition(self.saga_type));
        }

        let mut index = HashMap::with_capacity(self.steps.len());
        for (i, step) in self.steps.iter().enumerate() {
            let name = step.name();
            if name.is_empty() || name.contains(": ") {
                return Err(SagaError::InvalidStepName(name.to_string()));
            }
            if index.insert(step.name().to_string(), i).is_some() {
                return Err(SagaError::DuplicateStep(step.name().to_string()));
            }
        }

        Ok(SagaDefinition {
            saga_type: self.saga_type,
            steps: self.steps,
            index,
        })
    }
}

/// Saga definitions by saga type, used to rebuild orchestrators on recovery.
#[derive(Default, Clone)]
pub struct SagaCatalog {
    definitions: HashMap<String, Arc<SagaDefinition>>,
}

impl SagaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition, replacing any previous one for the same type.
    pub fn register(&mut self, definition: Arc<SagaDefinition>) -> &mut Self {
        self.definitions
            .insert(definition.saga_type().to_string(), definition);
        self
    }

    pub fn get(&self, saga_type: &str) -> Option<Arc<SagaDefinition>> {
        self.definitions.get(saga_type).cloned()
    }

    pub fn saga_types(&self) -> Vec<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::step::StepResult;

    struct Noop(&'static str);

    #[async_trait]
    impl SagaStep for Noop {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _ctx: &SagaContext) -> StepResult {
            StepResult::success()
        }

        async fn compensate(&self, _ctx: &SagaContext) -> StepResult {
            StepResult::success()
        }
    }

    #[test]
    fn test_build_preserves_declaration_order() {
        let def = SagaDefinition::builder("T")
            .step(Noop("a"))
            .step(Noop("b"))
            .step(Noop("c"))
            .build()
            .unwrap();

        assert_eq!(def.step_names(), vec!["a", "b", "c"]);
        assert_eq!(def.position("b"), Some(1));
        assert_eq!(def.step("c").map(|s| s.name()), Some("c"));
        assert!(def.step("z").is_none());
        assert_eq!(def.len(), 3);
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let result = SagaDefinition::builder("T")
            .step(Noop("a"))
            .step(Noop("a"))
            .build();
        assert!(matches!(result, Err(SagaError::DuplicateStep(ref n)) if n == "a"));
    }

    #[test]
    fn test_step_name_with_failure_separator_rejected() {
        let result = SagaDefinition::builder("T")
            .step(Noop("a"))
            .step(Noop("charge: card"))
            .build();
        assert!(matches!(result, Err(SagaError::InvalidStepName(ref n)) if n == "charge: card"));

        let result = SagaDefinition::builder("T").step(Noop("")).build();
        assert!(matches!(result, Err(SagaError::InvalidStepName(_))));

        // A colon alone does not break the persisted form.
        assert!(SagaDefinition::builder("T").step(Noop("ns:charge")).build().is_ok());
    }

    #[test]
    fn test_empty_definition_rejected() {
        let result = SagaDefinition::builder("T").build();
        assert!(matches!(result, Err(SagaError::EmptyDefinition(_))));
    }

    #[test]
    fn test_new_context_uses_saga_type() {
        let def = SagaDefinition::builder("T").step(Noop("a")).build().unwrap();
        let ctx = def.new_context("order-1");
        assert_eq!(ctx.saga_type(), "T");
        assert_eq!(ctx.correlation_id(), "order-1");
    }

    #[test]
    fn test_catalog_lookup() {
        let def = Arc::new(SagaDefinition::builder("T").step(Noop("a")).build().unwrap());
        let mut catalog = SagaCatalog::new();
        catalog.register(def);

        assert!(catalog.get("T").is_some());
        assert!(catalog.get("U").is_none());
        assert_eq!(catalog.saga_types(), vec!["T"]);
    }
}
