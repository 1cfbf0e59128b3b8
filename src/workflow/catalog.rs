//! Workflow definition catalog
//!
//! Definitions are collected with a [`CatalogBuilder`] at startup and frozen
//! into a [`WorkflowCatalog`], which only offers lookups.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::definition::{DefinitionError, StepBlueprint, WorkflowDefinition};

pub const AD_PRODUCTION: &str = "ad_production";
pub const REVISION: &str = "revision";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Unknown workflow type: {0}")]
    NotFound(String),

    #[error("Workflow type already registered: {0}")]
    Duplicate(String),

    #[error("Invalid workflow definition: {0}")]
    Invalid(#[from] DefinitionError),
}

/// Immutable lookup table of workflow definitions
#[derive(Debug, Clone, Default)]
pub struct WorkflowCatalog {
    definitions: BTreeMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowCatalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::new()
    }

    /// Catalog holding only the built-in definitions
    pub fn builtin() -> Self {
        CatalogBuilder::new().with_builtin().build()
    }

    pub fn lookup(&self, workflow_type: &str) -> Result<Arc<WorkflowDefinition>, CatalogError> {
        self.definitions
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(workflow_type.to_string()))
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.definitions.contains_key(workflow_type)
    }

    /// Registered workflow types, sorted
    pub fn workflow_types(&self) -> Vec<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &WorkflowDefinition> {
        self.definitions.values().map(|d| d.as_ref())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct CatalogBuilder {
    definitions: BTreeMap<String, Arc<WorkflowDefinition>>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the built-in `ad_production` and `revision` definitions
    pub fn with_builtin(mut self) -> Self {
        for def in [ad_production(), revision()] {
            self.definitions
                .insert(def.workflow_type.clone(), Arc::new(def));
        }
        self
    }

    /// Register a new workflow type; fails if the type is already known
    pub fn register(mut self, definition: WorkflowDefinition) -> Result<Self, CatalogError> {
        definition.validate()?;
        if self.definitions.contains_key(&definition.workflow_type) {
            return Err(CatalogError::Duplicate(definition.workflow_type));
        }
        self.definitions
            .insert(definition.workflow_type.clone(), Arc::new(definition));
        Ok(self)
    }

    /// Register a workflow type, replacing any previous definition of it
    pub fn replace(mut self, definition: WorkflowDefinition) -> Result<Self, CatalogError> {
        definition.validate()?;
        self.definitions
            .insert(definition.workflow_type.clone(), Arc::new(definition));
        Ok(self)
    }

    pub fn build(self) -> WorkflowCatalog {
        WorkflowCatalog {
            definitions: self.definitions,
        }
    }
}

/// Seven-step linear production pipeline
pub fn ad_production() -> WorkflowDefinition {
    WorkflowDefinition::new(
        AD_PRODUCTION,
        vec![
            StepBlueprint::new("Client Intake", "intake", "intake"),
            StepBlueprint::new("Content Selection", "content_selection", "content_selection")
                .depends_on(["intake"]),
            StepBlueprint::new("Creative Assembly", "creative_assembly", "creative_assembly")
                .depends_on(["content_selection"]),
            StepBlueprint::new("Generation", "generation", "generation")
                .depends_on(["creative_assembly"]),
            StepBlueprint::new("Human Review", "human_review", "human_review")
                .depends_on(["generation"]),
            StepBlueprint::new("Delivery", "delivery", "delivery").depends_on(["human_review"]),
            StepBlueprint::new("Feedback Collection", "feedback_collection", "feedback")
                .depends_on(["delivery"]),
        ],
    )
}

/// Three-step revision pipeline
pub fn revision() -> WorkflowDefinition {
    WorkflowDefinition::new(
        REVISION,
        vec![
            StepBlueprint::new("Apply Revision", "revision", "revision"),
            StepBlueprint::new("Regeneration", "generation", "generation")
                .depends_on(["revision"]),
            StepBlueprint::new("Review", "human_review", "human_review")
                .depends_on(["generation"]),
        ],
    )
}
