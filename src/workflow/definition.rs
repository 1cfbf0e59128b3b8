//! Workflow and step blueprint definitions
//!
//! Definitions are static: they describe the ordered steps of a workflow type
//! and are materialized into `WorkflowStep`s when a run starts. Execution is
//! strictly positional; `depends_on` is validated against the order but
//! never used to reorder steps.

use serde::{Deserialize, Serialize};

use super::run::Payload;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("Workflow type must not be empty")]
    EmptyWorkflowType,

    #[error("Workflow '{0}' has no steps")]
    NoSteps(String),

    #[error("Workflow '{workflow}' declares step '{step}' more than once")]
    DuplicateStep { workflow: String, step: String },

    #[error("Step '{step}' in workflow '{workflow}' has an empty handler name")]
    MissingHandler { workflow: String, step: String },

    #[error("Step '{step}' in workflow '{workflow}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        workflow: String,
        step: String,
        dependency: String,
    },

    #[error("Step '{step}' in workflow '{workflow}' depends on '{dependency}', which does not run before it")]
    ForwardDependency {
        workflow: String,
        step: String,
        dependency: String,
    },
}

/// Description of one step in a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepBlueprint {
    pub name: String,

    pub step_type: String,

    /// Name the handler is registered under
    #[serde(alias = "handler")]
    pub handler_name: String,

    /// Keys of steps this one depends on (step type, handler or name)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Passed verbatim to the handler on every invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Payload>,
}

impl StepBlueprint {
    pub fn new(
        name: impl Into<String>,
        step_type: impl Into<String>,
        handler_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            step_type: step_type.into(),
            handler_name: handler_name.into(),
            depends_on: Vec::new(),
            config: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: Payload) -> Self {
        self.config = Some(config);
        self
    }

    /// Whether `key` refers to this step
    fn answers_to(&self, key: &str) -> bool {
        self.step_type == key || self.handler_name == key || self.name == key
    }
}

/// A named, ordered sequence of step blueprints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub workflow_type: String,
    pub steps: Vec<StepBlueprint>,
}

impl WorkflowDefinition {
    pub fn new(workflow_type: impl Into<String>, steps: Vec<StepBlueprint>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            steps,
        }
    }

    /// Check the definition can be executed positionally
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.workflow_type.trim().is_empty() {
            return Err(DefinitionError::EmptyWorkflowType);
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.workflow_type.clone()));
        }

        for (idx, step) in self.steps.iter().enumerate() {
            if self.steps[..idx].iter().any(|s| s.name == step.name) {
                return Err(DefinitionError::DuplicateStep {
                    workflow: self.workflow_type.clone(),
                    step: step.name.clone(),
                });
            }

            if step.handler_name.trim().is_empty() {
                return Err(DefinitionError::MissingHandler {
                    workflow: self.workflow_type.clone(),
                    step: step.name.clone(),
                });
            }

            for dep in &step.depends_on {
                if self.steps[..idx].iter().any(|s| s.answers_to(dep)) {
                    continue;
                }
                let err = if self.steps[idx..].iter().any(|s| s.answers_to(dep)) {
                    DefinitionError::ForwardDependency {
                        workflow: self.workflow_type.clone(),
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    }
                } else {
                    DefinitionError::UnknownDependency {
                        workflow: self.workflow_type.clone(),
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    }
                };
                return Err(err);
            }
        }

        Ok(())
    }

    /// Distinct handler names referenced by this definition, in step order
    pub fn handler_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for step in &self.steps {
            if !names.contains(&step.handler_name.as_str()) {
                names.push(step.handler_name.as_str());
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "linear",
            vec![
                StepBlueprint::new("First", "first", "first"),
                StepBlueprint::new("Second", "second", "second").depends_on(["first"]),
            ],
        )
    }

    #[test]
    fn test_valid_definition() {
        assert_eq!(linear().validate(), Ok(()));
    }

    #[test]
    fn test_no_steps() {
        let def = WorkflowDefinition::new("empty", vec![]);
        assert_eq!(def.validate(), Err(DefinitionError::NoSteps("empty".into())));
    }

    #[test]
    fn test_duplicate_step_name() {
        let mut def = linear();
        def.steps.push(StepBlueprint::new("First", "third", "third"));
        assert!(matches!(
            def.validate(),
            Err(DefinitionError::DuplicateStep { step, .. }) if step == "First"
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let mut def = linear();
        def.steps[1].depends_on = vec!["nowhere".into()];
        assert!(matches!(
            def.validate(),
            Err(DefinitionError::UnknownDependency { dependency, .. }) if dependency == "nowhere"
        ));
    }

    #[test]
    fn test_forward_dependency_is_rejected() {
        let mut def = linear();
        def.steps[0].depends_on = vec!["second".into()];
        assert!(matches!(
            def.validate(),
            Err(DefinitionError::ForwardDependency { step, .. }) if step == "First"
        ));
    }

    #[test]
    fn test_parse_yaml_blueprint() {
        let yaml = r#"
workflowType: review_only
steps:
  - name: Review
    stepType: human_review
    handler: human_review
    config:
      reviewers: 2
"#;
        let def: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(def.steps[0].handler_name, "human_review");
        assert!(def.steps[0].depends_on.is_empty());
        assert_eq!(
            def.steps[0].config.as_ref().unwrap()["reviewers"],
            serde_json::json!(2)
        );
    }

    #[test]
    fn test_handler_names_are_distinct() {
        let def = WorkflowDefinition::new(
            "dup",
            vec![
                StepBlueprint::new("A", "a", "shared"),
                StepBlueprint::new("B", "b", "shared"),
            ],
        );
        assert_eq!(def.handler_names(), vec!["shared"]);
    }
}
