//! Stub handlers for the built-in step types
//!
//! These stand in for the real production services (intake, generation,
//! delivery, ...). They return the output keys downstream steps expect so
//! the built-in definitions can be driven end to end from the CLI.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

use crate::engine::error::HandlerError;
use crate::engine::handler::{HandlerRegistry, StepHandler};
use crate::workflow::Payload;

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

pub struct IntakeHandler;

#[async_trait]
impl StepHandler for IntakeHandler {
    async fn execute(&self, input: &Payload, _config: Option<&Payload>) -> Result<Payload, HandlerError> {
        info!("Executing intake step");
        Ok(payload(json!({
            "intakeComplete": true,
            "projectId": input.get("projectId").cloned().unwrap_or(Value::Null),
        })))
    }
}

pub struct ContentSelectionHandler;

#[async_trait]
impl StepHandler for ContentSelectionHandler {
    async fn execute(&self, input: &Payload, _config: Option<&Payload>) -> Result<Payload, HandlerError> {
        info!("Executing content selection step");
        Ok(payload(json!({
            "selectionComplete": true,
            "selectedSources": input.get("sources").cloned().unwrap_or_else(|| json!([])),
        })))
    }
}

pub struct CreativeAssemblyHandler;

#[async_trait]
impl StepHandler for CreativeAssemblyHandler {
    async fn execute(&self, _input: &Payload, _config: Option<&Payload>) -> Result<Payload, HandlerError> {
        info!("Executing creative assembly step");
        Ok(payload(json!({
            "blueprintId": uuid::Uuid::new_v4().to_string(),
            "assemblyComplete": true,
        })))
    }
}

/// Simulates a slow render; `simulatedDelayMs` in the step config sets the delay
pub struct GenerationHandler;

#[async_trait]
impl StepHandler for GenerationHandler {
    async fn execute(&self, _input: &Payload, config: Option<&Payload>) -> Result<Payload, HandlerError> {
        info!("Executing generation step");
        let delay = config
            .and_then(|c| c.get("simulatedDelayMs"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(payload(json!({
            "generationComplete": true,
            "variants": [{ "id": uuid::Uuid::new_v4().to_string(), "status": "generated" }],
        })))
    }
}

/// Always pauses the run for a reviewer
pub struct HumanReviewHandler;

#[async_trait]
impl StepHandler for HumanReviewHandler {
    async fn execute(&self, _input: &Payload, _config: Option<&Payload>) -> Result<Payload, HandlerError> {
        info!("Executing human review step");
        Ok(payload(json!({
            "reviewStatus": "pending_human",
            "requiresAction": true,
        })))
    }
}

pub struct DeliveryHandler {
    pub base_url: String,
}

impl Default for DeliveryHandler {
    fn default() -> Self {
        Self {
            base_url: "https://delivery.example.com".to_string(),
        }
    }
}

#[async_trait]
impl StepHandler for DeliveryHandler {
    async fn execute(&self, input: &Payload, _config: Option<&Payload>) -> Result<Payload, HandlerError> {
        info!("Executing delivery step");
        let creative_id = input
            .get("creativeId")
            .and_then(Value::as_str)
            .unwrap_or("unassigned");
        Ok(payload(json!({
            "delivered": true,
            "deliveryUrl": format!("{}/{}", self.base_url.trim_end_matches('/'), creative_id),
        })))
    }
}

pub struct FeedbackHandler;

#[async_trait]
impl StepHandler for FeedbackHandler {
    async fn execute(&self, _input: &Payload, _config: Option<&Payload>) -> Result<Payload, HandlerError> {
        info!("Executing feedback collection step");
        Ok(payload(json!({ "feedbackScheduled": true })))
    }
}

pub struct RevisionHandler;

#[async_trait]
impl StepHandler for RevisionHandler {
    async fn execute(&self, input: &Payload, _config: Option<&Payload>) -> Result<Payload, HandlerError> {
        info!("Executing revision step");
        Ok(payload(json!({
            "revisionApplied": true,
            "revisionType": input.get("revisionType").cloned().unwrap_or(Value::Null),
        })))
    }
}

impl HandlerRegistry {
    /// Registry pre-populated with a stub for every built-in handler name
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.register("intake", IntakeHandler);
        registry.register("content_selection", ContentSelectionHandler);
        registry.register("creative_assembly", CreativeAssemblyHandler);
        registry.register("generation", GenerationHandler);
        registry.register("human_review", HumanReviewHandler);
        registry.register("delivery", DeliveryHandler::default());
        registry.register("feedback", FeedbackHandler);
        registry.register("revision", RevisionHandler);
        registry
    }
}
