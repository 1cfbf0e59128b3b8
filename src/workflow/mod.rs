//! Workflow types and definitions
//!
//! This module contains the declarative side of the engine:
//! - `definition` - WorkflowDefinition and StepBlueprint
//! - `catalog` - Immutable catalog of definitions, including the built-ins
//! - `run` - WorkflowRun, WorkflowStep and WorkflowLog runtime records
//! - `loader` - Load definitions from files and directories
//! - `config` - Engine configuration

pub mod catalog;
pub mod config;
pub mod definition;
pub mod loader;
pub mod run;

pub use catalog::{CatalogBuilder, CatalogError, WorkflowCatalog, AD_PRODUCTION, REVISION};
pub use config::{CompensationConfig, EngineConfig, StoreConfig, WebhookConfig};
pub use definition::{DefinitionError, StepBlueprint, WorkflowDefinition};
pub use loader::{DefinitionLoader, LoadError};
pub use run::{
    LogLevel, Payload, RunStatus, StepStatus, WorkflowLog, WorkflowRun, WorkflowStep,
};
