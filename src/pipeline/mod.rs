//! Deployment pipeline: work items in, a [`DeploymentReport`] out.

pub mod backup;
pub mod breaker;
pub mod collaborators;
pub mod context;
pub mod orchestrator;
pub mod types;

pub use backup::{Backup, BackupEntry, BackupStore};
pub use breaker::CircuitBreaker;
pub use collaborators::{
    CodeGenerator, Collaborators, GenerationContext, IntegrationAnalyzer, IntegrationPlan,
    IntegrationStrategy, SafetyChecker, SafetyReport, StructureMapper, TextGenerator,
    VersionControl,
};
pub use orchestrator::{DeploymentPipeline, PipelineOptions};
pub use types::{DeploymentReport, DeploymentResult, Priority, WorkItem, WorkItemBatch};
