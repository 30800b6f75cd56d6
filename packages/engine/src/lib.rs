pub mod condition;
pub mod context;
pub mod cost;
pub mod engine;
pub mod error;
pub mod host;
pub mod template;

pub use context::ExecutionContext;
pub use engine::{EngineConfig, ExecutionObserver, ExecutionReport, StepReport, WorkflowEngine};
pub use error::{EngineError, HostError};
pub use host::{SamplingRequest, SamplingResponse, StepHost};
pub use template::TemplateCache;
