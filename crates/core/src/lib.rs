// Core engine for Stepflow deterministic workflows

pub mod context;
pub mod error;
pub mod events;
pub mod storage;
pub mod types;
pub mod workflow;

pub use context::{get_context, register_step_handler, AppContext};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use types::*;
pub use workflow::{
    register_builtin_handlers, ExecutionPlan, HandlerError, HandlerRegistry, RunExecutor,
    StepContext, StepHandler,
};
