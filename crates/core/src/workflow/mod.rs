// Workflow compilation and execution

pub mod builtin;
pub mod dag;
pub mod executor;
pub mod handler;
pub mod inputs;
pub mod registry;

pub use builtin::register_builtin_handlers;
pub use dag::{compile, ExecutionPlan};
pub use executor::RunExecutor;
pub use handler::{FnHandler, HandlerError, StepContext, StepHandler};
pub use registry::HandlerRegistry;
