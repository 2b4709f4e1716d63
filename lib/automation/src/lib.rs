//! Playbook execution engine.
//!
//! A playbook is a user-authored directed graph: a trigger node feeding
//! typed step nodes (HTTP request, email, expression, condition) through
//! edges that condition nodes gate by boolean branch. The engine walks the
//! graph breadth-first, resolves `{{ ... }}` template expressions in each
//! node's config against the run's context, executes the step, and
//! persists per-node results after every step so a polling UI can watch a
//! run in flight.
//!
//! Execution is deliberately single-threaded per run: fanning out parallel
//! branches would complicate the log-visibility contract for no benefit at
//! playbook scale.

mod actions;
mod dispatcher;
mod engine;
mod types;
mod variable;

pub use dispatcher::{dispatch_by_incident, dispatch_manual};
pub use engine::Engine;
pub use types::{Edge, ExecutionContext, Node, NodeData, StepResult, StepStatus, WorkflowDefinition};
pub use variable::{eval_expression, resolve_variables};
