#![forbid(unsafe_code)]

//! Query lifecycle: parsing, rewriting, planning and execution.
//!
//! [`Query`] drives a query from text (or a serialized plan) to a committed
//! [`QueryResult`]; the other modules are the collaborators it hands work to.

/// String arena owned by a query.
pub mod arena;

/// Abstract syntax tree for the query language.
pub mod ast;

/// Bind parameter injection into a parsed AST.
pub mod bind;

/// Fault kinds raised while running a query.
pub mod errors;

/// Expression evaluation.
pub mod eval;

/// Execution engine.
///
/// Pulls batches of result values out of an optimized plan.
pub mod executor;

/// Built-in function library.
pub mod functions;

/// The query orchestrator.
pub mod lifecycle;

/// Execution plan nodes, cost estimates and the JSON plan format.
pub mod logical;

/// Lenient reading of per-query options.
pub mod options;

/// Query text parser.
pub mod parser;

/// Rule-based plan optimizer.
pub mod planner;

/// Phase timing.
pub mod profile;

/// The outcome value returned by every entry point.
pub mod result;

/// AST constant folding.
pub mod rewrite;

/// Runtime values.
pub mod value;

pub use errors::{QueryError, SyntaxError};
pub use executor::{Batch, ExecutionEngine, ExecutionStats};
pub use lifecycle::{Query, QuerySource};
pub use logical::ExecutionPlan;
pub use options::QueryOptions;
pub use planner::{Optimizer, RuleSet};
pub use profile::{LifecyclePhase, Profile, ProfileReport};
pub use result::QueryResult;
pub use value::Value;
