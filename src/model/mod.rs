//! Core records shared by the submission path, the workers and the autoscaler.
//!
//! - `Execution`: one invocation of a user function and its status history
//! - `Function` / `Secret`: read-only catalog entries owned by users
//! - `FunctionInput`: the optional structured shape of an execution input

pub mod execution;
pub mod function;

pub use execution::{Execution, ExecutionStatus};
pub use function::{Function, FunctionInput, Secret};
