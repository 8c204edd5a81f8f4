//! Push-down of joins to the storage nodes. The planner walks the plan left to right from a
//! candidate root, collects the tables which can be evaluated as children in one composite
//! query and assembles the query's operation tree.

mod assemble;
mod builder;
mod classify;
mod nest;
mod optimize;
mod table;

pub use builder::{NoPushReason, PushedBuilderCtx};
pub use table::PushedTable;

use crate::query_def::BuildError;
use std::fmt;

#[derive(Debug)]
pub enum PushError {
    /// Assembling the operation tree failed.
    Build(BuildError),
    /// Planner state which should not be possible.
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PushError>;

impl From<BuildError> for PushError {
    fn from(err: BuildError) -> Self {
        PushError::Build(err)
    }
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Build(err) => write!(f, "failed to build pushed join: {}", err),
            PushError::Internal(msg) => write!(f, "internal push planner error: {}", msg),
        }
    }
}

impl std::error::Error for PushError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PushError::Build(err) => Some(err),
            PushError::Internal(_) => None,
        }
    }
}
