pub mod access;
pub mod bin_utils;
mod cond;
mod engine;
mod equality;
pub mod expr;
mod handler;
mod parse;
pub mod push;
mod pushed_join;
pub mod query_def;
mod table_map;
#[cfg(test)]
mod test_utils;
mod utils;

pub use access::{AccessType, IndexUse, JoinNest, JoinNestKind, QueryPlan, TableAccess, TableDef};
pub use cond::{CondPushdown, CondSplit, InterpretedCondPushdown};
pub use engine::{PushConfig, PushEngine, PushOutcome, PushStats};
pub use equality::EqualitySets;
pub use handler::TableHandler;
pub use parse::{ParseError, Parser};
pub use push::{NoPushReason, PushError};
pub use pushed_join::{ExternParam, FieldValues, PushedJoin};
pub use query_def::{QueryDef, QueryInstance};
pub use table_map::{TableMap, TableNo};
