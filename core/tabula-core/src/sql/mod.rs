//! Query language: parser, planner (lowering into [`Query`]) and executor.

pub mod executor;
pub mod parser;
pub mod planner;

pub use executor::{ExecutionOutput, PhysicalOperator, QueryExecutor};
pub use parser::{SqlParser, normalize};
pub use planner::{
    AggregateFunction, AggregateTarget, Condition, ConditionOperator, ConditionToken,
    ConditionValue, LogicalOperator, OrderBy, Query, QueryPlanner, SelectField, SortDirection,
};
