//! Query engine: options, planning, and execution.

pub mod executor;
pub mod optimizer;
pub mod options;
pub mod plan;
pub mod stats;

pub use executor::{QueryExecutor, QueryResult};
pub use options::{Projection, QueryOptions, SortDirection, WriteOptions};
pub use plan::{QueryPlan, QueryStrategy, Suggestion, SuggestionKind};
pub use stats::TableStatistics;
