//! Database facade: lifecycle, context, and API surfaces.

pub mod collection;
pub mod context;
pub mod database;

pub use collection::Collection;
pub use context::{DbContext, QueryStatsStore};
pub use database::{Database, Mutation};
