//! Joinery core: join descriptors over a cached object model.
//!
//! A *mapper* describes how objects of one entity relate to objects of
//! another (`Order.customerId = Customer.id`). Mappers are values: they
//! combine, reverse, filter and chain, and they can either resolve a join
//! against the object cache or describe it to a remote query builder.
//!
//! ## Module organization
//!
//! - `attribute` / `operation`: attributes (direct or reached through a
//!   mapper) and the predicate graph
//! - `mapper`: single-equality, composite and filtered join descriptors
//! - `stack`: chain positions inside a predicate graph
//! - `propagate`: transitive constant propagation across joins
//! - `asof`: temporal completeness checking and default-date injection
//! - `index` / `cache`: the cache-layer seam and memoized index handles
//! - `sql`: remote join generation
//! - `resolve`: end-to-end resolution (cache first, then SQL)

pub mod asof;
pub mod attribute;
pub mod cache;
pub mod config;
pub mod error;
pub mod index;
pub mod mapper;
pub mod operation;
pub mod propagate;
pub mod resolve;
pub mod sql;
pub mod stack;

#[cfg(test)]
mod test_support;

pub use asof::{AsOfAnalysis, AsOfEqualityChecker, AsOfPosition};
pub use attribute::{Attribute, MappedAttribute};
pub use cache::{CacheLayer, MapperContext};
pub use config::MapperConfig;
pub use error::{MapperError, Result};
pub use index::{CacheGeneration, IndexHandle, IndexMemo};
pub use mapper::{
    EqualityMapper, FilteredMapper, JoinIndex, Mapper, MultiEqualityMapper, RemoteReason,
    ResolutionPlan, TempJoinStep,
};
pub use operation::{CompareOp, MappedOperation, Operation};
pub use propagate::TransitivePropagator;
pub use resolve::{Resolution, Resolver};
pub use sql::{ColumnRef, JoinCondition, RemoteQueryBuilder, SqlQuery, SqlQueryBuilder, TableAlias};
pub use stack::MapperStack;
