//! LoopBack-style query language: `where`, `fields`, `order`, `limit`, `skip`, `include`.

pub mod adapter;
pub mod builder;
pub mod error;
pub mod filter;
pub mod filter_order;
pub mod filter_where;
pub mod types;

pub use adapter::{is_object_id, to_document_query, DocumentQuery, FieldType, QuerySchema, QuerySink};
pub use builder::{FilterBuilder, MergeConfig, WhereBuilder, WhereOperator};
pub use error::FilterError;
pub use filter::{Filter, Include};
pub use filter_where::{Where, WhereValue};
pub use types::*;
