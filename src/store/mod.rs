//! Storage layer (spec.md §4.2, §4.3).
//!
//! One `RwLock` per logical table, mirroring the teacher's `Database {
//! engine: RwLock<GraphEngine> }` convention — independent tables (Sample,
//! Function, Metadata, and each engine's private index) never serialize
//! each other's readers and writers.

pub mod function_store;
pub mod metadata_store;
pub mod user_store;

pub use function_store::{FunctionLookup, FunctionStore};
pub use metadata_store::MetadataStore;
pub use user_store::UserStore;
