// src/core/ranktable/mod.rs

//! Rank-table handling: the strict wire schema and the loader that turns a
//! validated table into nodes with stable ids.

pub mod loader;
pub mod schema;

pub use loader::{InstanceInfo, LoadedRankTable, RankTableLoader};
pub use schema::RankTableFile;
