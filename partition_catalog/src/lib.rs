//! The partition catalog, which keeps track of the partitions of every table a data source
//! exposes: their names, storage uris and creation dates. Partitions can be listed through
//! composable filters with sorting and paging, counted, looked up by uri and deleted in bulk.
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod interface;
pub mod mem;
pub mod postgres;
pub mod query;
pub mod sqlite;
pub mod types;

#[cfg(test)]
mod interface_tests;
