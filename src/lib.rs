//! Persistence core of the template backend: connection pooling for a
//! relational store behind a proxy, blob ingestion into an object store, and
//! orchestration of the external schema-migration tool.

pub mod config;
pub mod ingest;
pub mod migrate;
pub mod model;
pub mod object_store;
pub mod pool;
pub mod repo;
pub mod staging;
pub mod store;
