//! Continuous WAL archiving and point-in-time restore for PostgreSQL,
//! backed by an S3-compatible object store.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod services;
