//! Core components and the plumbing between them.

pub mod basebackup;
pub mod catalog_service;
pub mod materializer;
pub mod metrics_ledger;
pub mod pipe;
pub mod s3_store;
pub mod storage_service;
pub mod transform;
