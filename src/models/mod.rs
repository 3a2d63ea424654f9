//! Core data models for the archiving agent.
//!
//! These are plain values: object keys and their layout in the backend,
//! catalog entries parsed from backup names, and metric records. None of
//! them perform I/O.

pub mod catalog;
pub mod metric;
pub mod object;
