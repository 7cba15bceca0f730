//! # nomina
//!
//! Batch payroll computation through a structured-output inference API.
//!
//! The pipeline validates each input record against the payroll input
//! schema, resolves missing fields according to the selected policy
//! (ask/default/fail), dispatches valid records to the external computation
//! service under a bounded worker pool, validates every response against
//! the result schema, and persists one file per successful record plus an
//! NDJSON error log for the rest.
//!
//! ## Modules
//!
//! - `config` - batch run configuration (CLI over environment)
//! - `dispatch` - bounded-concurrency batch dispatcher
//! - `error` - error taxonomy (record-level vs. fatal)
//! - `interaction` - terminal prompting behind a trait
//! - `output` - result files and the shared error log
//! - `preflight` - missing-field detection and region enrichment
//! - `resolve` - missing-field policies and resolvers
//! - `schema` - JSON Schema compilation and validation
//! - `service` - structured-output inference client

pub mod config;
pub mod dispatch;
pub mod error;
pub mod interaction;
pub mod output;
pub mod preflight;
pub mod resolve;
pub mod schema;
pub mod service;

pub use error::{NominaError, Result};
