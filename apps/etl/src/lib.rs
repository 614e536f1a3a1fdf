//! Study intake ETL
//!
//! Receiving documents (clinical exports, REDCap data entry triggers,
//! presence/absence results) are reconciled into the warehouse by
//! revision-tagged routines, one savepoint per record. Manifest utilities
//! match clinical rows to LIMS barcodes and remove duplicates before the
//! rows are loaded.

pub mod assemble;
pub mod config;
pub mod db;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod identity;
pub mod lims;
pub mod logging;
pub mod manifest;
pub mod matching;
pub mod routines;
pub mod state;
pub mod vocab;

pub use error::{Error, Result};
